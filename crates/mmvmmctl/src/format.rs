use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use serde_json::Value;

pub fn print_json(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap());
}

pub fn print_vm_list(names: &[String]) {
    if names.is_empty() {
        println!("No VMs found.");
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["NAME"]);

    for name in names {
        table.add_row(vec![name.clone()]);
    }

    println!("{table}");
}

pub fn print_vm_info(vm: &Value) {
    println!("VM: {}", vm.get("name").and_then(Value::as_str).unwrap_or("?"));
    println!("  ID:        {}", vm.get("id").map(Value::to_string).unwrap_or_default());
    println!(
        "  Status:    {}",
        vm.get("status").and_then(Value::as_str).unwrap_or("?")
    );
    println!(
        "  PID:       {}",
        vm.get("pid")
            .filter(|v| !v.is_null())
            .map(Value::to_string)
            .unwrap_or_else(|| "-".to_string())
    );
    println!(
        "  Autostart: {}",
        vm.get("autostart").and_then(Value::as_bool).unwrap_or(false)
    );

    if let Some(hardware) = vm.get("hardware") {
        println!("  Hardware:");
        println!("    RAM:   {} MiB", hardware.get("ram_m").map(Value::to_string).unwrap_or_default());
        println!("    CPUs:  {}", hardware.get("cpus").map(Value::to_string).unwrap_or_default());
        println!("    Boot:  {}", hardware.get("boot").and_then(Value::as_str).unwrap_or("?"));

        if let Some(nics) = hardware.get("nics").and_then(Value::as_array) {
            println!("    NICs:  {}", nics.len());
        }
        if let Some(media) = hardware.get("media").and_then(Value::as_array) {
            println!("    Media: {}", media.len());
        }
    }
}
