use crate::client::Client;
use crate::format;
use crate::OutputFormat;
use anyhow::Result;
use serde_json::Value;

pub async fn execute(client: &Client, name: String, output_format: &OutputFormat) -> Result<()> {
    let result = client.vm_call(&name, "info", Value::Null).await?;

    match output_format {
        OutputFormat::Json => format::print_json(&result),
        OutputFormat::Table => format::print_vm_info(&result),
    }

    Ok(())
}

pub async fn is_running(client: &Client, name: String) -> Result<()> {
    let result = client.vm_call(&name, "is_running", Value::Null).await?;
    println!("{}", if result.as_bool().unwrap_or(false) { "running" } else { "stopped" });
    Ok(())
}
