use crate::client::Client;
use crate::format;
use crate::OutputFormat;
use anyhow::Result;
use serde_json::Value;

pub async fn execute(client: &Client, output_format: &OutputFormat) -> Result<()> {
    let result = client.registry_call("get_vm_list", Value::Null).await?;

    match output_format {
        OutputFormat::Json => format::print_json(&result),
        OutputFormat::Table => {
            let names: Vec<String> = serde_json::from_value(result)?;
            format::print_vm_list(&names);
        }
    }

    Ok(())
}
