use crate::client::Client;
use anyhow::Result;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

pub async fn new(client: &Client, description_path: &Path) -> Result<()> {
    let body = fs::read_to_string(description_path)?;
    let description: Value = serde_json::from_str(&body)?;
    let id = client.registry_call("new", description).await?;
    println!("created VM with id {id}");
    Ok(())
}

pub async fn delete(client: &Client, name: String) -> Result<()> {
    client.registry_call("delete", json!({ "vm_name": name })).await?;
    println!("deleted {name}");
    Ok(())
}

pub async fn start(client: &Client, name: String) -> Result<()> {
    client.vm_call(&name, "start", Value::Null).await?;
    println!("started {name}");
    Ok(())
}

pub async fn poweroff(client: &Client, name: String) -> Result<()> {
    client.vm_call(&name, "poweroff", Value::Null).await?;
    println!("powered off {name}");
    Ok(())
}

pub async fn reset(client: &Client, name: String) -> Result<()> {
    client.vm_call(&name, "reset", Value::Null).await?;
    println!("reset {name}");
    Ok(())
}

pub async fn terminate(client: &Client, name: String, kill: bool) -> Result<()> {
    client.vm_call(&name, "terminate", json!({ "kill": kill })).await?;
    println!("terminated {name}");
    Ok(())
}

pub async fn pause(client: &Client, name: String) -> Result<()> {
    client.vm_call(&name, "pause", Value::Null).await?;
    println!("paused {name}");
    Ok(())
}

pub async fn resume(client: &Client, name: String) -> Result<()> {
    client.vm_call(&name, "resume", Value::Null).await?;
    println!("resumed {name}");
    Ok(())
}

pub async fn set_autostart(client: &Client, name: String, autostart: bool) -> Result<()> {
    client
        .vm_call(&name, "set_autostart", json!({ "autostart": autostart }))
        .await?;
    println!("autostart for {name} set to {autostart}");
    Ok(())
}
