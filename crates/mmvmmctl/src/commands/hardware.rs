use crate::client::Client;
use anyhow::Result;
use serde_json::{json, Value};

pub async fn add_nic(client: &Client, name: String, mac: String, master: String, mtu: u32) -> Result<()> {
    let desc = json!({ "mac": mac, "master": master, "mtu": mtu });
    let id = client.vm_call(&name, "add_nic", desc).await?;
    println!("added nic {id} to {name}");
    Ok(())
}

pub async fn del_nic(client: &Client, name: String, nic_id: i64) -> Result<()> {
    client.vm_call(&name, "del_nic", json!({ "nic_id": nic_id })).await?;
    println!("removed nic {nic_id} from {name}");
    Ok(())
}

pub async fn add_media(
    client: &Client,
    name: String,
    kind: String,
    path: String,
    format: String,
    readonly: bool,
) -> Result<()> {
    let desc = json!({ "type": kind, "path": path, "format": format, "readonly": readonly });
    let id = client.vm_call(&name, "add_media", desc).await?;
    println!("added media {id} to {name}");
    Ok(())
}

pub async fn del_media(client: &Client, name: String, media_id: i64) -> Result<()> {
    client
        .vm_call(&name, "del_media", json!({ "media_id": media_id }))
        .await?;
    println!("removed media {media_id} from {name}");
    Ok(())
}

pub async fn update_hardware(client: &Client, name: String, description_path: std::path::PathBuf) -> Result<()> {
    let body = std::fs::read_to_string(&description_path)?;
    let description: Value = serde_json::from_str(&body)?;
    client.vm_call(&name, "update_hardware", description).await?;
    println!("updated hardware for {name}");
    Ok(())
}
