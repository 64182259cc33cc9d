use super::protocol::Request;
use mmvmm_core::error::{Error, Result};
use mmvmm_core::model::{HardwareDescription, MediaDescription, NicDescription, VmDescription};
use mmvmm_core::registry::Registry;
use serde_json::{json, Value};
use std::sync::Arc;

/// Executes one request against the registry and returns its `result` value,
/// or the `Error` to be wrapped in the RPC error envelope.
pub async fn dispatch(registry: &Arc<Registry>, req: Request) -> Result<Value> {
    match req.target {
        None => dispatch_registry(registry, &req.method, req.args).await,
        Some(name) => dispatch_vm(registry, &name, &req.method, req.args).await,
    }
}

async fn dispatch_registry(registry: &Arc<Registry>, method: &str, args: Value) -> Result<Value> {
    match method {
        "new" => {
            let desc: VmDescription = serde_json::from_value(args)?;
            let id = registry.new_vm(desc).await?;
            Ok(json!(id))
        }
        "delete" => {
            let name = arg_str(&args, "vm_name")?;
            registry.delete_vm(&name).await?;
            Ok(Value::Null)
        }
        "get_vm_list" => {
            let rows = registry.store().list_vms()?;
            Ok(json!(rows.into_iter().map(|r| r.name).collect::<Vec<_>>()))
        }
        other => Err(Error::UnknownCommand(other.to_string())),
    }
}

async fn dispatch_vm(registry: &Arc<Registry>, name: &str, method: &str, args: Value) -> Result<Value> {
    let handle = registry.handle_by_name(name).await?;

    match method {
        "start" => {
            handle.start().await?;
            Ok(Value::Null)
        }
        "poweroff" => {
            handle.poweroff().await?;
            Ok(Value::Null)
        }
        "reset" => {
            handle.reset().await?;
            Ok(Value::Null)
        }
        "terminate" => {
            let kill = args.get("kill").and_then(Value::as_bool).unwrap_or(false);
            handle.terminate(kill).await?;
            Ok(Value::Null)
        }
        "pause" => {
            handle.pause().await?;
            Ok(Value::Null)
        }
        "resume" => {
            handle.resume().await?;
            Ok(Value::Null)
        }
        "is_running" => Ok(json!(handle.is_running().await?)),
        "info" => Ok(serde_json::to_value(handle.info().await?)?),
        "set_autostart" => {
            let autostart = args.get("autostart").and_then(Value::as_bool).unwrap_or(false);
            handle.set_autostart(autostart).await?;
            Ok(Value::Null)
        }
        "update_hardware" => {
            let desc: HardwareDescription = serde_json::from_value(args)?;
            handle.update_hardware(desc).await?;
            Ok(Value::Null)
        }
        "add_nic" => {
            let desc: NicDescription = serde_json::from_value(args)?;
            Ok(json!(handle.add_nic(desc).await?))
        }
        "del_nic" => {
            let nic_id = arg_i64(&args, "nic_id")?;
            handle.del_nic(nic_id).await?;
            Ok(Value::Null)
        }
        "add_media" => {
            let desc: MediaDescription = serde_json::from_value(args)?;
            Ok(json!(handle.add_media(desc).await?))
        }
        "del_media" => {
            let media_id = arg_i64(&args, "media_id")?;
            handle.del_media(media_id).await?;
            Ok(Value::Null)
        }
        other => Err(Error::UnknownCommand(other.to_string())),
    }
}

fn arg_str(args: &Value, key: &str) -> Result<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Validation(format!("missing string argument `{key}`")))
}

fn arg_i64(args: &Value, key: &str) -> Result<i64> {
    args.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Validation(format!("missing integer argument `{key}`")))
}
