use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    target: Option<&'a str>,
    method: &'a str,
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireResponse {
    Ok { ok: bool, result: Value },
    Err { ok: bool, error: WireError },
}

#[derive(Debug, Deserialize)]
struct WireError {
    kind: String,
    message: String,
}

/// A connection to one `mmvmmd` control socket. Opens a fresh Unix stream per
/// call — the daemon's RPC framing tolerates either (spec.md §6).
pub struct Client {
    socket_path: PathBuf,
}

impl Client {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    async fn call(&self, target: Option<&str>, method: &str, args: Value) -> Result<Value> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("failed to connect to {}", self.socket_path.display()))?;

        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let request = WireRequest { target, method, args };
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        write_half.write_all(&line).await?;

        let response_line = lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("mmvmmd closed the connection without a response"))?;

        match serde_json::from_str::<WireResponse>(&response_line)? {
            WireResponse::Ok { result, .. } => Ok(result),
            WireResponse::Err { error, .. } => Err(anyhow!("{}: {}", error.kind, error.message)),
        }
    }

    pub async fn registry_call(&self, method: &str, args: Value) -> Result<Value> {
        self.call(None, method, args).await
    }

    pub async fn vm_call(&self, vm_name: &str, method: &str, args: Value) -> Result<Value> {
        self.call(Some(vm_name), method, args).await
    }
}

pub fn default_socket_path() -> PathBuf {
    std::env::var("SOCKET_DIR")
        .map(|dir| Path::new(&dir).join("control.sock"))
        .unwrap_or_else(|_| PathBuf::from("/run/mmvmm/control.sock"))
}
