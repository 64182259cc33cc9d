use super::dispatch::dispatch;
use super::protocol::{Request, Response};
use anyhow::{Context, Result};
use mmvmm_core::registry::Registry;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// Binds the control socket (spec.md §6: `$SOCKET_DIR/control.sock`,
/// permissions 0660). Split out from `serve` so the caller can observe a bind
/// failure synchronously, before doing anything else that would make the
/// daemon's non-zero exit on bind failure (spec.md §6 "Process lifecycle")
/// arrive late or not at all.
pub fn bind(socket_path: &Path) -> Result<UnixListener> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path).context("failed to remove stale control socket")?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create socket directory")?;
    }

    let listener = UnixListener::bind(socket_path).context("failed to bind control socket")?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))
        .context("failed to set control socket permissions")?;

    tracing::info!(path = %socket_path.display(), "listening on control socket");
    Ok(listener)
}

/// Serves line-delimited JSON requests on an already-bound `listener` until
/// `shutdown` resolves.
pub async fn serve(
    listener: UnixListener,
    registry: Arc<Registry>,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted.context("failed to accept connection")?;
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, registry).await {
                        tracing::debug!(error = %e, "control connection ended with an error");
                    }
                });
            }
            _ = &mut shutdown => {
                tracing::info!("control socket shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, registry: Arc<Registry>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(req) => {
                tracing::debug!(method = %req.method, target = ?req.target, "handling RPC request");
                match dispatch(&registry, req).await {
                    Ok(result) => Response::ok(result),
                    Err(e) => Response::err(&e),
                }
            }
            Err(e) => Response::Err {
                ok: false,
                error: super::protocol::ErrorEnvelope {
                    kind: "Validation".to_string(),
                    message: format!("malformed request: {e}"),
                },
            },
        };

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        write_half.write_all(&out).await?;
    }

    Ok(())
}
