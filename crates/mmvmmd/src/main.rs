use anyhow::{Context, Result};
use mmvmm_core::registry::{Registry, SupervisorConfig};
use mmvmm_core::store::Store;
use std::sync::Arc;
use tracing::info;

mod config;
mod rpc;
mod signals;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("starting mmvmmd");

    let config = Config::from_env();
    let pid_path = write_pid_file(&config)?;

    let store = Store::open(&config.database_path()).context("failed to open persistent store")?;

    let supervisor_config = SupervisorConfig {
        qemu_path: config.qemu_path.clone(),
        socket_dir: config.socket_dir.clone(),
        ip_path: config.ip_path.clone(),
    };

    let registry = Registry::start(store, supervisor_config)
        .await
        .context("failed to reconcile VM registry with the persistent store")?;
    registry.spawn_respawn_task().await;

    let socket_path = config.control_socket_path();

    // Bind synchronously so a failure here is observed and acted on before
    // autostart or signal handling ever run — spec.md §6 requires a non-zero
    // exit specifically "on failure to bind the RPC socket".
    let listener = match rpc::bind(&socket_path) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind control socket");
            let _ = std::fs::remove_file(&pid_path);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let server_registry = Arc::clone(&registry);
    let mut server_task = tokio::spawn(async move { rpc::serve(listener, server_registry, shutdown_rx).await });

    registry.autostart().await.context("autostart phase failed")?;
    info!("autostart phase complete, accepting RPC connections");

    tokio::select! {
        _ = signals::wait_for_shutdown_signal() => {
            info!("draining VMs");
            registry.close().await;
            let _ = shutdown_tx.send(());
            match (&mut server_task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "RPC server exited with an error"),
                Err(e) => tracing::error!(error = %e, "RPC server task panicked"),
            }
        }
        result = &mut server_task => {
            // The accept loop never returns on its own except through the
            // shutdown channel, so reaching this arm means it died early —
            // e.g. the listener itself failed. Drain what we can and exit
            // non-zero rather than idling forever with no RPC surface.
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "RPC server exited unexpectedly"),
                Err(e) => tracing::error!(error = %e, "RPC server task panicked"),
            }
            registry.close().await;
            let _ = std::fs::remove_file(&socket_path);
            let _ = std::fs::remove_file(&pid_path);
            std::process::exit(1);
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    let _ = std::fs::remove_file(&pid_path);

    info!("mmvmmd exited cleanly");
    Ok(())
}

fn write_pid_file(config: &Config) -> Result<std::path::PathBuf> {
    std::fs::create_dir_all(&config.socket_dir).context("failed to create SOCKET_DIR")?;
    let pid_path = config.socket_dir.join("mmvmmd.pid");
    std::fs::write(&pid_path, std::process::id().to_string()).context("failed to write PID file")?;
    Ok(pid_path)
}
