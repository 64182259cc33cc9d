use crate::error::{Error, Result};
use std::process::Command;
use std::sync::Mutex;

/// Serializes every iproute2-style invocation across all VMs (spec.md §4.1:
/// "each guarded by one process-wide mutex").
static IP_LOCK: Mutex<()> = Mutex::new(());

/// Runs host TAP device lifecycle commands via the `ip` binary.
///
/// `ip_path` is configurable (spec.md §6 `IP_PATH`) so tests can point it at
/// a stub binary instead of requiring root and a real bridge.
#[derive(Debug, Clone)]
pub struct TapManager {
    ip_path: String,
}

impl TapManager {
    pub fn new(ip_path: impl Into<String>) -> Self {
        Self {
            ip_path: ip_path.into(),
        }
    }

    /// `mmvmm{nic_id}` — deterministic and collision-free because nic_id is
    /// the SQLite-assigned primary key (spec.md §4.1, §3 invariant).
    pub fn device_name(nic_id: i64) -> String {
        format!("mmvmm{nic_id}")
    }

    /// Create and configure a TAP device for the given NIC. On any failure,
    /// best-effort tears down whatever partial state was created and returns
    /// `HostNetworkError`.
    pub fn create(&self, nic_id: i64, master: &str, mtu: u32) -> Result<TapDevice> {
        let _guard = IP_LOCK.lock().unwrap();
        let name = Self::device_name(nic_id);

        if let Err(e) = self.run(&["tuntap", "add", "name", &name, "mode", "tap"]) {
            return Err(e);
        }

        if let Err(e) = self.run(&["link", "set", &name, "master", master]) {
            let _ = self.run(&["tuntap", "del", "name", &name, "mode", "tap"]);
            return Err(e);
        }

        if let Err(e) = self.run(&["link", "set", &name, "mtu", &mtu.to_string()]) {
            let _ = self.run(&["tuntap", "del", "name", &name, "mode", "tap"]);
            return Err(e);
        }

        if let Err(e) = self.run(&["link", "set", &name, "up"]) {
            let _ = self.run(&["tuntap", "del", "name", &name, "mode", "tap"]);
            return Err(e);
        }

        Ok(TapDevice {
            name,
            manager: self.clone(),
            freed: false,
        })
    }

    fn update_master(&self, name: &str, master: &str) -> Result<()> {
        let _guard = IP_LOCK.lock().unwrap();
        self.run(&["link", "set", name, "master", master])
    }

    fn free(&self, name: &str) -> Result<()> {
        let _guard = IP_LOCK.lock().unwrap();
        // Best-effort on the "down" step; the device is gone regardless once
        // `tuntap del` succeeds.
        let _ = self.run(&["link", "set", name, "down"]);
        self.run(&["tuntap", "del", "name", name, "mode", "tap"])
    }

    fn run(&self, args: &[&str]) -> Result<()> {
        let output = Command::new(&self.ip_path)
            .args(args)
            .output()
            .map_err(|e| Error::HostNetworkError(format!("failed to exec {}: {e}", self.ip_path)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::HostNetworkError(format!(
                "`{} {}` failed: {stderr}",
                self.ip_path,
                args.join(" ")
            )));
        }
        Ok(())
    }
}

/// A live TAP device handle. `free()` tears it down; after that, the handle
/// is inert (spec.md §4.1: "after free, further calls on the handle fail").
#[derive(Debug)]
pub struct TapDevice {
    name: String,
    manager: TapManager,
    freed: bool,
}

impl TapDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn update_master(&mut self, master: &str) -> Result<()> {
        if self.freed {
            return Err(Error::HostNetworkError(format!(
                "TAP device {} already freed",
                self.name
            )));
        }
        self.manager.update_master(&self.name, master)
    }

    pub fn free(mut self) -> Result<()> {
        self.take_down()
    }

    fn take_down(&mut self) -> Result<()> {
        if self.freed {
            return Ok(());
        }
        self.manager.free(&self.name)?;
        self.freed = true;
        Ok(())
    }
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        if !self.freed {
            if let Err(e) = self.take_down() {
                tracing::warn!(device = %self.name, error = %e, "failed to free TAP device on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_name_is_pure_function_of_nic_id() {
        assert_eq!(TapManager::device_name(7), "mmvmm7");
        assert_eq!(TapManager::device_name(7), TapManager::device_name(7));
        assert_ne!(TapManager::device_name(7), TapManager::device_name(8));
    }

    #[test]
    fn create_fails_cleanly_without_a_real_ip_binary() {
        let mgr = TapManager::new("/nonexistent/ip");
        let result = mgr.create(1, "br0", 1500);
        assert!(matches!(result, Err(Error::HostNetworkError(_))));
    }
}
