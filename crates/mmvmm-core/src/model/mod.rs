//! The relational data model described in spec.md §3: VM, Hardware, NIC and
//! Media, plus the VM status state machine.

mod hardware;
mod media;
mod nic;
mod vm;

pub use hardware::{Hardware, HardwareDescription};
pub use media::{Media, MediaDescription, MediaFormat, MediaInterface, MediaType};
pub use nic::{Nic, NicDescription, NicModel};
pub use vm::{Status, Vm, VmDescription};

use crate::error::{Error, Result};
use regex::Regex;
use std::sync::OnceLock;

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9]*$").unwrap())
}

fn mac_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").unwrap())
}

fn path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/+[^\0]+$").unwrap())
}

/// Validate a VM name against spec.md §3: `^[a-z][a-z0-9]*$`, length 1..42.
pub fn validate_vm_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 42 {
        return Err(Error::Validation(format!(
            "VM name must be 1..42 characters, got {}",
            name.len()
        )));
    }
    if !name_re().is_match(name) {
        return Err(Error::Validation(format!(
            "VM name '{name}' does not match ^[a-z][a-z0-9]*$"
        )));
    }
    Ok(())
}

pub(crate) fn validate_mac(mac: &str) -> Result<()> {
    if !mac_re().is_match(mac) {
        return Err(Error::Validation(format!(
            "MAC address '{mac}' is not of the form xx:xx:xx:xx:xx:xx"
        )));
    }
    Ok(())
}

pub(crate) fn validate_media_path(path: &str) -> Result<()> {
    if path.len() > 4096 || !path_re().is_match(path) {
        return Err(Error::Validation(format!(
            "media path '{path}' must be absolute and at most 4096 bytes"
        )));
    }
    Ok(())
}
