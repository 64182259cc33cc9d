use super::validate_mac;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// NIC model, default `virtio-net` (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NicModel {
    VirtioNet,
    Sungem,
    UsbNet,
    Rtl8139,
    Pcnet,
    E1000,
}

impl Default for NicModel {
    fn default() -> Self {
        NicModel::VirtioNet
    }
}

impl NicModel {
    /// The literal string QEMU expects on `-device <model>,...`.
    pub fn qemu_name(self) -> &'static str {
        match self {
            NicModel::VirtioNet => "virtio-net",
            NicModel::Sungem => "sungem",
            NicModel::UsbNet => "usb-net",
            NicModel::Rtl8139 => "rtl8139",
            NicModel::Pcnet => "pcnet",
            NicModel::E1000 => "e1000",
        }
    }
}

/// NIC row, owned 1:N by Hardware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nic {
    pub id: i64,
    pub model: NicModel,
    pub mac: String,
    pub master: String,
    pub mtu: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicDescription {
    #[serde(default)]
    pub model: NicModel,
    pub mac: String,
    pub master: String,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
}

fn default_mtu() -> u32 {
    1500
}

impl NicDescription {
    pub fn validate(&self) -> Result<()> {
        validate_mac(&self.mac)?;
        if self.master.is_empty() {
            return Err(Error::Validation("NIC master bridge must not be empty".into()));
        }
        if self.mtu < 1 {
            return Err(Error::Validation("NIC mtu must be >= 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_mac() {
        let d = NicDescription {
            model: NicModel::VirtioNet,
            mac: "not-a-mac".into(),
            master: "br0".into(),
            mtu: 1500,
        };
        assert!(d.validate().is_err());
    }

    #[test]
    fn accepts_valid_nic() {
        let d = NicDescription {
            model: NicModel::VirtioNet,
            mac: "52:54:00:12:34:56".into(),
            master: "br0".into(),
            mtu: 1500,
        };
        assert!(d.validate().is_ok());
    }

    #[test]
    fn rejects_empty_master() {
        let d = NicDescription {
            model: NicModel::VirtioNet,
            mac: "52:54:00:12:34:56".into(),
            master: "".into(),
            mtu: 1500,
        };
        assert!(d.validate().is_err());
    }
}
