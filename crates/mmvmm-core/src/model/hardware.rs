use super::{Media, MediaDescription, Nic, NicDescription};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 1:1 owned Hardware row (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hardware {
    pub ram_m: u32,
    pub cpus: u32,
    pub boot: char,
    pub rtc_utc: bool,
    pub product_uuid: Uuid,
    pub nics: Vec<Nic>,
    pub media: Vec<Media>,
}

/// Client-submitted hardware description, validated on entry into the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareDescription {
    pub ram_m: u32,
    pub cpus: u32,
    #[serde(default = "default_boot")]
    pub boot: char,
    #[serde(default = "default_true")]
    pub rtc_utc: bool,
    #[serde(default)]
    pub nics: Vec<NicDescription>,
    #[serde(default)]
    pub media: Vec<MediaDescription>,
}

fn default_boot() -> char {
    'd'
}

fn default_true() -> bool {
    true
}

impl HardwareDescription {
    pub fn validate(&self) -> Result<()> {
        if self.ram_m < 1 {
            return Err(Error::Validation("ram_m must be >= 1".into()));
        }
        if self.cpus < 1 {
            return Err(Error::Validation("cpus must be >= 1".into()));
        }
        if !matches!(self.boot, 'c' | 'n' | 'd') {
            return Err(Error::Validation(format!(
                "boot must be one of 'c', 'n', 'd', got '{}'",
                self.boot
            )));
        }
        for nic in &self.nics {
            nic.validate()?;
        }
        for media in &self.media {
            media.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> HardwareDescription {
        HardwareDescription {
            ram_m: 128,
            cpus: 1,
            boot: 'd',
            rtc_utc: true,
            nics: vec![],
            media: vec![],
        }
    }

    #[test]
    fn rejects_zero_ram_and_cpus() {
        let mut d = base();
        d.ram_m = 0;
        assert!(d.validate().is_err());

        let mut d = base();
        d.cpus = 0;
        assert!(d.validate().is_err());
    }

    #[test]
    fn rejects_bad_boot_device() {
        let mut d = base();
        d.boot = 'x';
        assert!(d.validate().is_err());
    }

    #[test]
    fn accepts_minimal_valid_hardware() {
        assert!(base().validate().is_ok());
    }
}
