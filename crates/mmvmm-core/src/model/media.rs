use super::validate_media_path;
use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Disk,
    Cdrom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Raw,
    Qcow2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaInterface {
    Virtio,
    Ide,
    Floppy,
}

impl Default for MediaInterface {
    fn default() -> Self {
        MediaInterface::Virtio
    }
}

/// Media row, owned 1:N by Hardware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Media {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: MediaType,
    pub path: String,
    pub format: MediaFormat,
    pub readonly: bool,
    pub interface: MediaInterface,
    pub host_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaDescription {
    #[serde(rename = "type")]
    pub kind: MediaType,
    pub path: String,
    pub format: MediaFormat,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub interface: MediaInterface,
    #[serde(default)]
    pub host_cache: bool,
}

impl MediaDescription {
    pub fn validate(&self) -> Result<()> {
        validate_media_path(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_path() {
        let d = MediaDescription {
            kind: MediaType::Disk,
            path: "relative/path.img".into(),
            format: MediaFormat::Qcow2,
            readonly: false,
            interface: MediaInterface::Virtio,
            host_cache: false,
        };
        assert!(d.validate().is_err());
    }

    #[test]
    fn accepts_absolute_path() {
        let d = MediaDescription {
            kind: MediaType::Cdrom,
            path: "/iso/x.iso".into(),
            format: MediaFormat::Raw,
            readonly: true,
            interface: MediaInterface::Ide,
            host_cache: false,
        };
        assert!(d.validate().is_ok());
    }
}
