use thiserror::Error;

/// Error kinds surfaced to RPC callers and logged at the event-loop boundary.
///
/// Variants map onto the error kinds in spec.md §7, not onto arbitrary Rust
/// types — callers match on `kind()` rather than the variant itself.
#[derive(Error, Debug)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown VM: {0}")]
    UnknownVm(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("VM is running")]
    VmRunning,

    #[error("VM is not running")]
    VmNotRunning,

    #[error("duplicate VM name: {0}")]
    DuplicateName(String),

    #[error("host network operation failed: {0}")]
    HostNetworkError(String),

    #[error("QMP connection error: {0}")]
    QmpConnectionError(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable, wire-safe identifier for this error's kind, used in the RPC
    /// error envelope (`{"error": {"kind": ..., "message": ...}}`).
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "Validation",
            Error::UnknownVm(_) => "UnknownVM",
            Error::UnknownCommand(_) => "UnknownCommand",
            Error::VmRunning => "VMRunning",
            Error::VmNotRunning => "VMNotRunning",
            Error::DuplicateName(_) => "DuplicateName",
            Error::HostNetworkError(_) => "HostNetworkError",
            Error::QmpConnectionError(_) => "QmpConnectionError",
            Error::Internal(_) => "Internal",
            Error::Database(_) => "Internal",
            Error::Io(_) => "Internal",
            Error::Serialization(_) => "Internal",
        }
    }
}
