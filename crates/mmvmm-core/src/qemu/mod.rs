//! QEMU process and protocol plumbing (spec.md §4.3, §6).

mod config;
mod process;
mod qmp;

pub use config::build_argv;
pub use process::QemuProcess;
pub use qmp::{allocate_socket_path, QmpEvent, QmpMonitor};
