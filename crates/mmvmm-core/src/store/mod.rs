//! SQLite persistence adapter for VM/Hardware/NIC/Media rows (spec.md §3, §6).

mod db;

pub use db::{Store, VmRow};
