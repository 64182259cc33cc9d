//! Host-side network resource management (spec.md §4.1).

mod tap;

pub use tap::{TapDevice, TapManager};
