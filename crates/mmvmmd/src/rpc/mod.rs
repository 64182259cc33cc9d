//! Control RPC: line-delimited JSON over a Unix domain socket (spec.md §6,
//! SPEC_FULL.md "RPC wire format").

mod dispatch;
mod protocol;
mod server;

pub use server::{bind, serve};
