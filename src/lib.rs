//! Host and plugin glue for the `cd_executor` plugin.
//!
//! The protocol machinery lives in [`plugin_bridge`]; this crate holds what
//! the two binaries share: handshake constants, logging setup and the
//! executor the plugin serves.

pub mod config;
pub mod executor;
pub mod logger;
