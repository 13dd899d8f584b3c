//! CAPI Gateway - ISDN call control over CAPI 2.0
//!
//! A telephony engine that drives calls on ISDN adapters through the
//! vendor-neutral CAPI 2.0 message protocol. A single dispatch thread
//! multiplexes signaling and voice messages onto per-call state machines
//! while host threads issue dial/answer/hangup/write operations against
//! the same call records.

pub mod capi;
pub mod config;
pub mod core;
pub mod error;
pub mod media;
pub mod utils;

pub use error::{Error, Result};

/// Gateway version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
