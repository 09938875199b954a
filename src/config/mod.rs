//! Configuration for the bridge
//!
//! Validated values parsed from the command line: role, peer/listen address,
//! the shared client identifier and interface options.

mod parser;

pub use parser::{BridgeConfig, ClientId, Role, DEFAULT_MTU};
