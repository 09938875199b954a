//! udp-bridge - Point-to-point IP tunnel over UDP
//!
//! Carries IPv4 packets between a TUN interface and one UDP peer, with a
//! lightweight per-packet obfuscation layer.
//!
//! # Features
//!
//! - 24-byte header keyed by a random nonce and a shared client id
//! - Payload whitening (obfuscation only, no confidentiality)
//! - Generation-based session takeover when the client restarts
//! - Replay filtering and client roaming on the server
//! - Idle session expiry
//! - Cross-platform TUN device support (macOS, Linux)
//!
//! # Usage
//!
//! ```no_run
//! use udp_bridge::{BridgeClient, BridgeConfig, ClientId, Role};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), udp_bridge::BridgeError> {
//!     let id: ClientId = "42".parse()?;
//!     let config = BridgeConfig::new(Role::Client, "203.0.113.5", 8787, id);
//!     let mut client = BridgeClient::new(&config).await?;
//!     client.run().await
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod tunnel;

pub use client::BridgeClient;
pub use config::{BridgeConfig, ClientId, Role};
pub use error::BridgeError;
pub use server::BridgeServer;
