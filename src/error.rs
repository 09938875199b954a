//! Error types for udp-bridge

use std::net::SocketAddr;

use thiserror::Error;

/// Main error type for udp-bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Protocol errors (packet rejected)
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Tunnel errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid client_id: {value} (must be between 0 and 4294967295, both excluded)")]
    InvalidClientId { value: String },

    #[error("Invalid framing: {value} (expected 'raw' or 'af-prefix')")]
    InvalidFraming { value: String },
}

/// Reasons a packet is refused by the codec, the framing rule or the session policy.
///
/// None of these are fatal: the packet is dropped without a reply.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Packet truncated: {len} bytes is shorter than the {min} byte header")]
    Truncated { len: usize, min: usize },

    #[error("Client identity tag mismatch")]
    IdentityMismatch,

    #[error("Buffer too small: need {needed} bytes, have {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("Insufficient headroom: payload offset {offset} cannot hold a {needed} byte header")]
    InsufficientHeadroom { offset: usize, needed: usize },

    #[error("Not an IPv4 packet (version nibble {version})")]
    NotIpv4 { version: u8 },

    #[error("Unexpected address family marker {marker:02x?}")]
    UnexpectedFamily { marker: [u8; 4] },

    #[error("Stale generation {got} (current {current})")]
    StaleGeneration { got: u64, current: u64 },

    #[error("Foreign generation {got} (own {own})")]
    ForeignGeneration { got: u64, own: u64 },

    #[error("Sequence {sequence} not ahead of {current} and sent from unknown address {from}")]
    ReplayFromOtherAddress {
        sequence: u64,
        current: u64,
        from: SocketAddr,
    },

    #[error("No active session")]
    Inactive,
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Address resolution failed for {host}:{port}")]
    ResolutionFailed { host: String, port: u16 },

    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Connect to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },
}

/// Tunnel device errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to create TUN device: {reason}")]
    CreateFailed { reason: String },

    #[error("Insufficient privileges: {message}")]
    InsufficientPrivileges { message: String },
}

impl BridgeError {
    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Tunnel(TunnelError::InsufficientPrivileges { .. }) => {
                #[cfg(target_os = "linux")]
                return "Insufficient privileges. Run with sudo or grant CAP_NET_ADMIN:\n  \
                        sudo setcap cap_net_admin=eip ./udp-bridge"
                    .to_string();
                #[cfg(target_os = "macos")]
                return "Insufficient privileges. Run with sudo:\n  \
                        sudo ./udp-bridge [-s] <ip> <port> <client_id>"
                    .to_string();
                #[cfg(not(any(target_os = "linux", target_os = "macos")))]
                return format!("{}", self);
            }

            Self::Network(NetworkError::ResolutionFailed { host, port }) => {
                format!(
                    "Could not resolve {}:{}.\n  Check the address and try again.",
                    host, port
                )
            }

            Self::Network(NetworkError::BindFailed { addr, .. }) => {
                format!(
                    "Could not bind UDP socket on {}.\n  \
                    Check that the address is local and the port is free.",
                    addr
                )
            }

            Self::Config(ConfigError::InvalidClientId { value }) => {
                format!(
                    "Invalid client_id '{}'.\n  Expected a decimal number from 1 to 4294967294.",
                    value
                )
            }

            _ => format!("{}", self),
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Tunnel(TunnelError::InsufficientPrivileges { .. }) => 2,
            Self::Network(_) => 3,
            Self::Protocol(_) => 4,
            Self::Tunnel(_) => 6,
            Self::System(_) => 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_and_nonzero() {
        let errors = [
            BridgeError::from(ConfigError::InvalidClientId { value: "0".into() }),
            BridgeError::from(TunnelError::InsufficientPrivileges { message: "x".into() }),
            BridgeError::from(NetworkError::ResolutionFailed { host: "h".into(), port: 1 }),
            BridgeError::from(ProtocolError::Inactive),
            BridgeError::from(TunnelError::CreateFailed { reason: "x".into() }),
            BridgeError::from(std::io::Error::other("x")),
        ];

        let codes: Vec<i32> = errors.iter().map(|e| e.exit_code()).collect();
        assert!(codes.iter().all(|&c| c != 0));
        let mut dedup = codes.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), codes.len());
    }

    #[test]
    fn test_user_message_mentions_client_id() {
        let err = BridgeError::from(ConfigError::InvalidClientId { value: "abc".into() });
        assert!(err.user_message().contains("abc"));
    }
}
