//! Bridge configuration values and their parsing
//!
//! The command line carries `[-s] <ip> <port> <client_id>` plus a handful of
//! interface options. Everything is validated here, before any socket or
//! interface is touched.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use ipnet::Ipv4Net;

use crate::error::{ConfigError, NetworkError};
use crate::tunnel::Framing;

/// Default MTU for the tunneled interface (leaves room for our header and UDP/IP)
pub const DEFAULT_MTU: u16 = 1448;

/// Shared tunnel identifier
///
/// Both ends must be configured with the same value. `0` and `u32::MAX` are
/// reserved and never valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u32);

impl ClientId {
    /// Wrap a raw identifier, rejecting the reserved values
    pub fn new(value: u32) -> Option<Self> {
        if value == 0 || value == u32::MAX {
            None
        } else {
            Some(Self(value))
        }
    }

    /// Raw identifier value
    pub fn get(self) -> u32 {
        self.0
    }
}

impl FromStr for ClientId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidClientId {
            value: s.to_string(),
        };

        let value: u32 = s.trim().parse().map_err(|_| invalid())?;
        Self::new(value).ok_or_else(invalid)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which end of the tunnel this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connects to a fixed server address
    Client,
    /// Binds the given address and follows the client wherever it roams
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Complete bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Client or server
    pub role: Role,
    /// Peer host (client) or bind host (server)
    pub host: String,
    /// Peer port (client) or bind port (server)
    pub port: u16,
    /// Shared tunnel identifier
    pub client_id: ClientId,
    /// Interface MTU
    pub mtu: u16,
    /// Interface address; when absent the interface is left for manual setup
    pub address: Option<Ipv4Net>,
    /// Requested interface name
    pub name: Option<String>,
    /// Address-family framing used by the interface
    pub framing: Framing,
}

impl BridgeConfig {
    /// Create a configuration with default interface options
    pub fn new(role: Role, host: impl Into<String>, port: u16, client_id: ClientId) -> Self {
        Self {
            role,
            host: host.into(),
            port,
            client_id,
            mtu: DEFAULT_MTU,
            address: None,
            name: None,
            framing: Framing::native(),
        }
    }

    /// Resolve `host:port` to the first socket address it names
    pub async fn resolve(&self) -> Result<SocketAddr, NetworkError> {
        let failed = || NetworkError::ResolutionFailed {
            host: self.host.clone(),
            port: self.port,
        };

        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                tracing::debug!("lookup of {}:{} failed: {}", self.host, self.port, e);
                failed()
            })?
            .next()
            .ok_or_else(failed)
    }
}
