//! TUN device abstraction layer
//!
//! Provides the [`PacketDevice`] seam the forwarding engines read and write
//! through, and a tun-rs backed implementation for macOS (utun) and Linux
//! (/dev/net/tun).

mod framing;
#[cfg(test)]
pub(crate) mod memory;

use std::io;
use std::ops::Deref;

use async_trait::async_trait;
use tun_rs::{AsyncDevice, DeviceBuilder};

use crate::config::{BridgeConfig, Role};
use crate::error::{BridgeError, TunnelError};

pub use framing::{Framing, AF_INET_MARKER, AF_PREFIX_LEN};

/// A virtual interface carrying one IP packet per read or write
#[async_trait]
pub trait PacketDevice: Send + Sync {
    /// Interface name (e.g., "utun5", "tun0")
    fn name(&self) -> &str;

    /// Address-family framing of the packets this device delivers
    fn framing(&self) -> Framing;

    /// Read one packet into `buf`
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet
    async fn send(&self, packet: &[u8]) -> io::Result<usize>;
}

/// Async TUN device wrapper
pub struct TunDevice {
    /// The underlying async TUN device
    device: AsyncDevice,
    /// Device name
    name: String,
    /// Framing reported to the engines
    framing: Framing,
}

impl TunDevice {
    /// Create a TUN device as described by `config`
    ///
    /// The interface is only given an address when `config.address` is set;
    /// otherwise it is left for manual setup (see [`setup_hints`]).
    pub fn create(config: &BridgeConfig) -> Result<Self, BridgeError> {
        // Check for required privileges first
        check_privileges()?;

        let mut builder = DeviceBuilder::new().mtu(config.mtu);

        if let Some(name) = &config.name {
            builder = builder.name(name.clone());
        }

        if let Some(net) = config.address {
            builder = builder.ipv4(net.addr(), net.prefix_len(), None);
        }

        let device = builder
            .build_async()
            .map_err(|e| TunnelError::CreateFailed {
                reason: e.to_string(),
            })?;

        // Get device name
        let name = device
            .deref()
            .name()
            .map_err(|e| TunnelError::CreateFailed {
                reason: format!("Failed to get device name: {}", e),
            })?;

        match config.address {
            Some(net) => tracing::info!("Created TUN device: {} with address {}", name, net),
            None => tracing::info!("Created TUN device: {}", name),
        }

        Ok(Self {
            device,
            name,
            framing: config.framing,
        })
    }
}

#[async_trait]
impl PacketDevice for TunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn framing(&self) -> Framing {
        self.framing
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.recv(buf).await
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        self.device.send(packet).await
    }
}

/// Shell commands that finish configuring the interface by hand
///
/// The client side is 10.0.0.1 and the server side 10.0.0.254.
pub fn setup_hints(role: Role, name: &str, mtu: u16) -> Vec<String> {
    let (local, remote) = match role {
        Role::Client => ("10.0.0.1", "10.0.0.254"),
        Role::Server => ("10.0.0.254", "10.0.0.1"),
    };

    if cfg!(target_os = "macos") {
        vec![format!(
            "sudo ifconfig {} inet {}/24 {} mtu {} up",
            name, local, remote, mtu
        )]
    } else {
        let mut hints = vec![
            format!("sudo ip a add dev {} {}/24", name, local),
            format!("sudo ip l set dev {} mtu {} up", name, mtu),
        ];
        if role == Role::Server {
            hints.push(
                "sudo iptables -t nat -A POSTROUTING -s 10.0.0.0/24 -o <NIC> -j MASQUERADE"
                    .to_string(),
            );
        }
        hints
    }
}

/// Log [`setup_hints`] unless the interface was configured automatically
pub fn log_setup_hints(config: &BridgeConfig, name: &str) {
    if config.address.is_some() {
        return;
    }
    for hint in setup_hints(config.role, name, config.mtu) {
        tracing::info!("hint:$ {}", hint);
    }
}

/// Check for required privileges to create TUN devices
fn check_privileges() -> Result<(), BridgeError> {
    #[cfg(unix)]
    {
        // On Unix, we need root or CAP_NET_ADMIN
        if unsafe { libc::geteuid() } != 0 {
            #[cfg(target_os = "linux")]
            {
                // CAP_NET_ADMIN may still be granted; tun creation fails clearly if not
                tracing::warn!("Running without root. TUN creation may fail.");
                tracing::warn!("Either run with sudo or grant CAP_NET_ADMIN:");
                tracing::warn!("  sudo setcap cap_net_admin=eip ./udp-bridge");
            }

            #[cfg(target_os = "macos")]
            {
                return Err(TunnelError::InsufficientPrivileges {
                    message: "Root privileges required on macOS. Run with sudo.".to_string(),
                }
                .into());
            }
        }
    }

    Ok(())
}
