//! Address-family framing of interface packets
//!
//! BSD-style tun devices put a 4-byte address family marker in front of every
//! packet; others hand over bare IP packets. The codec only ever sees the IP
//! packet, so the marker is stripped after an interface read and put back
//! before an interface write.

use std::fmt;
use std::str::FromStr;

use crate::error::{ConfigError, ProtocolError};
use crate::protocol::Frame;

/// Length of the BSD address family marker
pub const AF_PREFIX_LEN: usize = 4;

/// Marker for IPv4 (`AF_INET` = 2, big-endian)
pub const AF_INET_MARKER: [u8; AF_PREFIX_LEN] = [0, 0, 0, 2];

/// Minimum IPv4 header length
const IPV4_MIN_LEN: usize = 20;

/// How the interface frames packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Bare IP packets; anything that is not IPv4 is dropped
    Raw,
    /// 4-byte address family marker before each packet; only IPv4 is accepted
    AfPrefix,
}

impl Framing {
    /// Framing delivered by the platform device adapter
    ///
    /// tun-rs removes the utun marker on macOS itself, so every platform sees
    /// bare packets.
    pub fn native() -> Self {
        Framing::Raw
    }

    /// Bytes of framing in front of the IP packet
    pub fn prefix_len(self) -> usize {
        match self {
            Framing::Raw => 0,
            Framing::AfPrefix => AF_PREFIX_LEN,
        }
    }

    /// Validate an interface read and narrow the frame to the IP packet
    pub fn strip(self, frame: &mut Frame) -> Result<(), ProtocolError> {
        let packet = frame.as_slice();
        match self {
            Framing::Raw => {
                if packet.len() < IPV4_MIN_LEN {
                    return Err(ProtocolError::Truncated {
                        len: packet.len(),
                        min: IPV4_MIN_LEN,
                    });
                }
                let version = packet[0] >> 4;
                if version != 4 {
                    return Err(ProtocolError::NotIpv4 { version });
                }
                Ok(())
            }
            Framing::AfPrefix => {
                let prefix = self.prefix_len();
                if packet.len() < prefix + IPV4_MIN_LEN {
                    return Err(ProtocolError::Truncated {
                        len: packet.len(),
                        min: prefix + IPV4_MIN_LEN,
                    });
                }
                let mut marker = [0u8; AF_PREFIX_LEN];
                marker.copy_from_slice(&packet[..prefix]);
                if marker != AF_INET_MARKER {
                    return Err(ProtocolError::UnexpectedFamily { marker });
                }
                frame.advance(prefix);
                Ok(())
            }
        }
    }

    /// Re-add the framing before the frame is written to the interface
    pub fn restore(self, frame: &mut Frame) -> Result<(), ProtocolError> {
        match self {
            Framing::Raw => Ok(()),
            Framing::AfPrefix => frame.prepend(&AF_INET_MARKER),
        }
    }
}

impl FromStr for Framing {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(Framing::Raw),
            "af-prefix" | "af" => Ok(Framing::AfPrefix),
            _ => Err(ConfigError::InvalidFraming {
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Raw => f.write_str("raw"),
            Framing::AfPrefix => f.write_str("af-prefix"),
        }
    }
}
