//! Tunnel protocol implementation
//!
//! This module contains the core protocol components:
//! - Packet buffers with headroom
//! - Header obfuscation and payload whitening
//! - Server session state (replay, roaming, takeover)
//! - Idle expiry

pub mod codec;
pub mod frame;
pub mod liveness;
pub mod session;

pub use codec::{open, seal, PacketHeader, HEADER_LEN};
pub use frame::{Frame, FramePool, MAX_PACKET_SIZE};
pub use liveness::{LivenessMonitor, WindowOutcome, IDLE_WINDOW_LIMIT, LIVENESS_PERIOD};
pub use session::{generation_from_clock, Admission, Outbound, SessionRecord, TrafficCounters};
