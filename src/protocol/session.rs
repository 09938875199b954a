//! Server-side session state
//!
//! Tracks the single remote peer: its generation, the highest sequence seen in
//! that generation, the address it was last seen at and traffic counters.
//! [`SessionRecord::admit`] implements the replay, roaming and takeover rules.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ProtocolError;

/// Traffic counters, lifetime and per liveness window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    pub rx: u64,
    pub tx: u64,
    pub windowed_rx: u64,
    pub windowed_tx: u64,
}

/// How an accepted packet related to the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Higher generation replaced the session (peer restart, or session was empty)
    Takeover { previous: u64 },
    /// Sequence moved forward; `roamed` when the source address changed
    Advanced { roamed: bool },
    /// Old or repeated sequence from the known address; forwarded, state unchanged
    Duplicate,
}

/// Parameters for one outbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outbound {
    pub generation: u64,
    pub sequence: u64,
    pub peer: SocketAddr,
}

/// Session state for the one active remote peer
#[derive(Debug, Default)]
pub struct SessionRecord {
    generation: u64,
    rx_sequence: u64,
    peer: Option<SocketAddr>,
    active: bool,
    counters: TrafficCounters,
    idle_windows: u32,
}

impl SessionRecord {
    /// Create an empty session (generation 0, inactive)
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation; 0 means no session
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Highest accepted sequence within the current generation
    pub fn rx_sequence(&self) -> u64 {
        self.rx_sequence
    }

    /// Last address a validly ordered packet arrived from
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether outbound forwarding is permitted
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn counters(&self) -> TrafficCounters {
        self.counters
    }

    /// Consecutive liveness windows without inbound traffic
    pub fn idle_windows(&self) -> u32 {
        self.idle_windows
    }

    /// Apply the replay/roaming/takeover policy to a decoded inbound packet
    ///
    /// On acceptance the session is marked active, the receive counters are
    /// bumped and the idle streak is cleared.
    pub fn admit(
        &mut self,
        generation: u64,
        sequence: u64,
        from: SocketAddr,
    ) -> Result<Admission, ProtocolError> {
        let admission = if generation < self.generation {
            return Err(ProtocolError::StaleGeneration {
                got: generation,
                current: self.generation,
            });
        } else if generation == self.generation {
            if sequence <= self.rx_sequence {
                if self.peer != Some(from) {
                    return Err(ProtocolError::ReplayFromOtherAddress {
                        sequence,
                        current: self.rx_sequence,
                        from,
                    });
                }
                Admission::Duplicate
            } else {
                let roamed = self.peer != Some(from);
                self.peer = Some(from);
                self.rx_sequence = sequence;
                Admission::Advanced { roamed }
            }
        } else {
            let previous = self.generation;
            self.peer = Some(from);
            self.generation = generation;
            self.rx_sequence = sequence;
            Admission::Takeover { previous }
        };

        self.counters.rx += 1;
        self.counters.windowed_rx += 1;
        self.idle_windows = 0;
        self.active = true;

        Ok(admission)
    }

    /// Reserve the next outbound sequence number
    ///
    /// Fails with [`ProtocolError::Inactive`] when there is no peer to send to.
    /// Undo with [`SessionRecord::rollback_outbound`] if the packet cannot be sent.
    pub fn next_outbound(&mut self) -> Result<Outbound, ProtocolError> {
        let peer = match (self.active, self.peer) {
            (true, Some(peer)) => peer,
            _ => return Err(ProtocolError::Inactive),
        };

        self.counters.tx += 1;
        Ok(Outbound {
            generation: self.generation,
            sequence: self.counters.tx,
            peer,
        })
    }

    /// Release the sequence number taken by the last [`SessionRecord::next_outbound`]
    pub fn rollback_outbound(&mut self) {
        self.counters.tx = self.counters.tx.saturating_sub(1);
    }

    /// Count a packet handed to the socket in this window
    pub fn mark_sent(&mut self) {
        self.counters.windowed_tx += 1;
    }

    /// Drop back to the empty state; the next valid packet is a takeover
    pub fn reset(&mut self) {
        self.generation = 0;
        self.rx_sequence = 0;
        self.active = false;
    }

    /// Add one idle window to the streak and return its length
    pub(crate) fn record_idle_window(&mut self) -> u32 {
        self.idle_windows = self.idle_windows.saturating_add(1);
        self.idle_windows
    }

    /// Clear the windowed counters, returning the window's (rx, tx)
    pub(crate) fn close_window(&mut self) -> (u64, u64) {
        let window = (self.counters.windowed_rx, self.counters.windowed_tx);
        self.counters.windowed_rx = 0;
        self.counters.windowed_tx = 0;
        window
    }
}

/// Pick a transmit generation id for this process run
///
/// Microseconds since the Unix epoch: a restarted client always presents a
/// larger generation than its previous run.
pub fn generation_from_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
        .max(1)
}
