//! Idle expiry for the server session
//!
//! Every period the windowed counters are examined and cleared. A run of
//! windows without any inbound packet resets the session so that the next
//! valid packet is taken as a fresh session.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::protocol::session::SessionRecord;

/// Length of one liveness window
pub const LIVENESS_PERIOD: Duration = Duration::from_secs(60);

/// Consecutive idle windows after which the session is reset
pub const IDLE_WINDOW_LIMIT: u32 = 5;

/// What one tick concluded about the window that just ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOutcome {
    /// Inbound traffic was seen
    Live { rx: u64, tx: u64 },
    /// No inbound traffic; `windows` is the idle streak so far
    Idle { windows: u32 },
    /// The idle streak reached the limit and the session was reset
    Expired { was_active: bool },
}

/// Periodic idle checker
#[derive(Debug, Clone, Copy)]
pub struct LivenessMonitor {
    period: Duration,
    idle_limit: u32,
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::new(LIVENESS_PERIOD, IDLE_WINDOW_LIMIT)
    }
}

impl LivenessMonitor {
    pub fn new(period: Duration, idle_limit: u32) -> Self {
        Self {
            period,
            idle_limit: idle_limit.max(1),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn idle_limit(&self) -> u32 {
        self.idle_limit
    }

    /// Timer whose first tick is one full period from now
    pub fn interval(&self) -> Interval {
        let mut timer = interval_at(Instant::now() + self.period, self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    }

    /// Close the current window on `session`
    pub fn tick(&self, session: &mut SessionRecord) -> WindowOutcome {
        let idle = session.counters().windowed_rx == 0;

        let outcome = if idle {
            let windows = session.record_idle_window();
            if windows >= self.idle_limit {
                let was_active = session.is_active();
                session.reset();
                WindowOutcome::Expired { was_active }
            } else {
                WindowOutcome::Idle { windows }
            }
        } else {
            let counters = session.counters();
            WindowOutcome::Live {
                rx: counters.windowed_rx,
                tx: counters.windowed_tx,
            }
        };

        session.close_window();
        outcome
    }
}
