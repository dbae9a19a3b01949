//! Heartbeat supervision and reconnect backoff
//!
//! The receive loop calls [`HeartbeatMonitor::register_message`] for every
//! frame it reads. A dedicated thread calls [`HeartbeatMonitor::tick`] once per
//! heartbeat interval: an interval with traffic resets the miss counter, a
//! silent interval sends a status-request probe, and more than
//! `max_missed` consecutive silent intervals expire the session.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Result of one heartbeat interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// A message arrived during the interval
    Alive,
    /// Nothing arrived; send a probe
    Probe { missed: u32 },
    /// Too many silent intervals in a row
    Expired { missed: u32 },
}

/// Connection liveness tracker
#[derive(Debug)]
pub struct HeartbeatMonitor {
    received: AtomicBool,
    missed: AtomicU32,
    max_missed: u32,
}

impl HeartbeatMonitor {
    pub fn new(max_missed: u32) -> Self {
        Self {
            received: AtomicBool::new(false),
            missed: AtomicU32::new(0),
            max_missed,
        }
    }

    /// Register that a message of any type was received
    pub fn register_message(&self) {
        self.received.store(true, Ordering::Release);
    }

    /// Evaluate the interval that just ended
    pub fn tick(&self) -> HeartbeatVerdict {
        if self.received.swap(false, Ordering::AcqRel) {
            self.missed.store(0, Ordering::Release);
            return HeartbeatVerdict::Alive;
        }
        let missed = self.missed.fetch_add(1, Ordering::AcqRel) + 1;
        if missed > self.max_missed {
            HeartbeatVerdict::Expired { missed }
        } else {
            HeartbeatVerdict::Probe { missed }
        }
    }

    /// Consecutive silent intervals so far
    pub fn missed(&self) -> u32 {
        self.missed.load(Ordering::Acquire)
    }

    /// Called when a new session starts
    pub fn reset(&self) {
        self.received.store(false, Ordering::Release);
        self.missed.store(0, Ordering::Release);
    }
}

/// Reconnect delay policy: a short delay for the first `short_attempts`
/// consecutive failures, a long delay afterwards
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    short_delay: Duration,
    long_delay: Duration,
    short_attempts: u32,
    failures: u32,
}

impl ReconnectBackoff {
    pub fn new(short_delay: Duration, long_delay: Duration, short_attempts: u32) -> Self {
        Self {
            short_delay,
            long_delay,
            short_attempts,
            failures: 0,
        }
    }

    /// Record a failed attempt and return how long to wait before the next one
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.short_attempts {
            self.long_delay
        } else {
            self.short_delay
        }
    }

    /// Consecutive failures since the last successful connect
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_widened(&self) -> bool {
        self.failures > self.short_attempts
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
