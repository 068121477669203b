//! # Clock - The Rhythm of Time
//!
//! The primary handler samples the clock once per pass and stamps every
//! low-latency item it retires with that one value.

use core::sync::atomic::{AtomicU64, Ordering};

/// A monotonic time source usable from interrupt context
pub trait MonotonicClock: Send + Sync {
    /// Current time in platform ticks. Never goes backwards.
    fn now(&self) -> u64;
}

/// Tick counter advanced by the platform timer interrupt
pub struct TickClock {
    ticks: AtomicU64,
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickClock {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
        }
    }

    /// Get the current tick count
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Increment the tick count (called from timer interrupt)
    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Advance by several ticks at once
    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::Relaxed);
    }
}

impl MonotonicClock for TickClock {
    fn now(&self) -> u64 {
        self.ticks()
    }
}
