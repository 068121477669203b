//! Dispatch Signal - One Knock on the Door
//!
//! A single-slot pending wakeup. However many times the primary handler
//! raises it, at most one secondary run is owed until that run takes the
//! signal. This is not a counting semaphore.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Hook that schedules the secondary handler on the platform
pub type WakeHook = fn();

pub struct DispatchSignal {
    pending: AtomicBool,
    raised: AtomicU64,
    collapsed: AtomicU64,
    wake: Option<WakeHook>,
}

/// Signal statistics for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalStats {
    /// Raises that scheduled a secondary run
    pub raised: u64,
    /// Raises that found a run already pending
    pub collapsed: u64,
}

impl Default for DispatchSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchSignal {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            raised: AtomicU64::new(0),
            collapsed: AtomicU64::new(0),
            wake: None,
        }
    }

    /// Signal that calls `wake` whenever a new run becomes pending
    pub const fn with_wake_hook(wake: WakeHook) -> Self {
        Self {
            wake: Some(wake),
            ..Self::new()
        }
    }

    /// Request a secondary run
    ///
    /// Returns `true` if this call made the run pending, `false` if one was
    /// already owed.
    pub fn raise(&self) -> bool {
        if self.pending.swap(true, Ordering::AcqRel) {
            self.collapsed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.raised.fetch_add(1, Ordering::Relaxed);
        if let Some(wake) = self.wake {
            wake();
        }
        true
    }

    /// Consume the pending run. Called first thing by the secondary handler,
    /// so a raise during the run schedules another one.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SignalStats {
        SignalStats {
            raised: self.raised.load(Ordering::Relaxed),
            collapsed: self.collapsed.load(Ordering::Relaxed),
        }
    }
}
