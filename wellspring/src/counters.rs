//! Diagnostics counters
//!
//! Sticky counters written from interrupt context and read by anyone. All
//! of them are plain relaxed atomics: each counter has one writing context
//! and readers only ever want a recent value.

use crate::causes::InterruptCauses;
use crate::done_queue::DoneQueueSnapshot;
use crate::frame::FrameAnchor;
use crate::item::FrameUpdate;
use crate::signal::SignalStats;
use crate::state::ControllerState;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Counter whose reports back off to powers of two
///
/// The primary handler only counts. The secondary handler asks whether a
/// report is due, which is the case once the count has reached `1 << shown`;
/// `shown` then moves past the count. Checked after every event this
/// reports counts 1, 2, 4, 8, 16 and so on. Checked late, it reports the
/// count reached so far and skips the thresholds it already passed.
#[derive(Default)]
pub struct BackoffLog {
    count: AtomicU32,
    shown: AtomicU32,
}

impl BackoffLog {
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            shown: AtomicU32::new(0),
        }
    }

    /// Count one event (primary context)
    pub(crate) fn bump(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// The count to report, if it reached the next threshold (secondary context)
    pub fn due(&self) -> Option<u32> {
        let count = self.count.load(Ordering::Relaxed);
        let mut shown = self.shown.load(Ordering::Relaxed);
        if count == 0 || 1u32.checked_shl(shown).map_or(true, |threshold| count < threshold) {
            return None;
        }
        while 1u32.checked_shl(shown).is_some_and(|threshold| threshold <= count) {
            shown += 1;
        }
        self.shown.store(shown, Ordering::Relaxed);
        Some(count)
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Exponent of the next count that will be reported
    pub fn next_exponent(&self) -> u32 {
        self.shown.load(Ordering::Relaxed)
    }
}

/// Sticky hardware error counters
///
/// Transient anomalies count in primary context and are reported by the
/// secondary handler at reduced frequency.
#[derive(Default)]
pub struct ErrorCounters {
    pub host_error: BackoffLog,
    pub frame_overflow: BackoffLog,
    pub schedule_overrun: BackoffLog,
    pub ownership_change: BackoffLog,
    pub unrecoverable: AtomicU32,
    pub async_advance: AtomicU32,
    /// Clears still pending after every retry
    pub stuck_bits: AtomicU32,
    pub remote_wakeups: AtomicU32,
}

impl ErrorCounters {
    /// Transient anomalies and the cause each one is counted for
    pub fn anomalies(&self) -> [(InterruptCauses, &BackoffLog); 3] {
        [
            (InterruptCauses::FRAME_NUMBER_OVERFLOW, &self.frame_overflow),
            (InterruptCauses::SCHEDULING_OVERRUN, &self.schedule_overrun),
            (InterruptCauses::OWNERSHIP_CHANGE, &self.ownership_change),
        ]
    }
}

pub(crate) fn bump(counter: &AtomicU32) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Counters for items that carry precise completion timestamps
#[derive(Default)]
pub struct LatencyCounters {
    pub low_latency_items: AtomicU64,
    pub frames_updated: AtomicU64,
    /// Frames found already updated when they were timestamped
    pub frame_timestamp_errors: AtomicU64,
}

impl LatencyCounters {
    pub fn record(&self, update: FrameUpdate) {
        self.low_latency_items.fetch_add(1, Ordering::Relaxed);
        self.frames_updated.fetch_add(u64::from(update.updated), Ordering::Relaxed);
        self.frame_timestamp_errors.fetch_add(u64::from(update.errors), Ordering::Relaxed);
    }
}

/// Timing of the primary handler
#[derive(Default)]
pub struct FilterTiming {
    /// Set while a primary pass is in progress
    pub filter_active: AtomicBool,
    pub passes: AtomicU64,
    last_done_head: AtomicU64,
    /// Ticks between the two most recent done-head passes
    pub done_head_interval: AtomicU64,
    pub max_done_head_interval: AtomicU64,
}

impl FilterTiming {
    pub(crate) fn enter(&self) {
        self.filter_active.store(true, Ordering::Release);
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn leave(&self) {
        self.filter_active.store(false, Ordering::Release);
    }

    pub(crate) fn done_head_at(&self, now: u64) {
        let last = self.last_done_head.swap(now, Ordering::Relaxed);
        if last != 0 {
            let interval = now.saturating_sub(last);
            self.done_head_interval.store(interval, Ordering::Relaxed);
            self.max_done_head_interval.fetch_max(interval, Ordering::Relaxed);
        }
    }
}

/// Point-in-time view of everything diagnostics may look at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostics {
    pub state: ControllerState,
    pub pending: InterruptCauses,
    pub done_queue: DoneQueueSnapshot,
    pub anchor: FrameAnchor,
    pub signal: SignalStats,

    pub host_errors: u32,
    pub host_error_next_log_exponent: u32,
    pub frame_overflows: u32,
    pub schedule_overruns: u32,
    pub ownership_changes: u32,
    pub unrecoverable_errors: u32,
    pub async_advances: u32,
    pub stuck_bits: u32,
    pub remote_wakeups: u32,

    pub low_latency_items: u64,
    pub frames_updated: u64,
    pub frame_timestamp_errors: u64,

    pub filter_active: bool,
    pub filter_passes: u64,
    pub done_head_interval: u64,
    pub max_done_head_interval: u64,
}

impl Diagnostics {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn collect(
        state: ControllerState,
        pending: InterruptCauses,
        done_queue: DoneQueueSnapshot,
        anchor: FrameAnchor,
        signal: SignalStats,
        errors: &ErrorCounters,
        latency: &LatencyCounters,
        timing: &FilterTiming,
    ) -> Self {
        let load32 = |c: &AtomicU32| c.load(Ordering::Relaxed);
        let load64 = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Self {
            state,
            pending,
            done_queue,
            anchor,
            signal,
            host_errors: errors.host_error.count(),
            host_error_next_log_exponent: errors.host_error.next_exponent(),
            frame_overflows: errors.frame_overflow.count(),
            schedule_overruns: errors.schedule_overrun.count(),
            ownership_changes: errors.ownership_change.count(),
            unrecoverable_errors: load32(&errors.unrecoverable),
            async_advances: load32(&errors.async_advance),
            stuck_bits: load32(&errors.stuck_bits),
            remote_wakeups: load32(&errors.remote_wakeups),
            low_latency_items: load64(&latency.low_latency_items),
            frames_updated: load64(&latency.frames_updated),
            frame_timestamp_errors: load64(&latency.frame_timestamp_errors),
            filter_active: timing.filter_active.load(Ordering::Acquire),
            filter_passes: load64(&timing.passes),
            done_head_interval: load64(&timing.done_head_interval),
            max_done_head_interval: load64(&timing.max_done_head_interval),
        }
    }
}
