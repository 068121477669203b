//! # Frames - Keeping Time with the Bus
//!
//! The hardware frame index is narrow and wraps quickly. [`FrameCounter`]
//! extends it to 64 bits on every rollover interrupt, and [`AnchorCell`]
//! holds the `(time, frame)` pair recorded at that moment.
//!
//! The anchor travels through two cells: the primary handler stages it, the
//! secondary handler publishes it for everyone else. Both cells are
//! sequence locks with a single writer each, so a reader never sees the
//! time of one rollover paired with the frame of another.

use core::sync::atomic::{fence, AtomicU64, Ordering};

/// A clock reading paired with the extended frame number it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameAnchor {
    pub time: u64,
    pub frame: u64,
}

/// Single-writer sequence lock around a [`FrameAnchor`]
pub struct AnchorCell {
    seq: AtomicU64,
    time: AtomicU64,
    frame: AtomicU64,
}

impl Default for AnchorCell {
    fn default() -> Self {
        Self::new()
    }
}

impl AnchorCell {
    pub const fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            time: AtomicU64::new(0),
            frame: AtomicU64::new(0),
        }
    }

    /// Store a new anchor. Only one context may ever write a given cell.
    pub fn store(&self, anchor: FrameAnchor) {
        let seq = self.seq.load(Ordering::Relaxed);
        // odd: write in progress
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.time.store(anchor.time, Ordering::Relaxed);
        self.frame.store(anchor.frame, Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Read a consistent anchor, retrying across a concurrent store
    pub fn load(&self) -> FrameAnchor {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 0 {
                let time = self.time.load(Ordering::Relaxed);
                let frame = self.frame.load(Ordering::Relaxed);
                fence(Ordering::Acquire);
                if self.seq.load(Ordering::Relaxed) == before {
                    return FrameAnchor { time, frame };
                }
            }
            core::hint::spin_loop();
        }
    }
}

/// Extends the hardware frame index to a 64-bit frame number
///
/// The low `subslot_bits` of the index count sub-frames and are shifted
/// away. A rollover is detected by comparing the index against the middle
/// of its range rather than zero, so an index read that races slightly
/// past the rollover is still attributed correctly.
#[derive(Debug, Clone)]
pub struct FrameCounter {
    high: u64,
    mask: u32,
    midpoint: u32,
    subslot_bits: u32,
    increment: u64,
}

impl FrameCounter {
    /// Counter for an index of `index_bits` bits, of which the low
    /// `subslot_bits` count sub-frames
    pub fn new(index_bits: u32, subslot_bits: u32) -> Self {
        Self {
            high: 0,
            mask: ((1u64 << index_bits) - 1) as u32,
            midpoint: 1 << (index_bits - 1),
            subslot_bits,
            increment: 1 << (index_bits - subslot_bits),
        }
    }

    /// Account for a rollover interrupt observed with index `raw`
    pub fn rollover(&mut self, raw: u32) -> u64 {
        if raw & self.mask < self.midpoint {
            self.high += self.increment;
        }
        self.frame(raw)
    }

    /// Extended frame number for index `raw` without touching the counter
    pub fn frame(&self, raw: u32) -> u64 {
        self.high + u64::from((raw & self.mask) >> self.subslot_bits)
    }

    /// Frames counted by completed wraps of the index
    pub fn high(&self) -> u64 {
        self.high
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_periodic_list_counter_extends_on_low_half() {
        let mut counter = FrameCounter::new(14, 3);
        // interrupt taken just after the wrap
        assert_eq!(counter.rollover(0x0010), 2048 + 2);
        // rollover bit toggled half way, index in the upper half: no wrap
        assert_eq!(counter.rollover(0x2008), 2048 + 0x401);
        assert_eq!(counter.high(), 2048);
    }

    #[test]
    fn test_done_head_counter_uses_midpoint() {
        let mut counter = FrameCounter::new(16, 0);
        assert_eq!(counter.rollover(0x8001), 0x8001);
        assert_eq!(counter.rollover(0x0003), 0x1_0003);
        assert_eq!(counter.frame(0xFFFF), 0x1_FFFF);
    }

    #[test]
    fn test_anchor_keeps_latest_store() {
        let cell = AnchorCell::new();
        assert_eq!(cell.load(), FrameAnchor::default());
        cell.store(FrameAnchor { time: 5, frame: 9 });
        cell.store(FrameAnchor { time: 6, frame: 10 });
        assert_eq!(cell.load(), FrameAnchor { time: 6, frame: 10 });
    }

    #[test]
    fn test_reader_never_sees_a_mixed_pair() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;
        use std::thread;

        let cell = Arc::new(AnchorCell::new());
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let cell = Arc::clone(&cell);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                for pass in 1..=50_000u64 {
                    // every pass writes time == frame * 3
                    cell.store(FrameAnchor { time: pass * 3, frame: pass });
                }
                done.store(true, Ordering::Release);
            })
        };

        while !done.load(Ordering::Acquire) {
            let anchor = cell.load();
            assert_eq!(anchor.time, anchor.frame * 3, "mixed anchor {:?}", anchor);
        }
        writer.join().unwrap();
        assert_eq!(cell.load(), FrameAnchor { time: 150_000, frame: 50_000 });
    }
}
