//! Pending Flags - The Mailbox Between Contexts
//!
//! Sticky per-cause flags. The primary handler only ever sets bits, the
//! secondary handler only ever takes them, so one atomic word is enough and
//! no lock is needed. A cause raised twice before the secondary handler runs
//! is seen once.

use crate::causes::InterruptCauses;
use core::sync::atomic::{AtomicU32, Ordering};

pub struct PendingFlags {
    bits: AtomicU32,
}

impl Default for PendingFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingFlags {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    /// Mark causes as pending (primary context)
    pub fn raise(&self, causes: InterruptCauses) {
        if !causes.is_empty() {
            self.bits.fetch_or(causes.bits(), Ordering::Release);
        }
    }

    /// Take and clear the pending subset of `causes` (secondary context)
    pub fn take(&self, causes: InterruptCauses) -> InterruptCauses {
        let previous = self.bits.fetch_and(!causes.bits(), Ordering::AcqRel);
        InterruptCauses::from_bits_truncate(previous) & causes
    }

    pub fn peek(&self) -> InterruptCauses {
        InterruptCauses::from_bits_truncate(self.bits.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_twice_is_seen_once() {
        let flags = PendingFlags::new();
        flags.raise(InterruptCauses::COMPLETE);
        flags.raise(InterruptCauses::COMPLETE);
        assert_eq!(flags.take(InterruptCauses::COMPLETE), InterruptCauses::COMPLETE);
        assert!(flags.take(InterruptCauses::COMPLETE).is_empty());
    }

    #[test]
    fn test_take_leaves_other_causes_pending() {
        let flags = PendingFlags::new();
        flags.raise(InterruptCauses::ERROR | InterruptCauses::PORT_CHANGE);
        assert_eq!(flags.take(InterruptCauses::ERROR), InterruptCauses::ERROR);
        assert_eq!(flags.peek(), InterruptCauses::PORT_CHANGE);
        assert_eq!(flags.take(InterruptCauses::causes()), InterruptCauses::PORT_CHANGE);
        assert!(flags.peek().is_empty());
    }

    #[test]
    fn test_concurrent_raise_is_never_lost() {
        use std::sync::Arc;
        use std::thread;

        let flags = Arc::new(PendingFlags::new());
        let raiser = {
            let flags = Arc::clone(&flags);
            thread::spawn(move || {
                for _ in 0..10_000 {
                    flags.raise(InterruptCauses::COMPLETE);
                }
            })
        };

        let mut seen = 0;
        for _ in 0..10_000 {
            if !flags.take(InterruptCauses::COMPLETE).is_empty() {
                seen += 1;
            }
        }
        raiser.join().unwrap();
        if !flags.take(InterruptCauses::COMPLETE).is_empty() {
            seen += 1;
        }
        assert!(seen >= 1);
        assert!(flags.peek().is_empty());
    }
}
