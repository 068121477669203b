//! # Done Queue - Where Finished Work Waits
//!
//! The handoff of completed items from the primary handler to the secondary
//! handler. The shared state is exactly one pair, `(head, producer_count)`,
//! behind one spin lock that is held only long enough to copy or replace the
//! pair. No list is ever walked under the lock.
//!
//! The list is linked newest first through each item's done-queue link and
//! is not null terminated: the tail of one batch points at the head of the
//! previous one. A consumer walks exactly `producer_count - consumer_count`
//! links from the head and then reverses what it found into completion
//! order.
//!
//! ## Roles
//!
//! - The primary handler keeps a private shadow of the pair (it is the only
//!   writer), builds a [`DoneQueueBatch`] on top of it without any lock, and
//!   publishes the result in one locked store.
//! - The secondary handler owns a [`DoneQueueConsumer`] that remembers how
//!   many items it has already taken.

use crate::item::{ItemHandle, ItemRef, ItemTable};
use alloc::vec::Vec;
use spin::Mutex;

/// The shared `(head, producer_count)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DoneQueueSnapshot {
    pub head: Option<ItemHandle>,
    /// Items ever moved into the queue; only increases
    pub producer_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneQueueError {
    /// The published count went backwards
    CounterRegressed { producer: u64, consumer: u64 },
    /// The chain ended before the published count was reached
    Truncated { expected: u64, found: u64 },
}

impl core::fmt::Display for DoneQueueError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DoneQueueError::CounterRegressed { producer, consumer } => write!(
                f,
                "Producer count {} is behind consumer count {}",
                producer, consumer
            ),
            DoneQueueError::Truncated { expected, found } => {
                write!(f, "Expected {} items on the done queue, found {}", expected, found)
            }
        }
    }
}

/// The lock-protected handoff point
pub struct DoneQueueChannel {
    state: Mutex<DoneQueueSnapshot>,
}

impl Default for DoneQueueChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl DoneQueueChannel {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(DoneQueueSnapshot {
                head: None,
                producer_count: 0,
            }),
        }
    }

    /// Replace the pair (producer side)
    ///
    /// The only critical section the primary handler ever enters.
    pub fn publish(&self, snapshot: DoneQueueSnapshot) {
        *self.state.lock() = snapshot;
    }

    /// Copy the pair (consumer side)
    pub fn snapshot(&self) -> DoneQueueSnapshot {
        *self.state.lock()
    }
}

/// Items found during one primary pass, not yet visible to the consumer
pub struct DoneQueueBatch {
    head: Option<ItemHandle>,
    producer_count: u64,
    pushed: u64,
}

impl DoneQueueBatch {
    /// Start a batch on top of the last published pair
    pub fn resume(shadow: DoneQueueSnapshot) -> Self {
        Self {
            head: shadow.head,
            producer_count: shadow.producer_count,
            pushed: 0,
        }
    }

    /// Push one item; it becomes the new head
    pub fn push(&mut self, item: &ItemRef<'_>) {
        item.set_done_link(self.head);
        self.head = Some(item.handle());
        self.producer_count += 1;
        self.pushed += 1;
    }

    /// Push an already linked chain of `count` items, newest first
    ///
    /// The caller has linked `newest` through to `oldest`; only the oldest
    /// item is pointed at the current head.
    pub fn splice(&mut self, newest: ItemHandle, oldest: &ItemRef<'_>, count: u64) {
        if count == 0 {
            return;
        }
        oldest.set_done_link(self.head);
        self.head = Some(newest);
        self.producer_count += count;
        self.pushed += count;
    }

    /// Items added by this batch
    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    /// Publish the batch if it holds anything. Returns the new shadow pair.
    pub fn publish(self, channel: &DoneQueueChannel) -> DoneQueueSnapshot {
        let snapshot = DoneQueueSnapshot {
            head: self.head,
            producer_count: self.producer_count,
        };
        if self.pushed > 0 {
            channel.publish(snapshot);
        }
        snapshot
    }
}

/// Consumer side of the done queue
#[derive(Debug, Default)]
pub struct DoneQueueConsumer {
    consumer_count: u64,
}

impl DoneQueueConsumer {
    pub const fn new() -> Self {
        Self { consumer_count: 0 }
    }

    /// Items taken so far
    pub fn consumer_count(&self) -> u64 {
        self.consumer_count
    }

    /// Take everything published since the last drain, oldest first
    ///
    /// The pair is copied under the lock; the walk happens outside it. On a
    /// corrupted queue the consumer still catches up to the published count
    /// so the next drain starts clean.
    pub fn drain(
        &mut self,
        channel: &DoneQueueChannel,
        items: &ItemTable,
    ) -> Result<Vec<ItemHandle>, DoneQueueError> {
        let snapshot = channel.snapshot();
        if snapshot.producer_count < self.consumer_count {
            return Err(DoneQueueError::CounterRegressed {
                producer: snapshot.producer_count,
                consumer: self.consumer_count,
            });
        }

        let expected = snapshot.producer_count - self.consumer_count;
        self.consumer_count = snapshot.producer_count;

        let mut drained = Vec::with_capacity(expected.min(items.capacity() as u64) as usize);
        let mut cursor = snapshot.head;
        while (drained.len() as u64) < expected {
            // never more links than the arena can hold
            if drained.len() >= items.capacity() {
                break;
            }
            let item = match cursor.and_then(|handle| items.get(handle)) {
                Some(item) => item,
                None => break,
            };
            drained.push(item.handle());
            cursor = item.done_link();
        }

        if (drained.len() as u64) < expected {
            return Err(DoneQueueError::Truncated {
                expected,
                found: drained.len() as u64,
            });
        }

        drained.reverse();
        Ok(drained)
    }
}
