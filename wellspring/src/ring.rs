//! # Periodic Ring - The Wheel of Frames
//!
//! A ring of `N` frame slots (N a power of two). Each slot heads a singly
//! linked list: isochronous items first, in insertion order, then whatever
//! belongs to other schedules. The ring owns those links; the hardware sees
//! the same order through each item's physical link and the frame list.
//!
//! The primary handler sweeps the ring from `out_slot` up to the slot the
//! hardware is working on, retiring finished isochronous items onto the
//! done queue. Only the primary handler ever mutates the ring.
//!
//! ## Split Deferral
//!
//! A split isochronous item whose endpoint wraps into the next frame is not
//! finished until micro-frame 2 of that next frame. If the next slot is the
//! current one and the hardware has not reached micro-frame 2, the item
//! stays linked and `out_slot` stays at its slot so the next pass looks
//! again.

use crate::counters::LatencyCounters;
use crate::done_queue::DoneQueueBatch;
use crate::endpoint::EndpointTable;
use crate::error::WellspringError;
use crate::item::{ItemHandle, ItemKind, ItemRef, ItemTable};
use crate::register_port::PhysAddr;
use alloc::vec;
use alloc::vec::Vec;

/// First micro-frame at which a wrapped split transfer has completed
const SPLIT_WRAP_DONE_SUBSLOT: u32 = 2;

/// What one sweep did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepOutcome {
    pub retired: u32,
    pub deferred: u32,
    pub slots_walked: u32,
}

pub struct PeriodicRing {
    heads: Vec<Option<ItemHandle>>,
    /// Software mirror of the hardware frame list
    frame_list: Vec<PhysAddr>,
    /// Ring link of each item, indexed by item handle
    next: Vec<Option<ItemHandle>>,
    linked: Vec<bool>,
    out_slot: usize,
    /// Low bits of the frame index that count micro-frames
    subslot_bits: u32,
}

impl PeriodicRing {
    /// A ring of `len` slots (power of two) able to link `item_capacity`
    /// items, indexed by a frame index whose low `subslot_bits` count
    /// micro-frames
    pub fn new(len: usize, item_capacity: usize, subslot_bits: u32) -> Self {
        Self {
            heads: vec![None; len],
            frame_list: vec![PhysAddr::NULL; len],
            next: vec![None; item_capacity],
            linked: vec![false; item_capacity],
            out_slot: 0,
            subslot_bits,
        }
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.iter().all(Option::is_none)
    }

    /// Next slot to retire
    pub fn out_slot(&self) -> usize {
        self.out_slot
    }

    /// Whether the cursor points into the ring
    pub fn is_valid(&self) -> bool {
        self.out_slot < self.len()
    }

    /// Park the cursor outside the ring; sweeps do nothing until restarted
    pub fn disable(&mut self) {
        self.out_slot = self.len();
    }

    /// Resume retiring from `slot`
    pub fn restart(&mut self, slot: usize) -> Result<(), WellspringError> {
        if slot >= self.len() {
            return Err(WellspringError::SlotOutOfRange { slot, len: self.len() });
        }
        self.out_slot = slot;
        Ok(())
    }

    /// Split a hardware frame index into `(slot, subslot)`
    pub fn split_index(&self, frame_index: u32) -> (usize, u32) {
        let subslot_mask = (1u32 << self.subslot_bits) - 1;
        let slot = (frame_index >> self.subslot_bits) as usize & (self.len() - 1);
        (slot, frame_index & subslot_mask)
    }

    /// Physical link the hardware follows from `slot`
    pub fn frame_list_entry(&self, slot: usize) -> Option<PhysAddr> {
        self.frame_list.get(slot).copied()
    }

    pub fn is_linked(&self, handle: ItemHandle) -> bool {
        self.linked.get(handle.index()).copied().unwrap_or(false)
    }

    /// Items linked into `slot`, in ring order
    pub fn slot_items(&self, slot: usize) -> SlotIter<'_> {
        SlotIter {
            ring: self,
            cursor: self.heads.get(slot).copied().flatten(),
        }
    }

    /// Link `item` into `slot`
    ///
    /// Isochronous items go after the isochronous items already there and
    /// before anything else; other items go at the end. The hardware link
    /// is patched to match.
    pub fn link(
        &mut self,
        slot: usize,
        item: &ItemRef<'_>,
        items: &ItemTable,
        endpoints: &EndpointTable,
    ) -> Result<(), WellspringError> {
        if slot >= self.len() {
            return Err(WellspringError::SlotOutOfRange { slot, len: self.len() });
        }
        let index = item.handle().index();
        if index >= self.next.len() {
            return Err(WellspringError::InvalidItem(item.handle()));
        }
        if self.linked[index] {
            return Err(WellspringError::AlreadyScheduled(item.handle()));
        }

        let isochronous = item.kind().is_isochronous();
        let mut prev = None;
        let mut cursor = self.heads[slot];
        while let Some(handle) = cursor {
            let is_iso = items.get(handle).is_some_and(|i| i.kind().is_isochronous());
            if isochronous && !is_iso {
                break;
            }
            prev = Some(handle);
            cursor = self.next[handle.index()];
        }

        self.next[index] = cursor;
        match prev.and_then(|handle| items.get(handle)) {
            Some(prev_item) => {
                item.set_hw_next(prev_item.hw_next());
                self.next[prev_item.handle().index()] = Some(item.handle());
                prev_item.set_hw_next(item.phys());
            }
            None => {
                item.set_hw_next(self.frame_list[slot]);
                self.heads[slot] = Some(item.handle());
                self.frame_list[slot] = item.phys();
            }
        }
        self.linked[index] = true;

        if let Some(endpoint) = item.endpoint().and_then(|e| endpoints.get(e)) {
            endpoint.note_scheduled();
        }
        Ok(())
    }

    /// Retire finished isochronous items up to the hardware's current slot
    ///
    /// Runs in primary context: no allocation, no locks. Retired items are
    /// pushed onto `batch`; low-latency items are stamped with `timestamp`.
    pub fn sweep(
        &mut self,
        frame_index: u32,
        timestamp: u64,
        items: &ItemTable,
        endpoints: &EndpointTable,
        batch: &mut DoneQueueBatch,
        latency: &LatencyCounters,
    ) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        if !self.is_valid() {
            return outcome;
        }

        let (current_slot, current_subslot) = self.split_index(frame_index);
        let mask = self.len() - 1;
        let mut test_slot = self.out_slot;
        let mut deferred_any = false;

        while test_slot != current_slot {
            let next_slot = (test_slot + 1) & mask;
            let mut prev: Option<ItemHandle> = None;
            let mut cursor = self.heads[test_slot];

            while let Some(handle) = cursor {
                let Some(item) = items.get(handle) else { break };
                // past the isochronous items: other schedules, not ours
                if !item.kind().is_isochronous() {
                    break;
                }
                let following = self.next[handle.index()];
                let endpoint = item.endpoint().and_then(|e| endpoints.get(e));

                if item.kind() == ItemKind::SplitIsochronous
                    && endpoint.is_some_and(|e| e.wraps_frames())
                    && next_slot == current_slot
                    && current_subslot < SPLIT_WRAP_DONE_SUBSLOT
                {
                    prev = Some(handle);
                    cursor = following;
                    deferred_any = true;
                    outcome.deferred += 1;
                    continue;
                }

                self.unlink(test_slot, prev, &item, following, items);
                if item.is_low_latency() {
                    item.stamp(timestamp);
                    latency.record(item.stamp_frames(timestamp));
                }
                batch.push(&item);
                if let Some(endpoint) = endpoint {
                    endpoint.moved_to_producer_queue();
                }
                outcome.retired += 1;
                cursor = following;
            }

            outcome.slots_walked += 1;
            test_slot = next_slot;
            if !deferred_any {
                self.out_slot = test_slot;
            }
        }
        outcome
    }

    fn unlink(
        &mut self,
        slot: usize,
        prev: Option<ItemHandle>,
        item: &ItemRef<'_>,
        following: Option<ItemHandle>,
        items: &ItemTable,
    ) {
        match prev {
            Some(prev) => {
                self.next[prev.index()] = following;
                if let Some(prev_item) = items.get(prev) {
                    prev_item.set_hw_next(item.hw_next());
                }
            }
            None => {
                self.heads[slot] = following;
                self.frame_list[slot] = item.hw_next();
            }
        }
        let index = item.handle().index();
        self.next[index] = None;
        self.linked[index] = false;
    }
}

/// Iterator over one slot's items
pub struct SlotIter<'a> {
    ring: &'a PeriodicRing,
    cursor: Option<ItemHandle>,
}

impl Iterator for SlotIter<'_> {
    type Item = ItemHandle;

    fn next(&mut self) -> Option<ItemHandle> {
        let handle = self.cursor?;
        self.cursor = self.ring.next.get(handle.index()).copied().flatten();
        Some(handle)
    }
}
