//! # Interrupt Filter - The Primary Handler
//!
//! Runs in hard interrupt context for every interrupt of one controller.
//! It reads the interrupt status once, does the minimum each cause needs,
//! and leaves everything expensive to the [`InterruptDispatcher`].
//!
//! ## Rules of the Primary Context
//!
//! - NO blocking: the only lock taken is the done-queue pair, and the
//!   secondary handler never holds it across anything that could wait
//! - NO allocation
//! - NO logging: anomalies are counted, the dispatcher reports them
//! - Every status clear is followed by a write barrier
//!
//! [`InterruptDispatcher`]: crate::dispatcher::InterruptDispatcher

use crate::causes::InterruptCauses;
use crate::clock::MonotonicClock;
use crate::config::ControllerFamily;
use crate::controller::ControllerShared;
use crate::counters::bump;
use crate::done_queue::{DoneQueueBatch, DoneQueueSnapshot};
use crate::error::WellspringError;
use crate::frame::{FrameAnchor, FrameCounter};
use crate::item::{ItemHandle, ItemRef};
use crate::register_port::{AddressResolver, RegisterPort};
use crate::ring::{PeriodicRing, SweepOutcome};
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

/// Low bits of the done-head pointer carry flags, not address
const DONE_HEAD_ADDRESS_MASK: u32 = !0xF;

/// The primary interrupt handler of one controller
pub struct InterruptFilter {
    shared: Arc<ControllerShared>,
    resolver: Arc<dyn AddressResolver>,
    clock: Arc<dyn MonotonicClock>,
    ring: PeriodicRing,
    frames: FrameCounter,
    /// Last pair published to the done queue; this context is its only writer
    shadow: DoneQueueSnapshot,
    last_sweep: SweepOutcome,
}

impl InterruptFilter {
    pub(crate) fn new(
        shared: Arc<ControllerShared>,
        resolver: Arc<dyn AddressResolver>,
        clock: Arc<dyn MonotonicClock>,
    ) -> Self {
        let config = shared.config;
        Self {
            ring: PeriodicRing::new(
                config.periodic_list_len,
                config.item_capacity,
                config.frame_subslot_bits,
            ),
            frames: FrameCounter::new(config.frame_index_bits, config.frame_subslot_bits),
            shadow: shared.done_queue.snapshot(),
            last_sweep: SweepOutcome::default(),
            shared,
            resolver,
            clock,
        }
    }

    /// Handle one hardware interrupt
    ///
    /// Always returns `false`: the work is never finished here. When the
    /// secondary handler has something to do, the dispatch signal is raised
    /// before returning.
    pub fn run(&mut self) -> bool {
        let Self {
            shared,
            resolver,
            clock,
            ring,
            frames,
            shadow,
            last_sweep,
        } = self;
        let shared: &ControllerShared = shared;

        // teardown, ejection and power-off win over everything else
        if shared.lifecycle.should_ignore() {
            return false;
        }

        shared.timing.enter();
        let mut pass = Pass {
            shared,
            port: &*shared.port,
            clock: &**clock,
            timestamp: None,
            wants_dispatch: false,
        };
        pass.run(&**resolver, ring, frames, shadow, last_sweep);
        let wants_dispatch = pass.wants_dispatch;
        shared.timing.leave();

        // the done-head family is always handed to the secondary handler
        if wants_dispatch || shared.config.family == ControllerFamily::DoneHead {
            shared.signal.raise();
        }
        false
    }

    /// Link a submitted item into periodic slot `slot`
    ///
    /// Must not race with [`InterruptFilter::run`]; the caller masks the
    /// controller's interrupt line around it.
    pub fn schedule(&mut self, slot: usize, item: ItemHandle) -> Result<(), WellspringError> {
        let shared = &*self.shared;
        let item = shared.items.get(item).ok_or(WellspringError::InvalidItem(item))?;
        self.ring.link(slot, &item, &shared.items, &shared.endpoints)
    }

    pub fn ring(&self) -> &PeriodicRing {
        &self.ring
    }

    /// Move the retirement cursor, e.g. when the periodic schedule starts
    pub fn restart_ring(&mut self, slot: usize) -> Result<(), WellspringError> {
        self.ring.restart(slot)
    }

    pub fn disable_ring(&mut self) {
        self.ring.disable();
    }

    pub fn frame_counter(&self) -> &FrameCounter {
        &self.frames
    }

    /// What the most recent periodic sweep did
    pub fn last_sweep(&self) -> SweepOutcome {
        self.last_sweep
    }
}

/// One primary pass over the active causes
struct Pass<'a> {
    shared: &'a ControllerShared,
    port: &'a dyn RegisterPort,
    clock: &'a dyn MonotonicClock,
    /// One clock sample per pass, shared by everything stamped in it
    timestamp: Option<u64>,
    wants_dispatch: bool,
}

impl Pass<'_> {
    fn run(
        &mut self,
        resolver: &dyn AddressResolver,
        ring: &mut PeriodicRing,
        frames: &mut FrameCounter,
        shadow: &mut DoneQueueSnapshot,
        last_sweep: &mut SweepOutcome,
    ) {
        let enabled = self.port.read_enabled_mask();
        if self.shared.config.family == ControllerFamily::DoneHead
            && !enabled.contains(InterruptCauses::MASTER_ENABLE)
        {
            return;
        }
        let active = enabled & self.port.read_status() & InterruptCauses::causes();
        if active.is_empty() {
            return;
        }

        for cause in InterruptCauses::PROCESSING_ORDER {
            if !active.contains(cause) {
                continue;
            }
            match cause {
                InterruptCauses::FRAME_ROLLOVER | InterruptCauses::FRAME_NUMBER_OVERFLOW => {
                    self.frame_rollover(cause, frames)
                }
                InterruptCauses::SCHEDULING_OVERRUN => {
                    self.shared.errors.schedule_overrun.bump();
                    self.clear(cause);
                }
                InterruptCauses::OWNERSHIP_CHANGE => {
                    self.shared.errors.ownership_change.bump();
                    self.clear(cause);
                }
                InterruptCauses::START_OF_FRAME => {
                    // one shot until the dispatcher re-arms it
                    self.clear(cause);
                    self.port.disable_causes(cause);
                    self.port.sync();
                }
                InterruptCauses::ROOT_HUB_STATUS_CHANGE => {
                    // some controllers ignore the clear, so mask it first
                    self.port.disable_causes(cause);
                    self.port.sync();
                    self.clear(cause);
                    self.request(cause);
                }
                InterruptCauses::HOST_ERROR => {
                    // every activation counts, even when the flag is still pending
                    self.shared.errors.host_error.bump();
                    self.clear(cause);
                    self.request(cause);
                }
                InterruptCauses::UNRECOVERABLE_ERROR => {
                    bump(&self.shared.errors.unrecoverable);
                    self.clear(cause);
                    self.request(cause);
                }
                InterruptCauses::COMPLETE => {
                    *last_sweep = self.complete(ring, shadow);
                }
                InterruptCauses::WRITE_DONE_HEAD => self.write_done_head(resolver, shadow),
                _ => {
                    self.clear(cause);
                    self.request(cause);
                }
            }
        }
    }

    fn now(&mut self) -> u64 {
        *self.timestamp.get_or_insert_with(|| self.clock.now())
    }

    fn request(&mut self, cause: InterruptCauses) {
        self.shared.pending.raise(cause);
        self.wants_dispatch = true;
    }

    /// Acknowledge `cause`, re-clearing a bit that does not retract
    fn clear(&self, cause: InterruptCauses) {
        self.port.clear_causes(cause);
        self.port.sync();

        let config = &self.shared.config;
        if !config.verified_clears.intersects(cause) {
            return;
        }
        let mut retries = 0;
        while self.port.read_status().intersects(cause) {
            if retries == config.stuck_bit_retries {
                // left for the next pass
                bump(&self.shared.errors.stuck_bits);
                return;
            }
            self.port.clear_causes(cause);
            self.port.sync();
            retries += 1;
        }
    }

    fn frame_rollover(&mut self, cause: InterruptCauses, frames: &mut FrameCounter) {
        let frame = frames.rollover(self.port.read_frame_index());
        let time = self.now();
        self.shared.staged_anchor.store(FrameAnchor { time, frame });
        if cause == InterruptCauses::FRAME_NUMBER_OVERFLOW {
            self.shared.errors.frame_overflow.bump();
        }
        self.clear(cause);
        self.request(cause);
    }

    fn complete(&mut self, ring: &mut PeriodicRing, shadow: &mut DoneQueueSnapshot) -> SweepOutcome {
        let timestamp = self.now();
        self.clear(InterruptCauses::COMPLETE);

        let shared = self.shared;
        let mut outcome = SweepOutcome::default();
        if shared.config.family == ControllerFamily::PeriodicList
            && !shared.isochronous_abort.load(Ordering::Acquire)
            && self.port.periodic_schedule_enabled()
            && ring.is_valid()
        {
            let mut batch = DoneQueueBatch::resume(*shadow);
            outcome = ring.sweep(
                self.port.read_frame_index(),
                timestamp,
                &shared.items,
                &shared.endpoints,
                &mut batch,
                &shared.latency,
            );
            *shadow = batch.publish(&shared.done_queue);
        }
        // published before the flag, so a drain that takes it sees the items
        self.request(InterruptCauses::COMPLETE);
        outcome
    }

    /// Take the hardware done head and chain it onto the done queue
    fn write_done_head(&mut self, resolver: &dyn AddressResolver, shadow: &mut DoneQueueSnapshot) {
        let timestamp = self.now();
        let shared = self.shared;
        shared.timing.done_head_at(timestamp);

        let mut phys = self.port.read_done_head_physical().masked(DONE_HEAD_ADDRESS_MASK);
        // zero the slot before acknowledging so the hardware can write a new head
        self.port.clear_done_head();
        self.clear(InterruptCauses::WRITE_DONE_HEAD);

        let items = &shared.items;
        let mut newest: Option<ItemHandle> = None;
        let mut previous: Option<ItemRef<'_>> = None;
        let mut count = 0u64;

        // a corrupted chain cannot hold more items than the arena
        while count < items.capacity() as u64 && !phys.is_null() {
            let Some(item) = resolver.to_logical(phys).and_then(|handle| items.get(handle)) else {
                break;
            };
            match previous {
                Some(previous) => previous.set_done_link(Some(item.handle())),
                None => newest = Some(item.handle()),
            }
            if item.is_low_latency() && item.kind().is_isochronous() {
                item.stamp(timestamp);
                shared.latency.record(item.decode_frames(Some(timestamp)));
            }
            if let Some(endpoint) = item.endpoint().and_then(|e| shared.endpoints.get(e)) {
                endpoint.moved_to_producer_queue();
            }
            count += 1;
            phys = item.hw_next().masked(DONE_HEAD_ADDRESS_MASK);
            previous = Some(item);
        }

        if let (Some(newest), Some(oldest)) = (newest, previous) {
            let mut batch = DoneQueueBatch::resume(*shadow);
            batch.splice(newest, &oldest, count);
            *shadow = batch.publish(&shared.done_queue);
        }
        self.request(InterruptCauses::WRITE_DONE_HEAD);
    }
}
