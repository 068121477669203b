//! Endpoints - Where Items Belong
//!
//! Items keep a non-owning back reference to their endpoint. The endpoint
//! counts how many of its items sit in each ownership stage so that
//! teardown can wait for them to drain.

use crate::error::WellspringError;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Stable index of an endpoint in the [`EndpointTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointHandle(pub u16);

impl EndpointHandle {
    /// Sentinel stored in items that have no endpoint
    pub(crate) const NONE: u16 = u16::MAX;

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Per-endpoint bookkeeping shared by both interrupt contexts
#[derive(Default)]
pub struct Endpoint {
    in_use: AtomicBool,
    /// Split transfers of this endpoint wrap into the next frame slot
    wraps_frames: AtomicBool,
    scheduled: AtomicU32,
    on_producer_queue: AtomicU32,
    on_reversed_list: AtomicU32,
}

/// Point-in-time copy of an endpoint's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointSnapshot {
    pub wraps_frames: bool,
    pub scheduled: u32,
    pub on_producer_queue: u32,
    pub on_reversed_list: u32,
}

impl Endpoint {
    pub fn wraps_frames(&self) -> bool {
        self.wraps_frames.load(Ordering::Relaxed)
    }

    pub fn set_wraps_frames(&self, wraps: bool) {
        self.wraps_frames.store(wraps, Ordering::Relaxed);
    }

    /// An item of this endpoint was linked into the schedule
    pub fn note_scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::AcqRel);
    }

    /// Primary context moved an item from the schedule to the done queue
    pub(crate) fn moved_to_producer_queue(&self) {
        self.on_producer_queue.fetch_add(1, Ordering::AcqRel);
        let _ = self
            .scheduled
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Secondary context took an item off the done queue
    pub(crate) fn moved_to_reversed_list(&self) {
        let _ = self
            .on_producer_queue
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.on_reversed_list.fetch_add(1, Ordering::AcqRel);
    }

    /// The item was handed to the completion scavenger
    pub(crate) fn retired(&self) {
        let _ = self
            .on_reversed_list
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            wraps_frames: self.wraps_frames(),
            scheduled: self.scheduled.load(Ordering::Acquire),
            on_producer_queue: self.on_producer_queue.load(Ordering::Acquire),
            on_reversed_list: self.on_reversed_list.load(Ordering::Acquire),
        }
    }
}

/// Fixed-capacity table of endpoints, allocated once at controller setup
pub struct EndpointTable {
    endpoints: Vec<Endpoint>,
}

impl EndpointTable {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut endpoints = Vec::with_capacity(capacity);
        endpoints.resize_with(capacity, Endpoint::default);
        Self { endpoints }
    }

    pub fn capacity(&self) -> usize {
        self.endpoints.len()
    }

    /// Claim a free endpoint slot
    pub fn open(&self, wraps_frames: bool) -> Result<EndpointHandle, WellspringError> {
        for (index, endpoint) in self.endpoints.iter().enumerate() {
            if endpoint
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                endpoint.set_wraps_frames(wraps_frames);
                endpoint.scheduled.store(0, Ordering::Release);
                endpoint.on_producer_queue.store(0, Ordering::Release);
                endpoint.on_reversed_list.store(0, Ordering::Release);
                return Ok(EndpointHandle(index as u16));
            }
        }
        Err(WellspringError::EndpointTableFull)
    }

    /// Release an endpoint slot for reuse
    pub fn close(&self, handle: EndpointHandle) -> Result<(), WellspringError> {
        let endpoint = self.get(handle).ok_or(WellspringError::InvalidEndpoint(handle))?;
        endpoint.in_use.store(false, Ordering::Release);
        Ok(())
    }

    pub fn get(&self, handle: EndpointHandle) -> Option<&Endpoint> {
        self.endpoints
            .get(handle.index())
            .filter(|endpoint| endpoint.in_use.load(Ordering::Acquire))
    }
}
