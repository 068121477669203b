//! # Items - The Work That Returns
//!
//! Completed transfer descriptors live in a fixed arena and are addressed by
//! stable [`ItemHandle`]s, never by pointer. Every field is an atomic so the
//! arena can be shared by both interrupt contexts; the ownership stages
//! (schedule, done queue, dispatcher) guarantee that only one context writes
//! an item at a time.
//!
//! An item carries two links:
//! - the hardware link (`hw_next`), a physical address written by the
//!   controller for done-head controllers
//! - the done-queue link, a logical handle used only while the item waits
//!   for the secondary handler. The done queue is not null terminated, so it
//!   must never be confused with a schedule list.

use crate::endpoint::EndpointHandle;
use crate::error::WellspringError;
use crate::register_port::PhysAddr;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Most frames a single isochronous item describes
pub const MAX_FRAMES_PER_ITEM: usize = 8;

/// Sentinel for an empty done-queue link
const NO_LINK: u32 = u32::MAX;

/// Slot states: claimed slots are being filled and stay invisible to `get`
const SLOT_FREE: u8 = 0;
const SLOT_CLAIMED: u8 = 1;
const SLOT_LIVE: u8 = 2;

/// Frame status before anything updated it
const FRAME_PENDING: u8 = 0xFF;

/// Condition code field of an item's control word
const CONTROL_CC_SHIFT: u32 = 28;

/// Packet status word: condition code and transferred size
const PSW_CC_SHIFT: u16 = 12;
const PSW_SIZE_MASK: u16 = 0x07FF;
/// Offset form of the same word: a 3-bit code meaning "never accessed"
const OFFSET_CC_SHIFT: u16 = 13;
const OFFSET_NOT_ACCESSED: u16 = 0x7;

/// Kind packing inside the `kind` byte
const KIND_MASK: u8 = 0b0011;
const KIND_LOW_LATENCY: u8 = 0b0100;
const KIND_OUT: u8 = 0b1000;

/// Stable index of an item in the [`ItemTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemHandle(pub u32);

impl ItemHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    fn encode(link: Option<ItemHandle>) -> u32 {
        link.map_or(NO_LINK, |handle| handle.0)
    }

    fn decode(raw: u32) -> Option<ItemHandle> {
        (raw != NO_LINK).then_some(ItemHandle(raw))
    }
}

/// What kind of transfer an item describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// Control, bulk or interrupt transfer
    General = 0,
    /// Isochronous transfer
    Isochronous = 1,
    /// Isochronous split transaction through a transaction translator
    SplitIsochronous = 2,
}

impl ItemKind {
    fn from_bits(bits: u8) -> Self {
        match bits & KIND_MASK {
            1 => ItemKind::Isochronous,
            2 => ItemKind::SplitIsochronous,
            _ => ItemKind::General,
        }
    }

    pub fn is_isochronous(self) -> bool {
        matches!(self, ItemKind::Isochronous | ItemKind::SplitIsochronous)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Hardware condition codes reported for a transfer or a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCode {
    NoError,
    Crc,
    BitStuffing,
    DataToggleMismatch,
    Stall,
    DeviceNotResponding,
    PidCheckFailure,
    UnexpectedPid,
    DataOverrun,
    DataUnderrun,
    BufferOverrun,
    BufferUnderrun,
    NotAccessed,
    Reserved(u8),
}

impl CompletionCode {
    pub fn from_raw(code: u8) -> Self {
        match code & 0xF {
            0 => CompletionCode::NoError,
            1 => CompletionCode::Crc,
            2 => CompletionCode::BitStuffing,
            3 => CompletionCode::DataToggleMismatch,
            4 => CompletionCode::Stall,
            5 => CompletionCode::DeviceNotResponding,
            6 => CompletionCode::PidCheckFailure,
            7 => CompletionCode::UnexpectedPid,
            8 => CompletionCode::DataOverrun,
            9 => CompletionCode::DataUnderrun,
            12 => CompletionCode::BufferOverrun,
            13 => CompletionCode::BufferUnderrun,
            14 | 15 => CompletionCode::NotAccessed,
            other => CompletionCode::Reserved(other),
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            CompletionCode::NoError => 0,
            CompletionCode::Crc => 1,
            CompletionCode::BitStuffing => 2,
            CompletionCode::DataToggleMismatch => 3,
            CompletionCode::Stall => 4,
            CompletionCode::DeviceNotResponding => 5,
            CompletionCode::PidCheckFailure => 6,
            CompletionCode::UnexpectedPid => 7,
            CompletionCode::DataOverrun => 8,
            CompletionCode::DataUnderrun => 9,
            CompletionCode::BufferOverrun => 12,
            CompletionCode::BufferUnderrun => 13,
            CompletionCode::NotAccessed => 15,
            CompletionCode::Reserved(code) => code & 0xF,
        }
    }

    pub fn is_success(self) -> bool {
        self == CompletionCode::NoError
    }
}

/// Status of one frame of an isochronous item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Not yet updated since the transfer was submitted
    Pending,
    Done(CompletionCode),
}

/// Point-in-time copy of one frame record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSnapshot {
    pub status: FrameStatus,
    pub requested: u16,
    pub actual: u16,
    pub timestamp: u64,
}

#[derive(Default)]
struct FrameRecord {
    status: AtomicU8,
    requested: AtomicU16,
    actual: AtomicU16,
    /// Packet status word as written by the controller
    hw_status: AtomicU16,
    timestamp: AtomicU64,
}

/// Result of updating an item's frame records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameUpdate {
    pub updated: u32,
    /// Frames that had already been updated before this pass
    pub errors: u32,
}

/// Everything the submission path knows about a new item
#[derive(Debug, Clone)]
pub struct ItemDescriptor {
    pub kind: ItemKind,
    pub low_latency: bool,
    pub direction: Direction,
    pub endpoint: Option<EndpointHandle>,
    pub phys: PhysAddr,
    /// Requested byte count of each frame
    pub frames: heapless::Vec<u16, MAX_FRAMES_PER_ITEM>,
}

impl ItemDescriptor {
    pub fn general() -> Self {
        Self {
            kind: ItemKind::General,
            low_latency: false,
            direction: Direction::In,
            endpoint: None,
            phys: PhysAddr::NULL,
            frames: heapless::Vec::new(),
        }
    }

    pub fn isochronous() -> Self {
        Self { kind: ItemKind::Isochronous, ..Self::general() }
    }

    pub fn split_isochronous() -> Self {
        Self { kind: ItemKind::SplitIsochronous, ..Self::general() }
    }

    pub fn low_latency(mut self) -> Self {
        self.low_latency = true;
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn endpoint(mut self, endpoint: EndpointHandle) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn phys(mut self, phys: PhysAddr) -> Self {
        self.phys = phys;
        self
    }

    /// Describe the requested size of each frame; extra frames are dropped
    pub fn frames(mut self, requested: &[u16]) -> Self {
        self.frames.clear();
        for &count in requested.iter().take(MAX_FRAMES_PER_ITEM) {
            let _ = self.frames.push(count);
        }
        self
    }
}

#[derive(Default)]
struct ItemSlot {
    state: AtomicU8,
    kind: AtomicU8,
    endpoint: AtomicU16,
    phys: AtomicU32,
    hw_next: AtomicU32,
    hw_control: AtomicU32,
    done_link: AtomicU32,
    timestamp: AtomicU64,
    frame_count: AtomicU8,
    frames: [FrameRecord; MAX_FRAMES_PER_ITEM],
}

/// Arena of items, allocated once when the controller is set up
pub struct ItemTable {
    slots: Vec<ItemSlot>,
}

impl ItemTable {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, ItemSlot::default);
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim a free slot and fill it from `descriptor`
    ///
    /// Runs in the submission path, never in interrupt context.
    pub fn allocate(&self, descriptor: &ItemDescriptor) -> Result<ItemHandle, WellspringError> {
        let (index, slot) = self
            .slots
            .iter()
            .enumerate()
            .find(|(_, slot)| {
                slot.state
                    .compare_exchange(SLOT_FREE, SLOT_CLAIMED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
            .ok_or(WellspringError::ItemTableFull)?;

        let mut kind = descriptor.kind as u8;
        if descriptor.low_latency {
            kind |= KIND_LOW_LATENCY;
        }
        if descriptor.direction == Direction::Out {
            kind |= KIND_OUT;
        }
        slot.kind.store(kind, Ordering::Relaxed);
        slot.endpoint.store(
            descriptor.endpoint.map_or(EndpointHandle::NONE, |e| e.0),
            Ordering::Relaxed,
        );
        slot.phys.store(descriptor.phys.0, Ordering::Relaxed);
        slot.hw_next.store(0, Ordering::Relaxed);
        slot.hw_control.store(0, Ordering::Relaxed);
        slot.done_link.store(NO_LINK, Ordering::Relaxed);
        slot.timestamp.store(0, Ordering::Relaxed);
        slot.frame_count.store(descriptor.frames.len() as u8, Ordering::Relaxed);
        for (record, requested) in slot.frames.iter().zip(descriptor.frames.iter()) {
            record.status.store(FRAME_PENDING, Ordering::Relaxed);
            record.requested.store(*requested, Ordering::Relaxed);
            record.actual.store(0, Ordering::Relaxed);
            record.hw_status.store(0, Ordering::Relaxed);
            record.timestamp.store(0, Ordering::Relaxed);
        }
        slot.state.store(SLOT_LIVE, Ordering::Release);

        Ok(ItemHandle(index as u32))
    }

    /// Return a slot to the free pool
    pub fn release(&self, handle: ItemHandle) -> Result<(), WellspringError> {
        let item = self.get(handle).ok_or(WellspringError::InvalidItem(handle))?;
        item.slot.state.store(SLOT_FREE, Ordering::Release);
        Ok(())
    }

    pub fn get(&self, handle: ItemHandle) -> Option<ItemRef<'_>> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.state.load(Ordering::Acquire) == SLOT_LIVE)
            .map(|slot| ItemRef { handle, slot })
    }
}

/// Borrowed view of one live item
#[derive(Clone, Copy)]
pub struct ItemRef<'a> {
    handle: ItemHandle,
    slot: &'a ItemSlot,
}

impl<'a> ItemRef<'a> {
    pub fn handle(&self) -> ItemHandle {
        self.handle
    }

    pub fn kind(&self) -> ItemKind {
        ItemKind::from_bits(self.slot.kind.load(Ordering::Relaxed))
    }

    pub fn is_low_latency(&self) -> bool {
        self.slot.kind.load(Ordering::Relaxed) & KIND_LOW_LATENCY != 0
    }

    pub fn direction(&self) -> Direction {
        if self.slot.kind.load(Ordering::Relaxed) & KIND_OUT != 0 {
            Direction::Out
        } else {
            Direction::In
        }
    }

    pub fn endpoint(&self) -> Option<EndpointHandle> {
        match self.slot.endpoint.load(Ordering::Relaxed) {
            EndpointHandle::NONE => None,
            raw => Some(EndpointHandle(raw)),
        }
    }

    pub fn phys(&self) -> PhysAddr {
        PhysAddr(self.slot.phys.load(Ordering::Relaxed))
    }

    /// Hardware link to the next item, as written by the controller
    pub fn hw_next(&self) -> PhysAddr {
        PhysAddr(self.slot.hw_next.load(Ordering::Acquire))
    }

    pub fn set_hw_next(&self, next: PhysAddr) {
        self.slot.hw_next.store(next.0, Ordering::Release);
    }

    /// Control word written back by the controller on completion
    pub fn set_hw_control(&self, control: u32) {
        self.slot.hw_control.store(control, Ordering::Release);
    }

    pub fn condition_code(&self) -> CompletionCode {
        let control = self.slot.hw_control.load(Ordering::Acquire);
        CompletionCode::from_raw((control >> CONTROL_CC_SHIFT) as u8)
    }

    pub fn done_link(&self) -> Option<ItemHandle> {
        ItemHandle::decode(self.slot.done_link.load(Ordering::Relaxed))
    }

    pub(crate) fn set_done_link(&self, link: Option<ItemHandle>) {
        self.slot.done_link.store(ItemHandle::encode(link), Ordering::Relaxed);
    }

    /// Completion timestamp; zero until a primary pass stamped the item
    pub fn timestamp(&self) -> u64 {
        self.slot.timestamp.load(Ordering::Relaxed)
    }

    pub(crate) fn stamp(&self, timestamp: u64) {
        self.slot.timestamp.store(timestamp, Ordering::Relaxed);
    }

    pub fn frame_count(&self) -> usize {
        (self.slot.frame_count.load(Ordering::Relaxed) as usize).min(MAX_FRAMES_PER_ITEM)
    }

    /// Packet status word written by the controller for one frame
    pub fn set_frame_hw_status(&self, frame: usize, status: u16) {
        if let Some(record) = self.slot.frames.get(frame) {
            record.hw_status.store(status, Ordering::Release);
        }
    }

    pub fn frame(&self, frame: usize) -> Option<FrameSnapshot> {
        if frame >= self.frame_count() {
            return None;
        }
        let record = &self.slot.frames[frame];
        let status = match record.status.load(Ordering::Relaxed) {
            FRAME_PENDING => FrameStatus::Pending,
            code => FrameStatus::Done(CompletionCode::from_raw(code)),
        };
        Some(FrameSnapshot {
            status,
            requested: record.requested.load(Ordering::Relaxed),
            actual: record.actual.load(Ordering::Relaxed),
            timestamp: record.timestamp.load(Ordering::Relaxed),
        })
    }

    /// Stamp every frame with `timestamp` and leave status untouched
    pub(crate) fn stamp_frames(&self, timestamp: u64) -> FrameUpdate {
        let mut update = FrameUpdate::default();
        for record in &self.slot.frames[..self.frame_count()] {
            update.updated += 1;
            record.timestamp.store(timestamp, Ordering::Relaxed);
        }
        update
    }

    /// Decode the controller's packet status words into frame records
    ///
    /// A frame the controller never accessed reports zero bytes. A
    /// successful OUT frame reports its requested size, everything else
    /// the size the controller wrote back.
    pub(crate) fn decode_frames(&self, timestamp: Option<u64>) -> FrameUpdate {
        let mut update = FrameUpdate::default();
        let out = self.direction() == Direction::Out;

        for record in &self.slot.frames[..self.frame_count()] {
            update.updated += 1;
            if record.status.load(Ordering::Relaxed) != FRAME_PENDING {
                update.errors += 1;
            }
            if let Some(timestamp) = timestamp {
                record.timestamp.store(timestamp, Ordering::Relaxed);
            }

            let psw = record.hw_status.load(Ordering::Acquire);
            if psw >> OFFSET_CC_SHIFT == OFFSET_NOT_ACCESSED {
                record.actual.store(0, Ordering::Relaxed);
                record.status.store(CompletionCode::NotAccessed.to_raw(), Ordering::Relaxed);
                continue;
            }

            let code = CompletionCode::from_raw((psw >> PSW_CC_SHIFT) as u8);
            let actual = if code.is_success() && out {
                record.requested.load(Ordering::Relaxed)
            } else {
                psw & PSW_SIZE_MASK
            };
            record.actual.store(actual, Ordering::Relaxed);
            record.status.store(code.to_raw(), Ordering::Relaxed);
        }
        update
    }
}
