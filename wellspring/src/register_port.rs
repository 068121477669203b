//! Register Port - The Controller's Voice
//!
//! The interrupt core never touches controller registers directly. It talks
//! to a [`RegisterPort`], which owns the register layout and byte order and
//! hands back host-order values.

use crate::causes::InterruptCauses;
use crate::item::ItemHandle;

/// A bus (physical) address as seen by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PhysAddr(pub u32);

impl PhysAddr {
    pub const NULL: PhysAddr = PhysAddr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Keep only the address bits selected by `mask`
    pub fn masked(self, mask: u32) -> Self {
        PhysAddr(self.0 & mask)
    }
}

/// Register access capability for one host controller
///
/// Every write must reach the device in program order. After clearing a
/// status bit the caller issues [`RegisterPort::sync`] before reading
/// anything that depends on the clear.
///
/// # Thread Safety
///
/// The port is shared by the primary and secondary contexts. Only the
/// context currently processing interrupts writes through it.
pub trait RegisterPort: Send + Sync {
    /// Raw interrupt status, normalized to [`InterruptCauses`]
    fn read_status(&self) -> InterruptCauses;

    /// Causes currently enabled (including the master enable bit, if any)
    fn read_enabled_mask(&self) -> InterruptCauses;

    /// Acknowledge causes (write-one-to-clear)
    fn clear_causes(&self, causes: InterruptCauses);

    /// Stop causes from raising interrupts
    fn disable_causes(&self, causes: InterruptCauses);

    /// Allow causes to raise interrupts again
    fn enable_causes(&self, causes: InterruptCauses);

    /// Write barrier: every preceding write has reached the device
    fn sync(&self);

    /// Current hardware frame index in its native width
    fn read_frame_index(&self) -> u32;

    /// Physical address of the hardware-written done head
    fn read_done_head_physical(&self) -> PhysAddr {
        PhysAddr::NULL
    }

    /// Zero the hardware done-head slot so a stale head is never walked twice
    fn clear_done_head(&self) {}

    /// Whether the periodic schedule is enabled in the command register
    fn periodic_schedule_enabled(&self) -> bool {
        false
    }

    /// Number of root hub ports
    fn port_count(&self) -> usize {
        0
    }

    /// Whether a root port is signalling resume
    fn port_resume_detected(&self, _port: usize) -> bool {
        false
    }

    /// Software reset of the host controller. Returns once the reset settled.
    fn reset_controller(&self);

    /// Put the controller back into its operational state after a reset
    fn set_operational(&self);
}

/// Translates hardware (physical) item addresses into arena handles
///
/// Only the done-head family needs this: its completed items are reported
/// by physical address.
pub trait AddressResolver: Send + Sync {
    fn to_logical(&self, phys: PhysAddr) -> Option<ItemHandle>;
}

/// Resolver for controllers that never report physical item addresses
pub struct NoAddresses;

impl AddressResolver for NoAddresses {
    fn to_logical(&self, _phys: PhysAddr) -> Option<ItemHandle> {
        None
    }
}
