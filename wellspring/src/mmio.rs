//! Memory-Mapped Register Port
//!
//! A [`RegisterPort`] over a memory-mapped register window. The register
//! layout and the mapping between hardware cause bits and
//! [`InterruptCauses`] come from a [`RegisterLayout`]; all registers are
//! little-endian on the bus and converted at this boundary.

use crate::causes::InterruptCauses;
use crate::register_port::{PhysAddr, RegisterPort};
use core::ptr::NonNull;
use core::sync::atomic::{fence, Ordering};
use volatile::VolatilePtr;

/// How many status polls a reset may take before we give up waiting
const RESET_POLL_LIMIT: u32 = 1000;

/// Offset of the done-head word inside the host controller communication area
const HCCA_DONE_HEAD: usize = 0x84;

/// Register layout of one controller family
#[derive(Debug, Clone, Copy)]
pub struct RegisterLayout {
    /// Interrupt status register (write-one-to-clear)
    pub status: usize,
    /// Interrupt enable register
    pub enable: usize,
    /// Write-one-to-disable register; `None` means read-modify-write of `enable`
    pub disable: Option<usize>,
    /// Frame index register and the bits of it that count
    pub frame_index: usize,
    pub frame_index_mask: u32,
    /// Command register, its periodic-schedule-enable bit and run value
    pub command: usize,
    pub periodic_enable: u32,
    pub operational: u32,
    /// Register holding the self-clearing reset bit
    pub reset: usize,
    pub reset_bit: u32,
    /// First port status register and the bit that reports resume
    pub port_status: usize,
    pub port_resume_bit: u32,
    /// Hardware bit -> normalized cause
    pub cause_bits: &'static [(u32, InterruptCauses)],
}

const PERIODIC_LIST_CAUSES: &[(u32, InterruptCauses)] = &[
    (1 << 0, InterruptCauses::COMPLETE),
    (1 << 1, InterruptCauses::ERROR),
    (1 << 2, InterruptCauses::PORT_CHANGE),
    (1 << 3, InterruptCauses::FRAME_ROLLOVER),
    (1 << 4, InterruptCauses::HOST_ERROR),
    (1 << 5, InterruptCauses::ASYNC_ADVANCE),
];

const DONE_HEAD_CAUSES: &[(u32, InterruptCauses)] = &[
    (1 << 0, InterruptCauses::SCHEDULING_OVERRUN),
    (1 << 1, InterruptCauses::WRITE_DONE_HEAD),
    (1 << 2, InterruptCauses::START_OF_FRAME),
    (1 << 3, InterruptCauses::RESUME_DETECTED),
    (1 << 4, InterruptCauses::UNRECOVERABLE_ERROR),
    (1 << 5, InterruptCauses::FRAME_NUMBER_OVERFLOW),
    (1 << 6, InterruptCauses::ROOT_HUB_STATUS_CHANGE),
    (1 << 30, InterruptCauses::OWNERSHIP_CHANGE),
    (1 << 31, InterruptCauses::MASTER_ENABLE),
];

impl RegisterLayout {
    /// Operational registers of a periodic-frame-list (EHCI-style) controller
    pub const fn periodic_list() -> Self {
        Self {
            status: 0x04,
            enable: 0x08,
            disable: None,
            frame_index: 0x0C,
            frame_index_mask: 0x3FFF,
            command: 0x00,
            periodic_enable: 1 << 4,
            operational: 1 << 0,
            reset: 0x00,
            reset_bit: 1 << 1,
            port_status: 0x44,
            port_resume_bit: 1 << 6,
            cause_bits: PERIODIC_LIST_CAUSES,
        }
    }

    /// Registers of a done-head (OHCI-style) controller
    pub const fn done_head() -> Self {
        Self {
            status: 0x0C,
            enable: 0x10,
            disable: Some(0x14),
            frame_index: 0x3C,
            frame_index_mask: 0xFFFF,
            command: 0x04,
            periodic_enable: 1 << 2,
            // operational functional state plus periodic list enable
            operational: (0x2 << 6) | (1 << 2),
            reset: 0x08,
            reset_bit: 1 << 0,
            port_status: 0x54,
            port_resume_bit: 1 << 2,
            cause_bits: DONE_HEAD_CAUSES,
        }
    }

    /// Translate a hardware register value into causes
    pub fn decode(&self, raw: u32) -> InterruptCauses {
        self.cause_bits
            .iter()
            .filter(|(bit, _)| raw & bit != 0)
            .fold(InterruptCauses::empty(), |acc, (_, cause)| acc | *cause)
    }

    /// Translate causes into a hardware register value
    pub fn encode(&self, causes: InterruptCauses) -> u32 {
        self.cause_bits
            .iter()
            .filter(|(_, cause)| causes.contains(*cause))
            .fold(0, |acc, (bit, _)| acc | bit)
    }
}

/// Register port over a memory-mapped window
pub struct MmioRegisterPort {
    base: NonNull<u8>,
    hcca: Option<NonNull<u8>>,
    layout: RegisterLayout,
    ports: usize,
}

// SAFETY: the window is device memory; every access is a single volatile
// 32-bit load or store, and writers are serialized by the interrupt token.
unsafe impl Send for MmioRegisterPort {}
unsafe impl Sync for MmioRegisterPort {}

impl MmioRegisterPort {
    /// Create a port over a register window
    ///
    /// # Safety
    ///
    /// `base` must point to a mapped, 4-byte aligned register window that
    /// covers every offset in `layout` (including `ports` port status
    /// registers) and stays mapped for the lifetime of the port.
    pub unsafe fn new(base: NonNull<u8>, layout: RegisterLayout, ports: usize) -> Self {
        Self {
            base,
            hcca: None,
            layout,
            ports,
        }
    }

    /// Attach the host controller communication area holding the done head
    ///
    /// # Safety
    ///
    /// `hcca` must point to a mapped, 4-byte aligned communication area of
    /// at least 256 bytes that outlives the port.
    pub unsafe fn with_hcca(mut self, hcca: NonNull<u8>) -> Self {
        self.hcca = Some(hcca);
        self
    }

    pub fn layout(&self) -> &RegisterLayout {
        &self.layout
    }

    fn word(area: NonNull<u8>, offset: usize) -> VolatilePtr<'static, u32> {
        // SAFETY: constructor contracts guarantee `offset` lies inside the
        // mapped, aligned area.
        unsafe {
            let ptr = area.as_ptr().add(offset).cast::<u32>();
            VolatilePtr::new(NonNull::new_unchecked(ptr))
        }
    }

    fn read(&self, offset: usize) -> u32 {
        u32::from_le(Self::word(self.base, offset).read())
    }

    fn write(&self, offset: usize, value: u32) {
        Self::word(self.base, offset).write(value.to_le());
    }
}

impl RegisterPort for MmioRegisterPort {
    fn read_status(&self) -> InterruptCauses {
        self.layout.decode(self.read(self.layout.status))
    }

    fn read_enabled_mask(&self) -> InterruptCauses {
        self.layout.decode(self.read(self.layout.enable))
    }

    fn clear_causes(&self, causes: InterruptCauses) {
        self.write(self.layout.status, self.layout.encode(causes));
    }

    fn disable_causes(&self, causes: InterruptCauses) {
        let bits = self.layout.encode(causes);
        match self.layout.disable {
            Some(disable) => self.write(disable, bits),
            None => {
                let enabled = self.read(self.layout.enable);
                self.write(self.layout.enable, enabled & !bits);
            }
        }
    }

    fn enable_causes(&self, causes: InterruptCauses) {
        let bits = self.layout.encode(causes);
        match self.layout.disable {
            // write-one-to-set enable register
            Some(_) => self.write(self.layout.enable, bits),
            None => {
                let enabled = self.read(self.layout.enable);
                self.write(self.layout.enable, enabled | bits);
            }
        }
    }

    fn sync(&self) {
        fence(Ordering::SeqCst);
        // flush posted writes
        let _ = self.read(self.layout.status);
    }

    fn read_frame_index(&self) -> u32 {
        self.read(self.layout.frame_index) & self.layout.frame_index_mask
    }

    fn read_done_head_physical(&self) -> PhysAddr {
        match self.hcca {
            Some(hcca) => PhysAddr(u32::from_le(Self::word(hcca, HCCA_DONE_HEAD).read())),
            None => PhysAddr::NULL,
        }
    }

    fn clear_done_head(&self) {
        if let Some(hcca) = self.hcca {
            Self::word(hcca, HCCA_DONE_HEAD).write(0);
        }
    }

    fn periodic_schedule_enabled(&self) -> bool {
        self.read(self.layout.command) & self.layout.periodic_enable != 0
    }

    fn port_count(&self) -> usize {
        self.ports
    }

    fn port_resume_detected(&self, port: usize) -> bool {
        if port >= self.ports {
            return false;
        }
        self.read(self.layout.port_status + port * 4) & self.layout.port_resume_bit != 0
    }

    fn reset_controller(&self) {
        let value = self.read(self.layout.reset);
        self.write(self.layout.reset, value | self.layout.reset_bit);
        self.sync();

        // The reset bit clears itself once the controller has settled
        let mut polls = 0;
        while self.read(self.layout.reset) & self.layout.reset_bit != 0 && polls < RESET_POLL_LIMIT {
            core::hint::spin_loop();
            polls += 1;
        }
        if polls == RESET_POLL_LIMIT {
            log::warn!("[WELLSPRING] controller reset did not settle after {} polls", polls);
        }
    }

    fn set_operational(&self) {
        let value = self.read(self.layout.command);
        self.write(self.layout.command, value | self.layout.operational);
        self.sync();
    }
}
