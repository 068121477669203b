//! Controller configuration
//!
//! One [`WellspringConfig`] per controller instance. The two presets match
//! the two controller families; everything else is a tunable with a
//! sensible default.

use crate::causes::InterruptCauses;

/// Longest periodic frame list a controller can have
pub const MAX_PERIODIC_LIST_LEN: usize = 1024;

/// Most root hub ports a controller can report
pub const MAX_ROOT_PORTS: usize = 15;

/// Default number of re-clears for a status bit that does not retract
pub const DEFAULT_STUCK_BIT_RETRIES: u32 = 10;

/// Largest item arena; handles must stay clear of the link sentinel
pub const MAX_ITEM_CAPACITY: usize = 1 << 20;

/// Largest endpoint table; handles must stay clear of the "no endpoint" sentinel
pub const MAX_ENDPOINT_CAPACITY: usize = u16::MAX as usize;

/// How completed items are discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerFamily {
    /// Completed isochronous items are swept out of a ring of frame-list slots
    PeriodicList,
    /// The controller writes a done-head physical address and chains items
    DoneHead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    PeriodicListLength(usize),
    FrameIndexBits { index_bits: u32, subslot_bits: u32 },
    ItemCapacity(usize),
    EndpointCapacity(usize),
    TooManyRootPorts(usize),
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigError::PeriodicListLength(len) => write!(
                f,
                "Periodic list length {} is not a power of two in 1..={}",
                len, MAX_PERIODIC_LIST_LEN
            ),
            ConfigError::FrameIndexBits { index_bits, subslot_bits } => write!(
                f,
                "Frame index of {} bits cannot hold {} sub-slot bits",
                index_bits, subslot_bits
            ),
            ConfigError::ItemCapacity(n) => {
                write!(f, "Item capacity {} outside 1..={}", n, MAX_ITEM_CAPACITY)
            }
            ConfigError::EndpointCapacity(n) => {
                write!(f, "Endpoint capacity {} outside 1..={}", n, MAX_ENDPOINT_CAPACITY)
            }
            ConfigError::TooManyRootPorts(n) => {
                write!(f, "{} root ports exceeds the limit of {}", n, MAX_ROOT_PORTS)
            }
        }
    }
}

/// Configuration of one controller instance
#[derive(Debug, Clone, Copy)]
pub struct WellspringConfig {
    pub family: ControllerFamily,
    /// Slots in the periodic ring (power of two)
    pub periodic_list_len: usize,
    /// Width of the hardware frame index and how many of its low bits
    /// count sub-slots (micro-frames)
    pub frame_index_bits: u32,
    pub frame_subslot_bits: u32,
    /// Re-clears attempted for a status bit that does not retract
    pub stuck_bit_retries: u32,
    /// Causes whose clear is read back and retried
    pub verified_clears: InterruptCauses,
    pub item_capacity: usize,
    pub endpoint_capacity: usize,
    /// Root ports tracked for remote-wakeup resume
    pub root_ports: usize,
    /// Rebuild the bus after a host system error
    pub recover_on_host_error: bool,
    /// Controller sits on a hot-pluggable bus (spurious errors while ejecting)
    pub on_removable_bus: bool,
}

impl Default for WellspringConfig {
    fn default() -> Self {
        Self::periodic_list()
    }
}

impl WellspringConfig {
    /// Preset for periodic-frame-list controllers
    pub fn periodic_list() -> Self {
        Self {
            family: ControllerFamily::PeriodicList,
            periodic_list_len: MAX_PERIODIC_LIST_LEN,
            frame_index_bits: 14,
            frame_subslot_bits: 3,
            stuck_bit_retries: DEFAULT_STUCK_BIT_RETRIES,
            verified_clears: InterruptCauses::PORT_CHANGE,
            item_capacity: 512,
            endpoint_capacity: 64,
            root_ports: MAX_ROOT_PORTS,
            recover_on_host_error: false,
            on_removable_bus: false,
        }
    }

    /// Preset for done-head controllers
    pub fn done_head() -> Self {
        Self {
            family: ControllerFamily::DoneHead,
            frame_index_bits: 16,
            frame_subslot_bits: 0,
            verified_clears: InterruptCauses::empty(),
            ..Self::periodic_list()
        }
    }

    pub fn with_periodic_list_len(mut self, len: usize) -> Self {
        self.periodic_list_len = len;
        self
    }

    /// Width of the hardware frame index and of its micro-frame field
    pub fn with_frame_index_bits(mut self, index_bits: u32, subslot_bits: u32) -> Self {
        self.frame_index_bits = index_bits;
        self.frame_subslot_bits = subslot_bits;
        self
    }

    pub fn with_item_capacity(mut self, capacity: usize) -> Self {
        self.item_capacity = capacity;
        self
    }

    pub fn with_endpoint_capacity(mut self, capacity: usize) -> Self {
        self.endpoint_capacity = capacity;
        self
    }

    pub fn with_root_ports(mut self, ports: usize) -> Self {
        self.root_ports = ports;
        self
    }

    pub fn with_stuck_bit_retries(mut self, retries: u32) -> Self {
        self.stuck_bit_retries = retries;
        self
    }

    pub fn with_verified_clears(mut self, causes: InterruptCauses) -> Self {
        self.verified_clears = causes;
        self
    }

    pub fn with_host_error_recovery(mut self, enabled: bool) -> Self {
        self.recover_on_host_error = enabled;
        self
    }

    pub fn on_removable_bus(mut self, removable: bool) -> Self {
        self.on_removable_bus = removable;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let len = self.periodic_list_len;
        if len == 0 || len > MAX_PERIODIC_LIST_LEN || !len.is_power_of_two() {
            return Err(ConfigError::PeriodicListLength(len));
        }
        if self.frame_index_bits == 0
            || self.frame_index_bits > 31
            || self.frame_subslot_bits >= self.frame_index_bits
        {
            return Err(ConfigError::FrameIndexBits {
                index_bits: self.frame_index_bits,
                subslot_bits: self.frame_subslot_bits,
            });
        }
        if self.item_capacity == 0 || self.item_capacity > MAX_ITEM_CAPACITY {
            return Err(ConfigError::ItemCapacity(self.item_capacity));
        }
        if self.endpoint_capacity == 0 || self.endpoint_capacity > MAX_ENDPOINT_CAPACITY {
            return Err(ConfigError::EndpointCapacity(self.endpoint_capacity));
        }
        if self.root_ports > MAX_ROOT_PORTS {
            return Err(ConfigError::TooManyRootPorts(self.root_ports));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(WellspringConfig::periodic_list().validate().is_ok());
        assert!(WellspringConfig::done_head().validate().is_ok());
        assert_eq!(WellspringConfig::default().family, ControllerFamily::PeriodicList);
    }

    #[test]
    fn test_periodic_list_must_be_power_of_two() {
        for len in [0, 3, 12, 2048] {
            assert_eq!(
                WellspringConfig::periodic_list().with_periodic_list_len(len).validate(),
                Err(ConfigError::PeriodicListLength(len))
            );
        }
        assert!(WellspringConfig::periodic_list().with_periodic_list_len(8).validate().is_ok());
    }

    #[test]
    fn test_capacity_and_port_limits() {
        assert_eq!(
            WellspringConfig::done_head().with_item_capacity(0).validate(),
            Err(ConfigError::ItemCapacity(0))
        );
        assert_eq!(
            WellspringConfig::done_head().with_endpoint_capacity(0).validate(),
            Err(ConfigError::EndpointCapacity(0))
        );
        assert_eq!(
            WellspringConfig::done_head().with_root_ports(16).validate(),
            Err(ConfigError::TooManyRootPorts(16))
        );
    }

    #[test]
    fn test_subslot_bits_must_fit_in_index() {
        let mut config = WellspringConfig::periodic_list();
        config.frame_subslot_bits = 14;
        assert!(matches!(config.validate(), Err(ConfigError::FrameIndexBits { .. })));
    }
}
