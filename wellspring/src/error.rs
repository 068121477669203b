//! Errors surfaced by setup and bookkeeping paths
//!
//! Neither interrupt context reports errors to a caller: the primary handler
//! only counts, the secondary handler logs. These errors come from building
//! a controller, submitting items and driving the lifecycle.

use crate::config::ConfigError;
use crate::done_queue::DoneQueueError;
use crate::endpoint::EndpointHandle;
use crate::item::ItemHandle;
use crate::state::StateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WellspringError {
    /// Configuration rejected by validation
    Config(ConfigError),
    /// Lifecycle transition not allowed
    State(StateError),
    /// Bus recovery failed
    Recovery(RecoveryError),
    /// Done-queue walk found an inconsistent list
    DoneQueue(DoneQueueError),
    /// No free item slots
    ItemTableFull,
    /// No free endpoint slots
    EndpointTableFull,
    /// Handle does not name a live item
    InvalidItem(ItemHandle),
    /// Handle does not name an open endpoint
    InvalidEndpoint(EndpointHandle),
    /// Periodic slot index outside the ring
    SlotOutOfRange { slot: usize, len: usize },
    /// Item is already linked into the periodic ring
    AlreadyScheduled(ItemHandle),
}

/// Why a bus recovery attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryError {
    /// Hardware did not come back after reinitialization
    ReinitializeFailed,
    /// Root device could not be recreated
    RootDeviceFailed,
}

impl core::fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RecoveryError::ReinitializeFailed => write!(f, "Controller reinitialization failed"),
            RecoveryError::RootDeviceFailed => write!(f, "Root device could not be recreated"),
        }
    }
}

impl core::fmt::Display for WellspringError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WellspringError::Config(e) => write!(f, "Invalid configuration: {}", e),
            WellspringError::State(e) => write!(f, "Lifecycle error: {}", e),
            WellspringError::Recovery(e) => write!(f, "Bus recovery failed: {}", e),
            WellspringError::DoneQueue(e) => write!(f, "Done queue corrupted: {}", e),
            WellspringError::ItemTableFull => write!(f, "Item table is full"),
            WellspringError::EndpointTableFull => write!(f, "Endpoint table is full"),
            WellspringError::InvalidItem(h) => write!(f, "Item {} is not allocated", h.0),
            WellspringError::InvalidEndpoint(h) => write!(f, "Endpoint {} is not open", h.0),
            WellspringError::SlotOutOfRange { slot, len } => {
                write!(f, "Slot {} outside a ring of {} slots", slot, len)
            }
            WellspringError::AlreadyScheduled(h) => write!(f, "Item {} is already scheduled", h.0),
        }
    }
}

impl From<ConfigError> for WellspringError {
    fn from(e: ConfigError) -> Self {
        WellspringError::Config(e)
    }
}

impl From<StateError> for WellspringError {
    fn from(e: StateError) -> Self {
        WellspringError::State(e)
    }
}

impl From<RecoveryError> for WellspringError {
    fn from(e: RecoveryError) -> Self {
        WellspringError::Recovery(e)
    }
}

impl From<DoneQueueError> for WellspringError {
    fn from(e: DoneQueueError) -> Self {
        WellspringError::DoneQueue(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_display_nests_inner_errors() {
        let err: WellspringError = ConfigError::PeriodicListLength(3).into();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: Periodic list length 3 is not a power of two in 1..=1024"
        );
        assert_eq!(
            WellspringError::SlotOutOfRange { slot: 9, len: 8 }.to_string(),
            "Slot 9 outside a ring of 8 slots"
        );
    }
}
