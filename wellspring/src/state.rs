//! Controller lifecycle
//!
//! Both interrupt contexts consult [`Lifecycle::should_ignore`] before
//! anything else. Once a controller starts shutting down, was ejected from a
//! removable bus, or is otherwise unavailable, neither context touches a
//! register or a shared structure again.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControllerState {
    Uninitialized = 0,
    Running = 1,
    HostErrorRecovering = 2,
    ShuttingDown = 3,
    Stopped = 4,
}

impl ControllerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => ControllerState::Running,
            2 => ControllerState::HostErrorRecovering,
            3 => ControllerState::ShuttingDown,
            4 => ControllerState::Stopped,
            _ => ControllerState::Uninitialized,
        }
    }

    /// Whether `self -> to` is a legal transition
    pub fn can_become(self, to: ControllerState) -> bool {
        use ControllerState::*;
        matches!(
            (self, to),
            (Uninitialized, Running)
                | (Running, HostErrorRecovering)
                | (HostErrorRecovering, Running)
                | (Uninitialized, ShuttingDown)
                | (Running, ShuttingDown)
                | (HostErrorRecovering, ShuttingDown)
                | (ShuttingDown, Stopped)
        )
    }
}

impl core::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            ControllerState::Uninitialized => "uninitialized",
            ControllerState::Running => "running",
            ControllerState::HostErrorRecovering => "recovering from host error",
            ControllerState::ShuttingDown => "shutting down",
            ControllerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    InvalidTransition {
        from: ControllerState,
        to: ControllerState,
    },
}

impl core::fmt::Display for StateError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StateError::InvalidTransition { from, to } => {
                write!(f, "Cannot go from {} to {}", from, to)
            }
        }
    }
}

/// Lifecycle state plus the platform's presence flags
pub struct Lifecycle {
    state: AtomicU8,
    active: AtomicBool,
    ejected: AtomicBool,
    available: AtomicBool,
    on_removable_bus: bool,
}

impl Lifecycle {
    pub fn new(on_removable_bus: bool) -> Self {
        Self {
            state: AtomicU8::new(ControllerState::Uninitialized as u8),
            active: AtomicBool::new(true),
            ejected: AtomicBool::new(false),
            available: AtomicBool::new(true),
            on_removable_bus,
        }
    }

    pub fn state(&self) -> ControllerState {
        ControllerState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Move to `to` if the current state allows it
    pub fn transition(&self, to: ControllerState) -> Result<ControllerState, StateError> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = ControllerState::from_raw(current);
            if !from.can_become(to) {
                return Err(StateError::InvalidTransition { from, to });
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(from),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn on_removable_bus(&self) -> bool {
        self.on_removable_bus
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn set_ejected(&self, ejected: bool) {
        self.ejected.store(ejected, Ordering::Release);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Whether interrupt processing must not touch the controller at all
    pub fn should_ignore(&self) -> bool {
        match self.state() {
            ControllerState::Uninitialized
            | ControllerState::ShuttingDown
            | ControllerState::Stopped => return true,
            ControllerState::Running | ControllerState::HostErrorRecovering => {}
        }
        if !self.active.load(Ordering::Acquire) {
            return true;
        }
        if self.on_removable_bus && self.ejected.load(Ordering::Acquire) {
            return true;
        }
        !self.available.load(Ordering::Acquire)
    }
}
