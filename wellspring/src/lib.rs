//! # Wellspring
//!
//! The interrupt core of a USB host controller driver, split across two
//! execution contexts.
//!
//! The primary handler ([`InterruptFilter`]) runs with interrupts masked.
//! It reads the cause register, acknowledges what it found, moves finished
//! transfers onto a done queue and raises a flag per cause. The secondary
//! handler ([`InterruptDispatcher`]) runs later as an ordinary task, takes
//! the flags and does the slow work: completing transfers, resetting,
//! resuming ports, recovering from host errors.
//!
//! ## Philosophy
//! The primary context never waits and never allocates beyond the batch it
//! hands over. Everything it shares with the secondary context is either an
//! atomic, a seqlock, or the single done-queue lock held for two words.
//!
//! ## Families
//! Two controller families are supported. Periodic-list controllers expose
//! a frame-indexed list that the filter sweeps for retired isochronous
//! items. Done-head controllers write the physical address of the newest
//! finished item and the filter follows the chain.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod causes;
pub mod clock;
pub mod config;
pub mod controller;
pub mod counters;
pub mod dispatcher;
pub mod done_queue;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod frame;
pub mod item;
pub mod mmio;
pub mod pending;
pub mod register_port;
pub mod ring;
pub mod signal;
pub mod state;

#[cfg(test)]
mod mock;

pub use causes::InterruptCauses;
pub use clock::{MonotonicClock, TickClock};
pub use config::{ControllerFamily, WellspringConfig};
pub use controller::Controller;
pub use counters::Diagnostics;
pub use dispatcher::{
    Collaborators, CompletionScavenger, DispatchReport, HostRecovery, InterruptDispatcher,
    PortResumeTask, RootHub, ScavengeReason,
};
pub use done_queue::{DoneQueueChannel, DoneQueueConsumer, DoneQueueSnapshot};
pub use endpoint::EndpointHandle;
pub use error::WellspringError;
pub use filter::InterruptFilter;
pub use frame::FrameAnchor;
pub use item::{CompletionCode, ItemDescriptor, ItemHandle};
pub use register_port::{AddressResolver, PhysAddr, RegisterPort};
pub use signal::WakeHook;
pub use state::ControllerState;
