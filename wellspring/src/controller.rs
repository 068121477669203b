//! # Controller - Binding the Two Contexts
//!
//! [`Controller::split`] builds everything one host controller needs and
//! hands back three pieces:
//!
//! - the [`InterruptFilter`], owned by the primary interrupt handler
//! - the [`InterruptDispatcher`], owned by the deferred task
//! - a cloneable [`Controller`] handle for lifecycle control, item
//!   submission and diagnostics
//!
//! All three share one `ControllerShared` through an `Arc`. Nothing in it
//! needs a lock except the done-queue pair.

use crate::clock::MonotonicClock;
use crate::config::{WellspringConfig, MAX_ROOT_PORTS};
use crate::counters::{Diagnostics, ErrorCounters, FilterTiming, LatencyCounters};
use crate::dispatcher::{Collaborators, InterruptDispatcher};
use crate::done_queue::DoneQueueChannel;
use crate::endpoint::EndpointTable;
use crate::error::WellspringError;
use crate::filter::InterruptFilter;
use crate::frame::{AnchorCell, FrameAnchor};
use crate::item::ItemTable;
use crate::pending::PendingFlags;
use crate::register_port::{AddressResolver, RegisterPort};
use crate::signal::DispatchSignal;
use crate::state::{ControllerState, Lifecycle};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

/// State shared by both interrupt contexts and the controller handle
pub(crate) struct ControllerShared {
    pub(crate) config: WellspringConfig,
    pub(crate) port: Arc<dyn RegisterPort>,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) pending: PendingFlags,
    pub(crate) signal: DispatchSignal,
    pub(crate) done_queue: DoneQueueChannel,
    pub(crate) items: ItemTable,
    pub(crate) endpoints: EndpointTable,
    /// Written by the primary handler on rollover
    pub(crate) staged_anchor: AnchorCell,
    /// Written by the secondary handler, read by everyone
    pub(crate) anchor: AnchorCell,
    pub(crate) errors: ErrorCounters,
    pub(crate) latency: LatencyCounters,
    pub(crate) timing: FilterTiming,
    /// An isochronous endpoint abort is unlinking items; the sweep stays out
    pub(crate) isochronous_abort: AtomicBool,
    /// Root ports with a resume task in flight
    pub(crate) resuming: heapless::Vec<AtomicBool, MAX_ROOT_PORTS>,
}

/// Handle to one controller instance
#[derive(Clone)]
pub struct Controller {
    shared: Arc<ControllerShared>,
}

impl Controller {
    /// Validate `config` and build the filter, the dispatcher and a handle
    ///
    /// `collaborators.wake` is how the filter gets the dispatcher scheduled;
    /// without it the platform has to call
    /// [`InterruptDispatcher::run_if_signaled`] on its own.
    ///
    /// The controller starts `Uninitialized`; both contexts ignore
    /// interrupts until [`Controller::start`].
    pub fn split(
        config: WellspringConfig,
        port: Arc<dyn RegisterPort>,
        resolver: Arc<dyn AddressResolver>,
        clock: Arc<dyn MonotonicClock>,
        collaborators: Collaborators,
    ) -> Result<(Controller, InterruptFilter, InterruptDispatcher), WellspringError> {
        config.validate()?;

        let signal = match collaborators.wake {
            Some(wake) => DispatchSignal::with_wake_hook(wake),
            None => DispatchSignal::new(),
        };

        let mut resuming = heapless::Vec::new();
        for _ in 0..config.root_ports {
            // validated against the same bound
            let _ = resuming.push(AtomicBool::new(false));
        }

        let shared = Arc::new(ControllerShared {
            config,
            port,
            lifecycle: Lifecycle::new(config.on_removable_bus),
            pending: PendingFlags::new(),
            signal,
            done_queue: DoneQueueChannel::new(),
            items: ItemTable::with_capacity(config.item_capacity),
            endpoints: EndpointTable::with_capacity(config.endpoint_capacity),
            staged_anchor: AnchorCell::new(),
            anchor: AnchorCell::new(),
            errors: ErrorCounters::default(),
            latency: LatencyCounters::default(),
            timing: FilterTiming::default(),
            isochronous_abort: AtomicBool::new(false),
            resuming,
        });

        log::info!(
            "[WELLSPRING] {:?} controller: {} periodic slots, {} items, {} endpoints, {} ports",
            config.family,
            config.periodic_list_len,
            config.item_capacity,
            config.endpoint_capacity,
            config.root_ports
        );

        let filter = InterruptFilter::new(Arc::clone(&shared), resolver, clock);
        let dispatcher = InterruptDispatcher::new(Arc::clone(&shared), collaborators);
        Ok((Controller { shared }, filter, dispatcher))
    }

    pub fn config(&self) -> &WellspringConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ControllerState {
        self.shared.lifecycle.state()
    }

    /// Begin processing interrupts
    pub fn start(&self) -> Result<(), WellspringError> {
        self.shared.lifecycle.transition(ControllerState::Running)?;
        log::info!("[WELLSPRING] controller running");
        Ok(())
    }

    /// Stop processing interrupts; both contexts become no-ops immediately
    pub fn begin_shutdown(&self) -> Result<(), WellspringError> {
        self.shared.lifecycle.transition(ControllerState::ShuttingDown)?;
        log::info!("[WELLSPRING] controller shutting down");
        Ok(())
    }

    pub fn stop(&self) -> Result<(), WellspringError> {
        self.shared.lifecycle.transition(ControllerState::Stopped)?;
        Ok(())
    }

    /// The platform's view of the device (detached, powered off)
    pub fn set_active(&self, active: bool) {
        self.shared.lifecycle.set_active(active);
    }

    /// Card ejected from a removable bus
    pub fn set_ejected(&self, ejected: bool) {
        self.shared.lifecycle.set_ejected(ejected);
    }

    pub fn set_available(&self, available: bool) {
        self.shared.lifecycle.set_available(available);
    }

    /// Keep the periodic sweep away while an endpoint abort unlinks items
    pub fn set_isochronous_abort(&self, in_progress: bool) {
        self.shared.isochronous_abort.store(in_progress, Ordering::Release);
    }

    pub fn items(&self) -> &ItemTable {
        &self.shared.items
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.shared.endpoints
    }

    /// Most recently published frame anchor
    pub fn anchor(&self) -> FrameAnchor {
        self.shared.anchor.load()
    }

    /// Called by a port resume task once its port has resumed
    pub fn port_resume_finished(&self, port: usize) {
        if let Some(flag) = self.shared.resuming.get(port) {
            flag.store(false, Ordering::Release);
        }
    }

    pub fn is_port_resuming(&self, port: usize) -> bool {
        self.shared
            .resuming
            .get(port)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let shared = &self.shared;
        Diagnostics::collect(
            shared.lifecycle.state(),
            shared.pending.peek(),
            shared.done_queue.snapshot(),
            shared.anchor.load(),
            shared.signal.stats(),
            &shared.errors,
            &shared.latency,
            &shared.timing,
        )
    }

    #[cfg(test)]
    pub(crate) fn signal_pending(&self) -> bool {
        self.shared.signal.is_pending()
    }

    #[cfg(test)]
    pub(crate) fn staged_anchor(&self) -> FrameAnchor {
        self.shared.staged_anchor.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::Rig;

    #[test]
    fn test_split_rejects_bad_config() {
        let config = WellspringConfig::periodic_list().with_periodic_list_len(100);
        assert!(matches!(
            Rig::try_new(config),
            Err(WellspringError::Config(crate::config::ConfigError::PeriodicListLength(100)))
        ));
    }

    #[test]
    fn test_lifecycle_through_handle() {
        let rig = Rig::unstarted(WellspringConfig::periodic_list());
        assert_eq!(rig.controller.state(), ControllerState::Uninitialized);
        rig.controller.start().unwrap();
        assert!(rig.controller.start().is_err());
        rig.controller.begin_shutdown().unwrap();
        rig.controller.stop().unwrap();
        assert_eq!(rig.controller.diagnostics().state, ControllerState::Stopped);
    }

    #[test]
    fn test_resume_table_sized_by_config() {
        let rig = Rig::new(WellspringConfig::periodic_list().with_root_ports(2));
        assert!(!rig.controller.is_port_resuming(0));
        assert!(!rig.controller.is_port_resuming(2));
        rig.controller.port_resume_finished(7);
    }
}
