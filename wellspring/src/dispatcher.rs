//! # Interrupt Dispatcher - The Secondary Handler
//!
//! Runs as an ordinary task after the [`InterruptFilter`] raised the
//! dispatch signal. It may block, sleep and take its time: under load it
//! can run tens of milliseconds after the interrupt that caused it.
//!
//! Each pending flag is taken and handled on its own. Completed items come
//! off the done queue in completion order and are handed to the
//! [`CompletionScavenger`]; everything else goes to the collaborator that
//! owns it.
//!
//! [`InterruptFilter`]: crate::filter::InterruptFilter

use crate::causes::InterruptCauses;
use crate::config::ControllerFamily;
use crate::controller::ControllerShared;
use crate::counters::bump;
use crate::done_queue::DoneQueueConsumer;
use crate::error::{RecoveryError, WellspringError};
use crate::item::{CompletionCode, ItemHandle};
use crate::signal::WakeHook;
use crate::state::ControllerState;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

/// Why the scavenger is being asked to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScavengeReason {
    Complete,
    Error,
    DoneHead,
}

/// Turns retired items into completion callbacks
pub trait CompletionScavenger: Send + Sync {
    /// Take ownership of one retired item. Items arrive oldest first.
    fn retire(&self, item: ItemHandle, code: CompletionCode);

    /// Walk the transport's own completion queues
    fn scavenge(&self, reason: ScavengeReason);
}

/// Finishes the resume of a root port that signalled remote wakeup
///
/// `resume` must only start the work; it reports back through
/// [`Controller::port_resume_finished`](crate::Controller::port_resume_finished).
pub trait PortResumeTask: Send + Sync {
    fn resume(&self, port: usize);
}

/// The root hub driver
pub trait RootHub: Send + Sync {
    /// Make sure ports are usable after a port change
    fn ensure_usability(&self);
    fn status_changed(&self);
    fn resume_detected(&self);
}

/// Tears down and rebuilds the bus after a host system error
pub trait HostRecovery: Send + Sync {
    fn teardown_root_device(&self);
    fn reinitialize(&self) -> Result<(), RecoveryError>;
    fn rebuild_root_device(&self) -> Result<(), RecoveryError>;
}

/// Everything the dispatcher delegates to
pub struct Collaborators {
    pub scavenger: Arc<dyn CompletionScavenger>,
    pub resume: Arc<dyn PortResumeTask>,
    pub root_hub: Arc<dyn RootHub>,
    pub recovery: Option<Arc<dyn HostRecovery>>,
    /// Schedules [`InterruptDispatcher::run`] on the platform. Called from
    /// primary context at most once per pending run, so it must not block.
    pub wake: Option<WakeHook>,
}

/// The order in which pending flags are handled
const DISPATCH_ORDER: [InterruptCauses; 11] = [
    InterruptCauses::HOST_ERROR,
    InterruptCauses::ERROR,
    InterruptCauses::COMPLETE,
    InterruptCauses::PORT_CHANGE,
    InterruptCauses::ASYNC_ADVANCE,
    InterruptCauses::FRAME_ROLLOVER,
    InterruptCauses::FRAME_NUMBER_OVERFLOW,
    InterruptCauses::WRITE_DONE_HEAD,
    InterruptCauses::RESUME_DETECTED,
    InterruptCauses::UNRECOVERABLE_ERROR,
    InterruptCauses::ROOT_HUB_STATUS_CHANGE,
];

/// What one dispatcher run did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Flags taken and handled
    pub handled: InterruptCauses,
    /// Items taken off the done queue
    pub drained: usize,
    pub resumes_started: u32,
    /// Host-error count, when this run logged it
    pub host_error_logged: Option<u32>,
    /// Transient anomalies whose counts this run logged
    pub anomalies_logged: InterruptCauses,
    pub recovered: bool,
}

impl DispatchReport {
    fn new() -> Self {
        Self {
            handled: InterruptCauses::empty(),
            drained: 0,
            resumes_started: 0,
            host_error_logged: None,
            anomalies_logged: InterruptCauses::empty(),
            recovered: false,
        }
    }
}

/// The secondary interrupt handler of one controller
pub struct InterruptDispatcher {
    shared: Arc<ControllerShared>,
    collaborators: Collaborators,
    consumer: DoneQueueConsumer,
}

impl InterruptDispatcher {
    pub(crate) fn new(shared: Arc<ControllerShared>, collaborators: Collaborators) -> Self {
        Self {
            shared,
            collaborators,
            consumer: DoneQueueConsumer::new(),
        }
    }

    /// Items taken off the done queue so far
    pub fn consumer_count(&self) -> u64 {
        self.consumer.consumer_count()
    }

    /// Run only if the filter asked for it
    pub fn run_if_signaled(&mut self) -> Option<DispatchReport> {
        if self.shared.signal.is_pending() {
            Some(self.run())
        } else {
            None
        }
    }

    /// Handle everything the primary handler left pending
    pub fn run(&mut self) -> DispatchReport {
        let mut report = DispatchReport::new();
        if self.shared.lifecycle.should_ignore() {
            return report;
        }
        // a raise from here on schedules another run
        self.shared.signal.take();

        for cause in DISPATCH_ORDER {
            if self.shared.pending.take(cause).is_empty() {
                continue;
            }
            report.handled |= cause;
            match cause {
                InterruptCauses::HOST_ERROR => self.host_error(&mut report),
                InterruptCauses::ERROR => {
                    log::trace!("[DISPATCH] completion (error) interrupt");
                    report.drained += self.retire_done_queue();
                    self.collaborators.scavenger.scavenge(ScavengeReason::Error);
                }
                InterruptCauses::COMPLETE => {
                    log::trace!("[DISPATCH] completion interrupt");
                    report.drained += self.retire_done_queue();
                    self.collaborators.scavenger.scavenge(ScavengeReason::Complete);
                }
                InterruptCauses::PORT_CHANGE => self.port_change(&mut report),
                InterruptCauses::ASYNC_ADVANCE => {
                    bump(&self.shared.errors.async_advance);
                    log::debug!("[DISPATCH] async advance interrupt");
                }
                InterruptCauses::FRAME_ROLLOVER | InterruptCauses::FRAME_NUMBER_OVERFLOW => {
                    let staged = self.shared.staged_anchor.load();
                    self.shared.anchor.store(staged);
                }
                InterruptCauses::WRITE_DONE_HEAD => {
                    report.drained += self.retire_done_queue();
                    self.collaborators.scavenger.scavenge(ScavengeReason::DoneHead);
                }
                InterruptCauses::RESUME_DETECTED => {
                    bump(&self.shared.errors.remote_wakeups);
                    log::info!("[DISPATCH] resume detected");
                    self.collaborators.root_hub.resume_detected();
                }
                InterruptCauses::UNRECOVERABLE_ERROR => self.unrecoverable_error(),
                InterruptCauses::ROOT_HUB_STATUS_CHANGE => {
                    bump(&self.shared.errors.remote_wakeups);
                    log::info!("[DISPATCH] root hub status change");
                    self.collaborators.root_hub.status_changed();
                    // masked by the filter until now
                    self.shared.port.enable_causes(InterruptCauses::ROOT_HUB_STATUS_CHANGE);
                    self.shared.port.sync();
                }
                _ => {}
            }
        }
        self.report_anomalies(&mut report);
        report
    }

    /// Let start-of-frame fire once more
    pub fn rearm_start_of_frame(&self) {
        let port = &*self.shared.port;
        port.clear_causes(InterruptCauses::START_OF_FRAME);
        port.sync();
        port.enable_causes(InterruptCauses::START_OF_FRAME);
        port.sync();
    }

    /// Drain the done queue and hand every item to the scavenger
    fn retire_done_queue(&mut self) -> usize {
        let shared = &*self.shared;
        let handles = match self.consumer.drain(&shared.done_queue, &shared.items) {
            Ok(handles) => handles,
            Err(e) => {
                log::error!("[DISPATCH] {}", WellspringError::from(e));
                return 0;
            }
        };

        // done-head frame records are only decoded early for low-latency items
        let decode = shared.config.family == ControllerFamily::DoneHead;
        for &handle in &handles {
            let Some(item) = shared.items.get(handle) else {
                continue;
            };
            let endpoint = item.endpoint().and_then(|e| shared.endpoints.get(e));
            if let Some(endpoint) = endpoint {
                endpoint.moved_to_reversed_list();
            }
            if decode && item.kind().is_isochronous() && !item.is_low_latency() {
                item.decode_frames(None);
            }
            self.collaborators.scavenger.retire(handle, item.condition_code());
            if let Some(endpoint) = endpoint {
                endpoint.retired();
            }
        }
        handles.len()
    }

    fn port_change(&self, report: &mut DispatchReport) {
        let shared = &*self.shared;
        log::debug!("[DISPATCH] port change, ensuring usability");
        self.collaborators.root_hub.ensure_usability();

        let ports = shared.port.port_count().min(shared.resuming.len());
        for (index, resuming) in shared.resuming.iter().take(ports).enumerate() {
            if resuming.load(Ordering::Acquire) || !shared.port.port_resume_detected(index) {
                continue;
            }
            log::info!("[DISPATCH] port {} resuming from remote wakeup", index + 1);
            resuming.store(true, Ordering::Release);
            self.collaborators.resume.resume(index);
            report.resumes_started += 1;
        }
    }

    /// Log counted-only causes once their counts reach the next power of two
    fn report_anomalies(&self, report: &mut DispatchReport) {
        for (cause, counter) in self.shared.errors.anomalies() {
            if let Some(count) = counter.due() {
                log::warn!("[DISPATCH] {} occurred ({} so far)", cause.name(), count);
                report.anomalies_logged |= cause;
            }
        }
    }

    fn host_error(&self, report: &mut DispatchReport) {
        let shared = &*self.shared;
        // counted by the filter; several activations may share one flag
        if let Some(count) = shared.errors.host_error.due() {
            log::error!("[DISPATCH] host system error occurred ({} so far)", count);
            report.host_error_logged = Some(count);
        }

        if !shared.config.recover_on_host_error || shared.lifecycle.on_removable_bus() {
            // removable cards raise spurious errors while being ejected
            return;
        }
        let Some(recovery) = self.collaborators.recovery.clone() else {
            return;
        };
        match self.recover(&*recovery) {
            Ok(()) => {
                log::info!("[RECOVERY] bus rebuilt after host system error");
                report.recovered = true;
            }
            Err(e) => log::error!("[RECOVERY] {}", e),
        }
    }

    /// Rebuild the bus. Slow; no lock is held.
    fn recover(&self, recovery: &dyn HostRecovery) -> Result<(), WellspringError> {
        let lifecycle = &self.shared.lifecycle;
        lifecycle.transition(ControllerState::HostErrorRecovering)?;
        log::warn!("[RECOVERY] tearing down root device");

        recovery.teardown_root_device();
        // the filter ignores the controller while it is rebuilt
        lifecycle.set_available(false);
        let reinitialized = recovery.reinitialize();
        if reinitialized.is_ok() {
            lifecycle.set_available(true);
        }
        lifecycle.transition(ControllerState::Running)?;

        reinitialized?;
        recovery.rebuild_root_device()?;
        Ok(())
    }

    fn unrecoverable_error(&self) {
        log::warn!("[DISPATCH] unrecoverable error, resetting controller");
        let port = &*self.shared.port;
        port.reset_controller();
        port.set_operational();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WellspringConfig;
    use crate::frame::FrameAnchor;
    use crate::item::ItemDescriptor;
    use crate::mock::{PortWrite, Rig};
    use crate::register_port::PhysAddr;

    #[test]
    fn test_ignored_controller_leaves_flags_alone() {
        let mut rig = Rig::new(WellspringConfig::periodic_list());
        rig.port.raise(InterruptCauses::COMPLETE);
        rig.filter.run();
        rig.controller.set_active(false);

        let report = rig.dispatcher.run();
        assert!(report.handled.is_empty());
        assert_eq!(rig.shared_pending(), InterruptCauses::COMPLETE);
        assert!(rig.scavenger.scavenges().is_empty());
    }

    #[test]
    fn test_run_if_signaled_needs_a_signal() {
        let mut rig = Rig::new(WellspringConfig::periodic_list());
        assert!(rig.dispatcher.run_if_signaled().is_none());

        rig.port.raise(InterruptCauses::ERROR);
        rig.filter.run();
        let report = rig.dispatcher.run_if_signaled().unwrap();
        assert_eq!(report.handled, InterruptCauses::ERROR);
        assert_eq!(rig.scavenger.scavenges(), [ScavengeReason::Error]);
        assert!(rig.dispatcher.run_if_signaled().is_none());
    }

    #[test]
    fn test_rollover_publishes_staged_anchor() {
        let mut rig = Rig::new(WellspringConfig::periodic_list());
        rig.clock.advance(42);
        rig.port.set_frame_index(0x0008);
        rig.port.raise(InterruptCauses::FRAME_ROLLOVER);
        rig.filter.run();
        rig.dispatcher.run();
        assert_eq!(rig.controller.anchor(), FrameAnchor { time: 42, frame: 2049 });
    }

    #[test]
    fn test_port_change_spawns_one_resume_per_port() {
        let mut rig = Rig::new(WellspringConfig::periodic_list().with_root_ports(4));
        rig.port.set_port_count(4);
        rig.port.set_port_resume(1, true);
        rig.port.set_port_resume(3, true);

        rig.port.raise(InterruptCauses::PORT_CHANGE);
        rig.filter.run();
        let report = rig.dispatcher.run();
        assert_eq!(report.resumes_started, 2);
        assert_eq!(rig.resume.ports(), [1, 3]);
        assert_eq!(rig.root_hub.usability_checks(), 1);

        // still resuming: no second task for the same port
        rig.port.raise(InterruptCauses::PORT_CHANGE);
        rig.filter.run();
        assert_eq!(rig.dispatcher.run().resumes_started, 0);

        rig.controller.port_resume_finished(1);
        rig.port.raise(InterruptCauses::PORT_CHANGE);
        rig.filter.run();
        rig.dispatcher.run();
        assert_eq!(rig.resume.ports(), [1, 3, 1]);
    }

    #[test]
    fn test_root_hub_change_reenables_cause() {
        let mut rig = Rig::new(WellspringConfig::done_head());
        rig.port.raise(InterruptCauses::ROOT_HUB_STATUS_CHANGE);
        rig.filter.run();
        assert!(!rig.port.enabled().contains(InterruptCauses::ROOT_HUB_STATUS_CHANGE));

        rig.dispatcher.run();
        assert!(rig.port.enabled().contains(InterruptCauses::ROOT_HUB_STATUS_CHANGE));
        assert_eq!(rig.root_hub.status_changes(), 1);
        assert_eq!(rig.controller.diagnostics().remote_wakeups, 1);
    }

    #[test]
    fn test_unrecoverable_error_resets_then_runs() {
        let mut rig = Rig::new(WellspringConfig::done_head());
        rig.port.raise(InterruptCauses::UNRECOVERABLE_ERROR);
        rig.filter.run();
        rig.port.take_writes();
        rig.dispatcher.run();

        assert_eq!(rig.port.writes(), [PortWrite::Reset, PortWrite::Operational]);
        assert_eq!(rig.controller.diagnostics().unrecoverable_errors, 1);
    }

    #[test]
    fn test_host_error_recovery_round_trip() {
        let mut rig = Rig::with_recovery(WellspringConfig::periodic_list().with_host_error_recovery(true), false);
        rig.port.raise(InterruptCauses::HOST_ERROR);
        rig.filter.run();
        let report = rig.dispatcher.run();

        assert!(report.recovered);
        assert_eq!(rig.recovery().calls(), ["teardown", "reinitialize", "rebuild"]);
        assert_eq!(rig.controller.state(), ControllerState::Running);
        assert!(!rig.controller.diagnostics().filter_active);
    }

    #[test]
    fn test_failed_reinitialize_leaves_controller_unavailable() {
        let mut rig = Rig::with_recovery(WellspringConfig::periodic_list().with_host_error_recovery(true), true);
        rig.port.raise(InterruptCauses::HOST_ERROR);
        rig.filter.run();
        let report = rig.dispatcher.run();

        assert!(!report.recovered);
        assert_eq!(rig.recovery().calls(), ["teardown", "reinitialize"]);
        // both contexts now ignore the controller
        rig.port.raise(InterruptCauses::COMPLETE);
        rig.port.take_writes();
        rig.filter.run();
        assert!(rig.port.writes().is_empty());
    }

    #[test]
    fn test_no_recovery_on_removable_bus() {
        let config = WellspringConfig::periodic_list()
            .with_host_error_recovery(true)
            .on_removable_bus(true);
        let mut rig = Rig::with_recovery(config, false);
        rig.port.raise(InterruptCauses::HOST_ERROR);
        rig.filter.run();
        let report = rig.dispatcher.run();
        assert_eq!(report.host_error_logged, Some(1));
        assert!(rig.recovery().calls().is_empty());
    }

    #[test]
    fn test_anomalies_logged_on_next_run() {
        let mut rig = Rig::new(WellspringConfig::periodic_list());
        for _ in 0..3 {
            rig.port.raise(InterruptCauses::SCHEDULING_OVERRUN);
            rig.filter.run();
        }
        // counted only; nothing asked for a run
        assert!(!rig.controller_signal_pending());

        rig.port.raise(InterruptCauses::ERROR);
        rig.filter.run();
        let report = rig.dispatcher.run();
        assert_eq!(report.anomalies_logged, InterruptCauses::SCHEDULING_OVERRUN);
        assert_eq!(rig.controller.diagnostics().schedule_overruns, 3);

        rig.port.raise(InterruptCauses::OWNERSHIP_CHANGE);
        rig.filter.run();
        let report = rig.dispatcher.run();
        assert_eq!(report.anomalies_logged, InterruptCauses::OWNERSHIP_CHANGE);

        assert!(rig.dispatcher.run().anomalies_logged.is_empty());
    }

    #[test]
    fn test_rearm_start_of_frame() {
        let mut rig = Rig::new(WellspringConfig::done_head());
        rig.port.raise(InterruptCauses::START_OF_FRAME);
        rig.filter.run();
        assert!(!rig.port.enabled().contains(InterruptCauses::START_OF_FRAME));
        rig.dispatcher.rearm_start_of_frame();
        assert!(rig.port.enabled().contains(InterruptCauses::START_OF_FRAME));
    }

    #[test]
    fn test_done_head_items_reach_scavenger_in_completion_order() {
        let mut rig = Rig::new(WellspringConfig::done_head());
        let items = rig.controller.items();
        let first = items
            .allocate(&ItemDescriptor::general().phys(PhysAddr(0x1000)))
            .unwrap();
        let second = items
            .allocate(&ItemDescriptor::general().phys(PhysAddr(0x2000)))
            .unwrap();
        items.get(first).unwrap().set_hw_control(4 << 28);
        // hardware reports newest first
        items.get(second).unwrap().set_hw_next(PhysAddr(0x1000));
        rig.resolver.map(PhysAddr(0x1000), first);
        rig.resolver.map(PhysAddr(0x2000), second);
        rig.port.set_done_head(PhysAddr(0x2001));

        rig.port.raise(InterruptCauses::WRITE_DONE_HEAD);
        rig.filter.run();
        let report = rig.dispatcher.run();

        assert_eq!(report.drained, 2);
        assert_eq!(
            rig.scavenger.retired(),
            [(first, CompletionCode::Stall), (second, CompletionCode::NoError)]
        );
        assert_eq!(rig.scavenger.scavenges(), [ScavengeReason::DoneHead]);
        assert_eq!(rig.dispatcher.consumer_count(), 2);
    }
}
