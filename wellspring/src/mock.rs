//! Mock controller for testing
//!
//! A register port backed by plain memory that records every write, plus
//! recording collaborators and a [`Rig`] that wires them to a controller.

use crate::causes::InterruptCauses;
use crate::clock::TickClock;
use crate::config::WellspringConfig;
use crate::controller::Controller;
use crate::dispatcher::{
    Collaborators, CompletionScavenger, HostRecovery, InterruptDispatcher, PortResumeTask,
    RootHub, ScavengeReason,
};
use crate::error::{RecoveryError, WellspringError};
use crate::filter::InterruptFilter;
use crate::frame::FrameAnchor;
use crate::item::{CompletionCode, ItemHandle};
use crate::register_port::{AddressResolver, PhysAddr, RegisterPort};
use crate::signal::WakeHook;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

/// A write the mock port received, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortWrite {
    Clear(InterruptCauses),
    Disable(InterruptCauses),
    Enable(InterruptCauses),
    Sync,
    ClearDoneHead,
    Reset,
    Operational,
}

struct PortState {
    status: InterruptCauses,
    enabled: InterruptCauses,
    frame_index: u32,
    done_head: PhysAddr,
    periodic_enabled: bool,
    port_count: usize,
    port_resume: Vec<bool>,
    /// Causes whose clear is ignored, and how many more clears to ignore
    sticky: InterruptCauses,
    sticky_clears_left: u32,
    writes: Vec<PortWrite>,
}

/// In-memory register port
pub struct MockRegisterPort {
    state: Mutex<PortState>,
}

impl MockRegisterPort {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PortState {
                status: InterruptCauses::empty(),
                enabled: InterruptCauses::empty(),
                frame_index: 0,
                done_head: PhysAddr::NULL,
                periodic_enabled: true,
                port_count: 0,
                port_resume: vec![false; crate::config::MAX_ROOT_PORTS],
                sticky: InterruptCauses::empty(),
                sticky_clears_left: 0,
                writes: Vec::new(),
            }),
        }
    }

    /// Assert causes in hardware and enable them (master enable included)
    pub fn raise(&self, causes: InterruptCauses) {
        let mut state = self.state.lock();
        state.status |= causes;
        state.enabled |= causes | InterruptCauses::MASTER_ENABLE;
    }

    pub fn set_status(&self, causes: InterruptCauses) {
        self.state.lock().status = causes;
    }

    pub fn status(&self) -> InterruptCauses {
        self.state.lock().status
    }

    pub fn set_enabled(&self, causes: InterruptCauses) {
        self.state.lock().enabled = causes;
    }

    pub fn enabled(&self) -> InterruptCauses {
        self.state.lock().enabled
    }

    pub fn set_frame_index(&self, index: u32) {
        self.state.lock().frame_index = index;
    }

    pub fn set_done_head(&self, head: PhysAddr) {
        self.state.lock().done_head = head;
    }

    pub fn done_head(&self) -> PhysAddr {
        self.state.lock().done_head
    }

    pub fn set_periodic_enabled(&self, enabled: bool) {
        self.state.lock().periodic_enabled = enabled;
    }

    pub fn set_port_count(&self, count: usize) {
        self.state.lock().port_count = count;
    }

    pub fn set_port_resume(&self, port: usize, resuming: bool) {
        if let Some(flag) = self.state.lock().port_resume.get_mut(port) {
            *flag = resuming;
        }
    }

    /// Ignore the next `clears` clears of `causes`
    pub fn make_sticky(&self, causes: InterruptCauses, clears: u32) {
        let mut state = self.state.lock();
        state.sticky = causes;
        state.sticky_clears_left = clears;
    }

    pub fn writes(&self) -> Vec<PortWrite> {
        self.state.lock().writes.clone()
    }

    pub fn take_writes(&self) -> Vec<PortWrite> {
        core::mem::take(&mut self.state.lock().writes)
    }

    /// How many clears touched `cause`
    pub fn clears_of(&self, cause: InterruptCauses) -> usize {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|w| matches!(w, PortWrite::Clear(c) if c.intersects(cause)))
            .count()
    }
}

impl RegisterPort for MockRegisterPort {
    fn read_status(&self) -> InterruptCauses {
        self.state.lock().status
    }

    fn read_enabled_mask(&self) -> InterruptCauses {
        self.state.lock().enabled
    }

    fn clear_causes(&self, causes: InterruptCauses) {
        let mut state = self.state.lock();
        state.writes.push(PortWrite::Clear(causes));
        let mut cleared = causes;
        if state.sticky_clears_left > 0 && causes.intersects(state.sticky) {
            state.sticky_clears_left -= 1;
            cleared -= state.sticky;
        }
        state.status -= cleared;
    }

    fn disable_causes(&self, causes: InterruptCauses) {
        let mut state = self.state.lock();
        state.writes.push(PortWrite::Disable(causes));
        state.enabled -= causes;
    }

    fn enable_causes(&self, causes: InterruptCauses) {
        let mut state = self.state.lock();
        state.writes.push(PortWrite::Enable(causes));
        state.enabled |= causes;
    }

    fn sync(&self) {
        self.state.lock().writes.push(PortWrite::Sync);
    }

    fn read_frame_index(&self) -> u32 {
        self.state.lock().frame_index
    }

    fn read_done_head_physical(&self) -> PhysAddr {
        self.state.lock().done_head
    }

    fn clear_done_head(&self) {
        let mut state = self.state.lock();
        state.writes.push(PortWrite::ClearDoneHead);
        state.done_head = PhysAddr::NULL;
    }

    fn periodic_schedule_enabled(&self) -> bool {
        self.state.lock().periodic_enabled
    }

    fn port_count(&self) -> usize {
        self.state.lock().port_count
    }

    fn port_resume_detected(&self, port: usize) -> bool {
        self.state.lock().port_resume.get(port).copied().unwrap_or(false)
    }

    fn reset_controller(&self) {
        self.state.lock().writes.push(PortWrite::Reset);
    }

    fn set_operational(&self) {
        self.state.lock().writes.push(PortWrite::Operational);
    }
}

/// Physical to logical translation table
#[derive(Default)]
pub struct MockResolver {
    table: Mutex<Vec<(PhysAddr, ItemHandle)>>,
}

impl MockResolver {
    pub fn map(&self, phys: PhysAddr, handle: ItemHandle) {
        self.table.lock().push((phys, handle));
    }
}

impl AddressResolver for MockResolver {
    fn to_logical(&self, phys: PhysAddr) -> Option<ItemHandle> {
        self.table
            .lock()
            .iter()
            .find(|(p, _)| *p == phys)
            .map(|(_, handle)| *handle)
    }
}

#[derive(Default)]
pub struct RecordingScavenger {
    retired: Mutex<Vec<(ItemHandle, CompletionCode)>>,
    scavenges: Mutex<Vec<ScavengeReason>>,
}

impl RecordingScavenger {
    pub fn retired(&self) -> Vec<(ItemHandle, CompletionCode)> {
        self.retired.lock().clone()
    }

    pub fn scavenges(&self) -> Vec<ScavengeReason> {
        self.scavenges.lock().clone()
    }
}

impl CompletionScavenger for RecordingScavenger {
    fn retire(&self, item: ItemHandle, code: CompletionCode) {
        self.retired.lock().push((item, code));
    }

    fn scavenge(&self, reason: ScavengeReason) {
        self.scavenges.lock().push(reason);
    }
}

#[derive(Default)]
pub struct RecordingResume {
    ports: Mutex<Vec<usize>>,
}

impl RecordingResume {
    pub fn ports(&self) -> Vec<usize> {
        self.ports.lock().clone()
    }
}

impl PortResumeTask for RecordingResume {
    fn resume(&self, port: usize) {
        self.ports.lock().push(port);
    }
}

#[derive(Default)]
pub struct RecordingRootHub {
    usability: Mutex<u32>,
    status_changes: Mutex<u32>,
    resumes: Mutex<u32>,
}

impl RecordingRootHub {
    pub fn usability_checks(&self) -> u32 {
        *self.usability.lock()
    }

    pub fn status_changes(&self) -> u32 {
        *self.status_changes.lock()
    }

    pub fn resumes(&self) -> u32 {
        *self.resumes.lock()
    }
}

impl RootHub for RecordingRootHub {
    fn ensure_usability(&self) {
        *self.usability.lock() += 1;
    }

    fn status_changed(&self) {
        *self.status_changes.lock() += 1;
    }

    fn resume_detected(&self) {
        *self.resumes.lock() += 1;
    }
}

pub struct MockRecovery {
    fail_reinitialize: bool,
    calls: Mutex<Vec<&'static str>>,
}

impl MockRecovery {
    pub fn new(fail_reinitialize: bool) -> Self {
        Self {
            fail_reinitialize,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }
}

impl HostRecovery for MockRecovery {
    fn teardown_root_device(&self) {
        self.calls.lock().push("teardown");
    }

    fn reinitialize(&self) -> Result<(), RecoveryError> {
        self.calls.lock().push("reinitialize");
        if self.fail_reinitialize {
            Err(RecoveryError::ReinitializeFailed)
        } else {
            Ok(())
        }
    }

    fn rebuild_root_device(&self) -> Result<(), RecoveryError> {
        self.calls.lock().push("rebuild");
        Ok(())
    }
}

/// A controller wired to mocks
pub struct Rig {
    pub controller: Controller,
    pub filter: InterruptFilter,
    pub dispatcher: InterruptDispatcher,
    pub port: Arc<MockRegisterPort>,
    pub resolver: Arc<MockResolver>,
    pub clock: Arc<TickClock>,
    pub scavenger: Arc<RecordingScavenger>,
    pub resume: Arc<RecordingResume>,
    pub root_hub: Arc<RecordingRootHub>,
    recovery: Option<Arc<MockRecovery>>,
}

impl Rig {
    fn build(
        config: WellspringConfig,
        recovery: Option<Arc<MockRecovery>>,
        wake: Option<WakeHook>,
    ) -> Result<Self, WellspringError> {
        let port = Arc::new(MockRegisterPort::new());
        let resolver = Arc::new(MockResolver::default());
        let clock = Arc::new(TickClock::new());
        let scavenger = Arc::new(RecordingScavenger::default());
        let resume = Arc::new(RecordingResume::default());
        let root_hub = Arc::new(RecordingRootHub::default());

        let collaborators = Collaborators {
            scavenger: scavenger.clone(),
            resume: resume.clone(),
            root_hub: root_hub.clone(),
            recovery: recovery.clone().map(|r| r as Arc<dyn HostRecovery>),
            wake,
        };
        let (controller, filter, dispatcher) = Controller::split(
            config,
            port.clone(),
            resolver.clone(),
            clock.clone(),
            collaborators,
        )?;

        Ok(Self {
            controller,
            filter,
            dispatcher,
            port,
            resolver,
            clock,
            scavenger,
            resume,
            root_hub,
            recovery,
        })
    }

    pub fn try_new(config: WellspringConfig) -> Result<Self, WellspringError> {
        let rig = Self::build(config, None, None)?;
        rig.controller.start()?;
        Ok(rig)
    }

    /// A running controller
    pub fn new(config: WellspringConfig) -> Self {
        Self::try_new(config).unwrap()
    }

    /// A controller still `Uninitialized`
    pub fn unstarted(config: WellspringConfig) -> Self {
        Self::build(config, None, None).unwrap()
    }

    /// A running controller with a host recovery collaborator
    pub fn with_recovery(config: WellspringConfig, fail_reinitialize: bool) -> Self {
        let rig = Self::build(config, Some(Arc::new(MockRecovery::new(fail_reinitialize))), None).unwrap();
        rig.controller.start().unwrap();
        rig
    }

    /// A running controller whose signal calls `wake`
    pub fn with_wake_hook(config: WellspringConfig, wake: WakeHook) -> Self {
        let rig = Self::build(config, None, Some(wake)).unwrap();
        rig.controller.start().unwrap();
        rig
    }

    pub fn recovery(&self) -> &MockRecovery {
        self.recovery.as_deref().unwrap()
    }

    pub fn shared_pending(&self) -> InterruptCauses {
        self.controller.diagnostics().pending
    }

    pub fn controller_signal_pending(&self) -> bool {
        self.controller.signal_pending()
    }

    pub fn staged_anchor(&self) -> FrameAnchor {
        self.controller.staged_anchor()
    }

    /// One interrupt followed by one secondary run, as the platform would
    pub fn interrupt(&mut self, causes: InterruptCauses) {
        self.port.raise(causes);
        self.filter.run();
        self.dispatcher.run_if_signaled();
    }
}
