//! # Causes - The Reasons the Controller Calls Out
//!
//! Every controller family reports its interrupt causes in its own bit
//! layout. The register port translates them into this one host-order set,
//! so the filter and the dispatcher speak a single language regardless of
//! the silicon underneath.

bitflags::bitflags! {
    /// Interrupt causes, normalized to host order by the register port
    pub struct InterruptCauses: u32 {
        const COMPLETE               = 1 << 0;
        const ERROR                  = 1 << 1;
        const PORT_CHANGE            = 1 << 2;
        const FRAME_ROLLOVER         = 1 << 3;
        const HOST_ERROR             = 1 << 4;
        const ASYNC_ADVANCE          = 1 << 5;
        const SCHEDULING_OVERRUN     = 1 << 6;
        const WRITE_DONE_HEAD        = 1 << 7;
        const START_OF_FRAME         = 1 << 8;
        const RESUME_DETECTED        = 1 << 9;
        const UNRECOVERABLE_ERROR    = 1 << 10;
        const FRAME_NUMBER_OVERFLOW  = 1 << 11;
        const ROOT_HUB_STATUS_CHANGE = 1 << 12;
        const OWNERSHIP_CHANGE       = 1 << 30;
        /// Master interrupt enable. Only meaningful in the enabled mask.
        const MASTER_ENABLE          = 1 << 31;
    }
}

impl InterruptCauses {
    /// The order in which the primary handler examines active causes.
    ///
    /// Frame bookkeeping comes first so that anything stamped later in the
    /// same pass sees the extended frame counter. Completion work comes last.
    pub const PROCESSING_ORDER: [InterruptCauses; 14] = [
        InterruptCauses::FRAME_ROLLOVER,
        InterruptCauses::FRAME_NUMBER_OVERFLOW,
        InterruptCauses::SCHEDULING_OVERRUN,
        InterruptCauses::START_OF_FRAME,
        InterruptCauses::OWNERSHIP_CHANGE,
        InterruptCauses::ROOT_HUB_STATUS_CHANGE,
        InterruptCauses::UNRECOVERABLE_ERROR,
        InterruptCauses::RESUME_DETECTED,
        InterruptCauses::ASYNC_ADVANCE,
        InterruptCauses::HOST_ERROR,
        InterruptCauses::PORT_CHANGE,
        InterruptCauses::ERROR,
        InterruptCauses::COMPLETE,
        InterruptCauses::WRITE_DONE_HEAD,
    ];

    /// Every real cause, without the master enable bit
    pub fn causes() -> Self {
        Self::all() - Self::MASTER_ENABLE
    }

    /// Short name of a single cause, for log lines
    pub fn name(self) -> &'static str {
        match self {
            Self::COMPLETE => "complete",
            Self::ERROR => "error",
            Self::PORT_CHANGE => "port-change",
            Self::FRAME_ROLLOVER => "frame-rollover",
            Self::HOST_ERROR => "host-error",
            Self::ASYNC_ADVANCE => "async-advance",
            Self::SCHEDULING_OVERRUN => "scheduling-overrun",
            Self::WRITE_DONE_HEAD => "write-done-head",
            Self::START_OF_FRAME => "start-of-frame",
            Self::RESUME_DETECTED => "resume-detected",
            Self::UNRECOVERABLE_ERROR => "unrecoverable-error",
            Self::FRAME_NUMBER_OVERFLOW => "frame-number-overflow",
            Self::ROOT_HUB_STATUS_CHANGE => "root-hub-status-change",
            Self::OWNERSHIP_CHANGE => "ownership-change",
            Self::MASTER_ENABLE => "master-enable",
            _ => "mixed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_order_covers_every_cause_once() {
        let mut seen = InterruptCauses::empty();
        for cause in InterruptCauses::PROCESSING_ORDER {
            assert_eq!(cause.bits().count_ones(), 1);
            assert!(!seen.contains(cause), "{} listed twice", cause.name());
            seen |= cause;
        }
        assert_eq!(seen, InterruptCauses::causes());
    }

    #[test]
    fn test_master_enable_is_not_a_cause() {
        assert!(!InterruptCauses::causes().contains(InterruptCauses::MASTER_ENABLE));
        assert_eq!(InterruptCauses::MASTER_ENABLE.name(), "master-enable");
        assert_eq!((InterruptCauses::COMPLETE | InterruptCauses::ERROR).name(), "mixed");
    }
}
