use core::fmt;

/// Errors returned by event-channel operations.
///
/// Each variant maps onto the errno value reported to guests through the monitor-call ABI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvtchnError {
    /// Bad port, vCPU, VIRQ or unsupported state for the operation.
    InvalidArgument,
    /// No free port, or the port is above the domain limit.
    NoSpace,
    /// A port table slab could not be allocated.
    OutOfMemory,
    /// The port is live, or a reset is already in progress.
    Busy,
    /// The VIRQ or PIRQ is already bound.
    AlreadyExists,
    /// Denied by the policy.
    AccessDenied,
    /// Denied because the caller lacks the privilege.
    NotPermitted,
    /// Unknown domain.
    NoSuchDomain,
    /// Unknown vCPU.
    NoSuchVcpu,
    /// The guest still holds channels after a reset.
    TryAgain,
}

impl EvtchnError {
    pub const fn errno(self) -> isize {
        match self {
            EvtchnError::NotPermitted => -1,
            EvtchnError::NoSuchVcpu => -2,
            EvtchnError::NoSuchDomain => -3,
            EvtchnError::TryAgain => -11,
            EvtchnError::OutOfMemory => -12,
            EvtchnError::AccessDenied => -13,
            EvtchnError::Busy => -16,
            EvtchnError::AlreadyExists => -17,
            EvtchnError::InvalidArgument => -22,
            EvtchnError::NoSpace => -28,
        }
    }
}

impl fmt::Display for EvtchnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EvtchnError::InvalidArgument => "EINVAL",
            EvtchnError::NoSpace => "ENOSPC",
            EvtchnError::OutOfMemory => "ENOMEM",
            EvtchnError::Busy => "EBUSY",
            EvtchnError::AlreadyExists => "EEXIST",
            EvtchnError::AccessDenied => "EACCES",
            EvtchnError::NotPermitted => "EPERM",
            EvtchnError::NoSuchDomain => "ESRCH",
            EvtchnError::NoSuchVcpu => "ENOENT",
            EvtchnError::TryAgain => "EAGAIN",
        };
        f.write_str(name)
    }
}

/// Outcome of a preemptible bulk operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum Progress {
    /// The walk completed.
    Done,
    /// The walk was preempted, the caller must invoke the operation again to resume it.
    Restart,
}
