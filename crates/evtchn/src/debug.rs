//! Debug utilities

use core::fmt;

use crate::channel::ChannelState;
use crate::domain::{Domain, EventState};
use crate::ids::{DomainId, Port};
use crate::platform::Platform;
use crate::{EvtchnEngine, EvtchnError};

/// Run a check when enabled at compile time.
macro_rules! debug_check {
    // For now we always run the checks, but in the future we will enable them with a feature
    ($check:expr) => {
        $check
    };
}

pub(crate) use debug_check;

/// Check that the counters of a domain match the content of its port table.
///
/// Must be called with the event lock held.
pub(crate) fn validate_counters(domain: &Domain, state: &EventState) {
    let mut active = 0;
    let mut internal = 0;
    for port in 1..domain.valid_ports() {
        let chn = domain.slot(Port::new(port));
        match *chn.read() {
            ChannelState::Free => continue,
            ChannelState::Reserved => panic!("{} port {} is reserved", domain.id(), port),
            _ => active += 1,
        }
        if chn.is_internal() {
            internal += 1;
        }
    }

    assert_eq!(
        active,
        state.active_ports,
        "Active port counter of {} is out of sync",
        domain.id()
    );
    assert_eq!(
        internal,
        state.internal_ports,
        "Internal port counter of {} is out of sync",
        domain.id()
    );
}

// ————————————————————————————————— Dumps —————————————————————————————————— //

impl<P: Platform> EvtchnEngine<P> {
    /// Log every live channel of a domain.
    pub fn dump(&self, domain: DomainId) -> Result<(), EvtchnError> {
        let d = self.domain(domain)?;
        log::info!("Event channels of {}: {}", d.id(), d.dump());
        Ok(())
    }
}

impl Domain {
    pub fn dump(&self) -> PortsDump<'_> {
        PortsDump { domain: self }
    }
}

/// Display adapter listing the live channels of a domain.
pub struct PortsDump<'a> {
    domain: &'a Domain,
}

impl<'a> fmt::Display for PortsDump<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for port in 0..self.domain.valid_ports() {
            let chn = self.domain.slot(Port::new(port));
            // Skip channels in the middle of a transition rather than waiting on them.
            let state = match chn.try_read() {
                Some(state) => state,
                None => continue,
            };
            if let ChannelState::Free = *state {
                continue;
            }

            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}: {}", port, *state)?;
            if !matches!(*state, ChannelState::Reserved) {
                write!(f, " {}", chn.notify_vcpu())?;
            }
            if chn.is_pending() {
                write!(f, " pending")?;
            }
            if chn.is_masked() {
                write!(f, " masked")?;
            }
            if chn.is_internal() {
                write!(f, " internal")?;
            }
        }
        write!(f, "}}")
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Free => write!(f, "free"),
            ChannelState::Reserved => write!(f, "reserved"),
            ChannelState::Unbound { remote } => write!(f, "unbound({})", remote),
            ChannelState::Interdomain {
                remote_id,
                remote_port,
                ..
            } => write!(f, "interdomain({}:{})", remote_id, remote_port),
            ChannelState::Pirq { pirq } => write!(f, "{}", pirq),
            ChannelState::Virq { virq } => write!(f, "{}", virq),
            ChannelState::Ipi => write!(f, "ipi"),
        }
    }
}

/// Snapshot testing
///
/// Checks that the given struct matches the provided snapshot.
#[cfg(test)]
pub(crate) fn snap<T: core::fmt::Display>(snap: &str, obj: T) {
    assert_eq!(snap, &format!("{}", obj));
}
