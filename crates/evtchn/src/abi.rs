//! Monitor-call interface
//!
//! Fixed-layout requests: the call number selects the operation, arguments come in four
//! registers and results go back in four registers.

use crate::binding::StatusKind;
use crate::ids::{DomainId, Pirq, Port, VcpuId, Virq};
use crate::platform::Platform;
use crate::{EvtchnEngine, EvtchnError, Progress};

pub mod calls {
    pub const BIND_INTERDOMAIN: usize = 0;
    pub const BIND_VIRQ: usize = 1;
    pub const BIND_PIRQ: usize = 2;
    pub const CLOSE: usize = 3;
    pub const SEND: usize = 4;
    pub const STATUS: usize = 5;
    pub const ALLOC_UNBOUND: usize = 6;
    pub const BIND_IPI: usize = 7;
    pub const BIND_VCPU: usize = 8;
    pub const UNMASK: usize = 9;
    pub const RESET: usize = 10;
    pub const SET_PRIORITY: usize = 13;
    pub const RESET_CONT: usize = 14;
}

/// Status codes reported by `STATUS` in the first result register.
pub mod status {
    pub const CLOSED: usize = 0;
    pub const UNBOUND: usize = 1;
    pub const INTERDOMAIN: usize = 2;
    pub const PIRQ: usize = 3;
    pub const VIRQ: usize = 4;
    pub const IPI: usize = 5;
}

/// Flag of `BIND_PIRQ`: the line may be shared with other domains.
pub const BIND_PIRQ_WILL_SHARE: usize = 1;

/// Returned to the caller when a preempted operation must be issued again.
pub const ERESTART: isize = -85;

/// Execute a monitor call on behalf of `caller`.
pub fn dispatch<P: Platform>(
    engine: &EvtchnEngine<P>,
    caller: DomainId,
    call: usize,
    args: &[usize; 4],
    res: &mut [usize; 4],
) -> Result<Progress, EvtchnError> {
    match call {
        calls::BIND_INTERDOMAIN => {
            log::trace!("Bind interdomain call from {}", caller);
            let port = engine.bind_interdomain(caller, domain(args[0])?, port(args[1])?, None)?;
            res[0] = port.as_usize();
        }
        calls::BIND_VIRQ => {
            log::trace!("Bind VIRQ call from {}", caller);
            let virq = Virq::new(u32_arg(args[0])?);
            let port = engine.bind_virq(caller, virq, vcpu(args[1])?, None)?;
            res[0] = port.as_usize();
        }
        calls::BIND_PIRQ => {
            log::trace!("Bind PIRQ call from {}", caller);
            let pirq = Pirq::new(u32_arg(args[0])?);
            let will_share = args[1] & BIND_PIRQ_WILL_SHARE != 0;
            let port = engine.bind_pirq(caller, pirq, will_share)?;
            res[0] = port.as_usize();
        }
        calls::CLOSE => {
            log::trace!("Close call from {}", caller);
            engine.close(caller, port(args[0])?)?;
        }
        calls::SEND => {
            log::trace!("Send call from {}", caller);
            engine.send(caller, port(args[0])?)?;
        }
        calls::STATUS => {
            log::trace!("Status call from {}", caller);
            let info = engine.status(caller, domain(args[0])?, port(args[1])?)?;
            let (code, arg0, arg1) = match info.kind {
                StatusKind::Closed => (status::CLOSED, 0, 0),
                StatusKind::Unbound { remote } => (status::UNBOUND, remote.as_u16() as usize, 0),
                StatusKind::Interdomain { remote, port } => (
                    status::INTERDOMAIN,
                    remote.as_u16() as usize,
                    port.as_usize(),
                ),
                StatusKind::Pirq(pirq) => (status::PIRQ, pirq.as_u32() as usize, 0),
                StatusKind::Virq(virq) => (status::VIRQ, virq.as_usize(), 0),
                StatusKind::Ipi => (status::IPI, 0, 0),
            };
            res[0] = code;
            res[1] = info.vcpu.as_usize();
            res[2] = arg0;
            res[3] = arg1;
        }
        calls::ALLOC_UNBOUND => {
            log::trace!("Alloc unbound call from {}", caller);
            let port = engine.alloc_unbound(caller, domain(args[0])?, domain(args[1])?, None)?;
            res[0] = port.as_usize();
        }
        calls::BIND_IPI => {
            log::trace!("Bind IPI call from {}", caller);
            let port = engine.bind_ipi(caller, vcpu(args[0])?)?;
            res[0] = port.as_usize();
        }
        calls::BIND_VCPU => {
            log::trace!("Bind vCPU call from {}", caller);
            engine.bind_vcpu(caller, port(args[0])?, vcpu(args[1])?)?;
        }
        calls::UNMASK => {
            log::trace!("Unmask call from {}", caller);
            engine.unmask(caller, port(args[0])?)?;
        }
        calls::RESET => {
            log::trace!("Reset call from {}", caller);
            return engine.reset(caller, domain(args[0])?, false);
        }
        calls::RESET_CONT => {
            log::trace!("Reset continuation from {}", caller);
            return engine.reset(caller, domain(args[0])?, true);
        }
        calls::SET_PRIORITY => {
            log::trace!("Set priority call from {}", caller);
            engine.set_priority(caller, port(args[0])?, u32_arg(args[1])?)?;
        }
        _ => {
            log::warn!("Unknown event channel call {} from {}", call, caller);
            return Err(EvtchnError::InvalidArgument);
        }
    }

    Ok(Progress::Done)
}

/// Encode the outcome of a call into the value returned to the guest.
pub fn return_code(result: Result<Progress, EvtchnError>) -> isize {
    match result {
        Ok(Progress::Done) => 0,
        Ok(Progress::Restart) => ERESTART,
        Err(err) => err.errno(),
    }
}

// ——————————————————————————————— Arguments ———————————————————————————————— //

fn u32_arg(arg: usize) -> Result<u32, EvtchnError> {
    u32::try_from(arg).map_err(|_| EvtchnError::InvalidArgument)
}

fn domain(arg: usize) -> Result<DomainId, EvtchnError> {
    u16::try_from(arg)
        .map(DomainId::new)
        .map_err(|_| EvtchnError::InvalidArgument)
}

fn port(arg: usize) -> Result<Port, EvtchnError> {
    u32_arg(arg).map(Port::new)
}

fn vcpu(arg: usize) -> Result<VcpuId, EvtchnError> {
    u32_arg(arg).map(VcpuId::new)
}

// ————————————————————————————————— Tests —————————————————————————————————— //
