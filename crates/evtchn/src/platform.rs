//! Platform trait.
//! The platform is the interface between the event-channel engine and the rest of the
//! hypervisor: scheduler, interrupt controller and security policy.

use crate::ids::{DomainId, Pirq, Port, VcpuId, Virq};
use crate::EvtchnError;

/// An operation submitted to the security policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    AllocUnbound { domain: DomainId, remote: DomainId },
    BindInterdomain { remote: DomainId, remote_port: Port },
    BindVirq { virq: Virq, vcpu: VcpuId },
    BindIpi { vcpu: VcpuId },
    BindPirq { pirq: Pirq },
    BindVcpu { port: Port, vcpu: VcpuId },
    Close { port: Port },
    Send { port: Port },
    Status { domain: DomainId, port: Port },
    Unmask { port: Port },
    SetPriority { port: Port },
    Reset { domain: DomainId },
}

pub trait Platform {
    /// Kick a vCPU that has a fresh upcall pending.
    fn wake(&self, domain: DomainId, vcpu: VcpuId);

    /// Whether a long running walk should yield back to its caller.
    fn preempt_check(&self) -> bool {
        false
    }

    /// Route a physical interrupt to the guest.
    fn pirq_bind(
        &self,
        _domain: DomainId,
        _pirq: Pirq,
        _vcpu: VcpuId,
        _shared: bool,
    ) -> Result<(), EvtchnError> {
        Ok(())
    }

    fn pirq_unbind(&self, _domain: DomainId, _pirq: Pirq) {}

    /// The vCPU handling a physical interrupt changed.
    fn pirq_set_affinity(&self, _domain: DomainId, _pirq: Pirq, _vcpu: VcpuId) {}

    /// Authorization check run before any state is touched.
    fn authorize(&self, _subject: DomainId, _action: Action) -> Result<(), EvtchnError> {
        Ok(())
    }
}

// —————————————————————— Default NoPlatform Implementation —————————————————————— //

/// Placeholder platform: nobody to wake, never preempts, allows everything.
pub struct NoPlatform {}

impl Platform for NoPlatform {
    fn wake(&self, _domain: DomainId, _vcpu: VcpuId) {}
}
