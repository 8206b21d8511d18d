//! Notification Path
//!
//! Senders and interrupt deliveries only ever take a channel read lock, and only opportunistically:
//! a channel being written to is about to be closed or rebound, and the event is dropped.
//!
//! Pending events follow the 2-level model: a pending bit per port, a selector bit per word of 64
//! ports on the notified vCPU, and an upcall flag per vCPU.

use crate::channel::{Channel, ChannelFlags, ChannelState};
use crate::config::BITS_PER_WORD;
use crate::domain::Domain;
use crate::ids::{DomainId, Pirq, Port, VcpuId, Virq};
use crate::platform::{Action, Platform};
use crate::{EvtchnEngine, EvtchnError};

impl<P: Platform> EvtchnEngine<P> {
    /// Signal the other end of `port`.
    pub fn send(&self, caller: DomainId, port: Port) -> Result<(), EvtchnError> {
        log::trace!("Send on {} port {}", caller, port);
        self.platform.authorize(caller, Action::Send { port })?;

        let ld = self.domain(caller)?;
        let lchn = ld.channel(port).ok_or(EvtchnError::InvalidArgument)?;
        let lstate = match lchn.try_read() {
            Some(state) => state,
            None => return Ok(()),
        };
        if lchn.is_internal() {
            return Err(EvtchnError::InvalidArgument);
        }

        let (rd, rport) = match &*lstate {
            ChannelState::Interdomain {
                remote,
                remote_id,
                remote_port,
            } => match remote.upgrade() {
                Some(rd) => (rd, *remote_port),
                None => panic!(
                    "{} port {} is connected to {} which no longer exists",
                    ld.id(),
                    port,
                    remote_id
                ),
            },
            ChannelState::Ipi => {
                self.set_pending(&ld, port, lchn);
                return Ok(());
            }
            // Nobody to notify yet.
            ChannelState::Unbound { .. } => return Ok(()),
            _ => return Err(EvtchnError::InvalidArgument),
        };

        let rchn = rd.slot(rport);
        match rchn.consumer().and_then(|tag| self.consumers.get(tag)) {
            Some(notify) => {
                let vcpu = rchn.notify_vcpu();
                drop(lstate);
                // The upgraded reference keeps the remote alive during the callback.
                notify(rd.id(), vcpu, rport);
            }
            None => self.set_pending(&rd, rport, rchn),
        }

        Ok(())
    }

    /// Hypervisor-side send over an internal channel, towards the guest connected to it.
    pub fn notify_internal(&self, domain: DomainId, port: Port) -> Result<(), EvtchnError> {
        log::trace!("Internal notify on {} port {}", domain, port);
        let ld = self.domain(domain)?;
        let lchn = ld.channel(port).ok_or(EvtchnError::InvalidArgument)?;
        let lstate = match lchn.try_read() {
            Some(state) => state,
            None => return Ok(()),
        };
        if !lchn.is_internal() {
            return Err(EvtchnError::InvalidArgument);
        }

        if let ChannelState::Interdomain {
            remote,
            remote_port,
            ..
        } = &*lstate
        {
            if let Some(rd) = remote.upgrade() {
                self.set_pending(&rd, *remote_port, rd.slot(*remote_port));
            }
        }
        Ok(())
    }

    // ————————————————————————————— Interrupts ————————————————————————————— //

    /// Deliver a per-vCPU VIRQ. Returns whether the event was marked pending.
    pub fn deliver_virq(&self, domain: DomainId, vcpu: VcpuId, virq: Virq) -> bool {
        debug_assert!(!virq.is_global(), "{} is global", virq);
        let d = match self.domain(domain) {
            Ok(d) => d,
            Err(_) => return false,
        };
        let port = match d.vcpu(vcpu).ok().and_then(|v| v.virq_port(virq)) {
            Some(port) => port,
            None => return false,
        };
        self.deliver(&d, port, |state| {
            matches!(state, ChannelState::Virq { virq: bound } if *bound == virq)
        })
    }

    /// Deliver a global VIRQ, to whichever vCPU its channel notifies.
    pub fn deliver_global_virq(&self, domain: DomainId, virq: Virq) -> bool {
        debug_assert!(virq.is_global(), "{} is per-vCPU", virq);
        let d = match self.domain(domain) {
            Ok(d) => d,
            Err(_) => return false,
        };
        let port = match d.vcpu(VcpuId::BOOT).ok().and_then(|v| v.virq_port(virq)) {
            Some(port) => port,
            None => return false,
        };
        self.deliver(&d, port, |state| {
            matches!(state, ChannelState::Virq { virq: bound } if *bound == virq)
        })
    }

    /// Forward a physical interrupt. Returns whether the event was marked pending.
    pub fn deliver_pirq(&self, domain: DomainId, pirq: Pirq) -> bool {
        let d = match self.domain(domain) {
            Ok(d) => d,
            Err(_) => return false,
        };
        let port = match d.pirq_port(pirq) {
            Some(port) => port,
            None => return false,
        };
        self.deliver(&d, port, |state| {
            matches!(state, ChannelState::Pirq { pirq: bound } if *bound == pirq)
        })
    }

    fn deliver<F>(&self, d: &Domain, port: Port, is_bound: F) -> bool
    where
        F: FnOnce(&ChannelState) -> bool,
    {
        let chn = match d.channel(port) {
            Some(chn) => chn,
            None => return false,
        };
        let state = match chn.try_read() {
            Some(state) => state,
            None => return false,
        };
        if !is_bound(&state) {
            return false;
        }
        self.set_pending(d, port, chn);
        true
    }

    // —————————————————————————————— 2-level ABI ——————————————————————————————— //

    /// Mark `port` pending and raise an upcall on its vCPU unless masked.
    pub(crate) fn set_pending(&self, d: &Domain, port: Port, chn: &Channel) {
        if chn.test_and_set_pending().contains(ChannelFlags::PENDING) {
            return;
        }
        if chn.is_masked() {
            return;
        }
        self.mark_events_pending(d, port, chn.notify_vcpu());
    }

    /// Clear the mask of `port`, replaying the upcall for an event that arrived while masked.
    pub(crate) fn unmask_channel(&self, d: &Domain, port: Port, chn: &Channel) {
        let old = chn.test_and_clear_masked();
        if old.contains(ChannelFlags::MASKED) && chn.is_pending() {
            self.mark_events_pending(d, port, chn.notify_vcpu());
        }
    }

    fn mark_events_pending(&self, d: &Domain, port: Port, vcpu: VcpuId) {
        let v = match d.vcpu(vcpu) {
            Ok(v) => v,
            Err(_) => panic!("{} port {} notifies unknown {}", d.id(), port, vcpu),
        };
        if v.test_and_set_sel(port.as_usize() / BITS_PER_WORD) {
            return;
        }
        if v.test_and_set_upcall() {
            return;
        }
        log::trace!("Wake {} of {}", vcpu, d.id());
        self.platform.wake(d.id(), vcpu);
    }
}

// ————————————————————————————— Guest View ————————————————————————————— //

/// Operations a guest performs directly on its shared bitmaps.
impl Domain {
    pub fn mask(&self, port: Port) -> Result<(), EvtchnError> {
        let chn = self.channel(port).ok_or(EvtchnError::InvalidArgument)?;
        chn.set_masked();
        Ok(())
    }

    pub fn clear_pending(&self, port: Port) -> Result<(), EvtchnError> {
        let chn = self.channel(port).ok_or(EvtchnError::InvalidArgument)?;
        chn.clear_pending();
        Ok(())
    }
}
