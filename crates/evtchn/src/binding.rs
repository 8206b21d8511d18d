//! Binding Operations
//!
//! Every transition holds the owning domain's event lock and the channel write lock. Operations
//! touching two domains take the event locks by ascending domain ID, then the channel locks by
//! ascending `(domain ID, port)`, never in call order.

use alloc::sync::Arc;
use core::fmt;

use spin::MutexGuard;

use crate::channel::{ChannelState, ChannelWriteGuard};
use crate::config::LOWEST_PRIORITY;
use crate::consumer::ConsumerTag;
use crate::domain::{Domain, EventState};
use crate::ids::{DomainId, Pirq, Port, VcpuId, Virq};
use crate::platform::{Action, Platform};
use crate::{EvtchnEngine, EvtchnError};

// ————————————————————————————————— Status ————————————————————————————————— //

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusKind {
    /// Free or reserved.
    Closed,
    Unbound { remote: DomainId },
    Interdomain { remote: DomainId, port: Port },
    Pirq(Pirq),
    Virq(Virq),
    Ipi,
}

/// What the status query reports about a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelStatus {
    pub kind: StatusKind,
    pub vcpu: VcpuId,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StatusKind::Closed => write!(f, "closed")?,
            StatusKind::Unbound { remote } => write!(f, "unbound({})", remote)?,
            StatusKind::Interdomain { remote, port } => {
                write!(f, "interdomain({}:{})", remote, port)?
            }
            StatusKind::Pirq(pirq) => write!(f, "{}", pirq)?,
            StatusKind::Virq(virq) => write!(f, "{}", virq)?,
            StatusKind::Ipi => write!(f, "ipi")?,
        }
        write!(f, " on {}", self.vcpu)
    }
}

// ———————————————————————————————— Locking ————————————————————————————————— //

/// Take the event locks of two domains by ascending domain ID.
///
/// Returns the guard of `d1` first. The second guard is `None` for a loopback.
fn lock_pair<'a>(
    d1: &'a Domain,
    d2: &'a Domain,
) -> (MutexGuard<'a, EventState>, Option<MutexGuard<'a, EventState>>) {
    if d1.id() == d2.id() {
        (d1.lock(), None)
    } else if d1.id() < d2.id() {
        let g1 = d1.lock();
        let g2 = d2.lock();
        (g1, Some(g2))
    } else {
        let g2 = d2.lock();
        let g1 = d1.lock();
        (g1, Some(g2))
    }
}

/// Write-lock two channels by ascending `(domain ID, port)`.
fn double_write<'a>(
    (d1, port1): (&'a Domain, Port),
    (d2, port2): (&'a Domain, Port),
) -> (ChannelWriteGuard<'a>, ChannelWriteGuard<'a>) {
    let key1 = (d1.id(), port1);
    let key2 = (d2.id(), port2);
    if key1 == key2 {
        panic!("Double lock of {} port {}", d1.id(), port1);
    }

    if key1 < key2 {
        let g1 = d1.slot(port1).write();
        let g2 = d2.slot(port2).write();
        (g1, g2)
    } else {
        let g2 = d2.slot(port2).write();
        let g1 = d1.slot(port1).write();
        (g1, g2)
    }
}

// ——————————————————————————————— Operations ——————————————————————————————— //

impl<P: Platform> EvtchnEngine<P> {
    /// Allocate a port in `dom` waiting for `remote` to bind to it.
    pub fn alloc_unbound(
        &self,
        caller: DomainId,
        dom: DomainId,
        remote: DomainId,
        port: Option<Port>,
    ) -> Result<Port, EvtchnError> {
        let dom = dom.resolve(caller);
        let remote = remote.resolve(caller);
        log::trace!("Alloc unbound in {} for {} (caller {})", dom, remote, caller);
        self.platform
            .authorize(caller, Action::AllocUnbound { domain: dom, remote })?;

        let d = self.domain(dom)?;
        let mut state = d.lock();
        let port = d.claim_port(&mut state, port)?;
        let mut chn = d.slot(port).write();
        *chn = ChannelState::Unbound { remote };

        log::debug!("{} port {}: unbound for {}", dom, port, remote);
        Ok(port)
    }

    /// Connect a fresh port of `caller` to `remote_port`, which must be unbound and waiting for
    /// `caller`.
    pub fn bind_interdomain(
        &self,
        caller: DomainId,
        remote: DomainId,
        remote_port: Port,
        port: Option<Port>,
    ) -> Result<Port, EvtchnError> {
        let remote = remote.resolve(caller);
        log::trace!("Bind interdomain {} -> {}:{}", caller, remote, remote_port);
        self.platform
            .authorize(caller, Action::BindInterdomain { remote, remote_port })?;

        let ld = self.domain(caller)?;
        let rd = self.domain(remote)?;
        let (mut lstate, _rstate) = lock_pair(&ld, &rd);

        let rchn = rd.channel(remote_port).ok_or(EvtchnError::InvalidArgument)?;
        match *rchn.read() {
            ChannelState::Unbound { remote } if remote == ld.id() => (),
            _ => {
                log::warn!(
                    "{} port {} is not waiting for {}",
                    rd.id(),
                    remote_port,
                    ld.id()
                );
                return Err(EvtchnError::InvalidArgument);
            }
        }

        let lport = ld.claim_port(&mut lstate, port)?;
        {
            let (mut lchn, mut rchn) = double_write((&*ld, lport), (&*rd, remote_port));
            *lchn = ChannelState::Interdomain {
                remote: Arc::downgrade(&rd),
                remote_id: rd.id(),
                remote_port,
            };
            *rchn = ChannelState::Interdomain {
                remote: Arc::downgrade(&ld),
                remote_id: ld.id(),
                remote_port: lport,
            };
        }

        // The remote may have signalled while still unbound, that event must not be lost.
        self.set_pending(&ld, lport, ld.slot(lport));

        log::debug!(
            "{} port {} <-> {} port {}",
            ld.id(),
            lport,
            rd.id(),
            remote_port
        );
        Ok(lport)
    }

    pub fn bind_virq(
        &self,
        caller: DomainId,
        virq: Virq,
        vcpu: VcpuId,
        port: Option<Port>,
    ) -> Result<Port, EvtchnError> {
        log::trace!("Bind {} on {} of {}", virq, vcpu, caller);
        if !virq.is_valid() || (virq.is_global() && vcpu != VcpuId::BOOT) {
            return Err(EvtchnError::InvalidArgument);
        }
        self.platform
            .authorize(caller, Action::BindVirq { virq, vcpu })?;

        let d = self.domain(caller)?;
        let v = d.vcpu(vcpu)?;
        let mut state = d.lock();
        if v.virq_port(virq).is_some() {
            return Err(EvtchnError::AlreadyExists);
        }

        let port = d.claim_port(&mut state, port)?;
        {
            let mut chn = d.slot(port).write();
            chn.channel().set_notify_vcpu(vcpu);
            *chn = ChannelState::Virq { virq };
        }
        v.set_virq_port(virq, Some(port));

        log::debug!("{} port {}: {} on {}", d.id(), port, virq, vcpu);
        Ok(port)
    }

    pub fn bind_ipi(&self, caller: DomainId, vcpu: VcpuId) -> Result<Port, EvtchnError> {
        log::trace!("Bind IPI on {} of {}", vcpu, caller);
        self.platform.authorize(caller, Action::BindIpi { vcpu })?;

        let d = self.domain(caller)?;
        d.vcpu(vcpu)?;
        let mut state = d.lock();
        let port = d.get_free_port(&mut state)?;
        let mut chn = d.slot(port).write();
        chn.channel().set_notify_vcpu(vcpu);
        *chn = ChannelState::Ipi;

        Ok(port)
    }

    pub fn bind_pirq(
        &self,
        caller: DomainId,
        pirq: Pirq,
        will_share: bool,
    ) -> Result<Port, EvtchnError> {
        log::trace!("Bind {} to {}", pirq, caller);
        self.platform.authorize(caller, Action::BindPirq { pirq })?;

        let d = self.domain(caller)?;
        if pirq.as_u32() >= d.nr_pirqs() {
            return Err(EvtchnError::InvalidArgument);
        }

        let mut state = d.lock();
        if d.pirq_port(pirq).is_some() {
            return Err(EvtchnError::AlreadyExists);
        }

        let port = d.get_free_port(&mut state)?;
        if let Err(err) = self
            .platform
            .pirq_bind(d.id(), pirq, VcpuId::BOOT, will_share)
        {
            log::warn!("Platform refused to bind {} of {}: {}", pirq, d.id(), err);
            d.release_claim(&mut state, port);
            return Err(err);
        }

        {
            let mut chn = d.slot(port).write();
            chn.channel().set_notify_vcpu(VcpuId::BOOT);
            *chn = ChannelState::Pirq { pirq };
        }
        d.pirq_ports().write().insert(pirq, port);
        state.vcpu_pirqs[VcpuId::BOOT.as_usize()].insert(port);

        log::debug!("{} port {}: {}", d.id(), port, pirq);
        Ok(port)
    }

    /// Change the vCPU notified by `port`.
    pub fn bind_vcpu(&self, caller: DomainId, port: Port, vcpu: VcpuId) -> Result<(), EvtchnError> {
        log::trace!("Bind {} port {} to {}", caller, port, vcpu);
        self.platform
            .authorize(caller, Action::BindVcpu { port, vcpu })?;

        let d = self.domain(caller)?;
        d.vcpu(vcpu)?;
        let mut state = d.lock();
        let chn = d.channel(port).ok_or(EvtchnError::InvalidArgument)?;
        if chn.is_internal() {
            return Err(EvtchnError::InvalidArgument);
        }

        match *chn.read() {
            ChannelState::Virq { virq } if virq.is_global() => chn.set_notify_vcpu(vcpu),
            ChannelState::Unbound { .. } | ChannelState::Interdomain { .. } => {
                chn.set_notify_vcpu(vcpu)
            }
            ChannelState::Pirq { pirq } => {
                let old = chn.notify_vcpu();
                if old != vcpu {
                    state.vcpu_pirqs[old.as_usize()].remove(&port);
                    chn.set_notify_vcpu(vcpu);
                    state.vcpu_pirqs[vcpu.as_usize()].insert(port);
                    self.platform.pirq_set_affinity(d.id(), pirq, vcpu);
                }
            }
            _ => return Err(EvtchnError::InvalidArgument),
        }

        Ok(())
    }

    pub fn close(&self, caller: DomainId, port: Port) -> Result<(), EvtchnError> {
        log::trace!("Close {} port {}", caller, port);
        self.platform.authorize(caller, Action::Close { port })?;

        let d = self.domain(caller)?;
        self.close_port(&d, port, true)
    }

    pub fn status(
        &self,
        caller: DomainId,
        dom: DomainId,
        port: Port,
    ) -> Result<ChannelStatus, EvtchnError> {
        let dom = dom.resolve(caller);
        log::trace!("Status of {} port {}", dom, port);
        self.platform
            .authorize(caller, Action::Status { domain: dom, port })?;

        let d = self.domain(dom)?;
        let chn = d.channel(port).ok_or(EvtchnError::InvalidArgument)?;
        let state = chn.read();
        let kind = match &*state {
            ChannelState::Free | ChannelState::Reserved => StatusKind::Closed,
            ChannelState::Unbound { remote } => StatusKind::Unbound { remote: *remote },
            ChannelState::Interdomain {
                remote_id,
                remote_port,
                ..
            } => StatusKind::Interdomain {
                remote: *remote_id,
                port: *remote_port,
            },
            ChannelState::Pirq { pirq } => StatusKind::Pirq(*pirq),
            ChannelState::Virq { virq } => StatusKind::Virq(*virq),
            ChannelState::Ipi => StatusKind::Ipi,
        };

        Ok(ChannelStatus {
            kind,
            vcpu: chn.notify_vcpu(),
        })
    }

    pub fn set_priority(
        &self,
        caller: DomainId,
        port: Port,
        priority: u32,
    ) -> Result<(), EvtchnError> {
        log::trace!("Set priority of {} port {} to {}", caller, port, priority);
        self.platform
            .authorize(caller, Action::SetPriority { port })?;

        let d = self.domain(caller)?;
        let chn = d.channel(port).ok_or(EvtchnError::InvalidArgument)?;
        if priority > LOWEST_PRIORITY as u32 {
            return Err(EvtchnError::InvalidArgument);
        }

        let _state = chn.read();
        chn.set_priority(priority as u8);
        Ok(())
    }

    pub fn unmask(&self, caller: DomainId, port: Port) -> Result<(), EvtchnError> {
        log::trace!("Unmask {} port {}", caller, port);
        self.platform.authorize(caller, Action::Unmask { port })?;

        let d = self.domain(caller)?;
        let chn = d.channel(port).ok_or(EvtchnError::InvalidArgument)?;
        let _state = chn.read();
        self.unmask_channel(&d, port, chn);
        Ok(())
    }

    /// Replay the affinity of every PIRQ notifying `vcpu`, after the vCPU moved.
    pub fn move_pirqs(&self, domain: DomainId, vcpu: VcpuId) -> Result<(), EvtchnError> {
        log::trace!("Move PIRQs of {} on {}", domain, vcpu);
        let d = self.domain(domain)?;
        d.vcpu(vcpu)?;

        let state = d.lock();
        for port in state.vcpu_pirqs[vcpu.as_usize()].iter() {
            if let Some(chn) = d.channel(*port) {
                if let ChannelState::Pirq { pirq } = *chn.read() {
                    self.platform.pirq_set_affinity(d.id(), pirq, vcpu);
                }
            }
        }
        Ok(())
    }

    // ——————————————————————————— Internal Consumers ——————————————————————————— //

    /// Allocate an unbound port in `domain` whose events are consumed by the hypervisor.
    pub fn alloc_unbound_internal(
        &self,
        domain: DomainId,
        vcpu: VcpuId,
        remote: DomainId,
        tag: ConsumerTag,
    ) -> Result<Port, EvtchnError> {
        log::trace!("Alloc internal unbound in {} for {}", domain, remote);
        if self.consumers.get(tag).is_none() {
            return Err(EvtchnError::InvalidArgument);
        }

        let d = self.domain(domain)?;
        d.vcpu(vcpu)?;
        let mut state = d.lock();
        let port = d.get_free_port(&mut state)?;
        {
            let mut chn = d.slot(port).write();
            chn.channel().set_notify_vcpu(vcpu);
            chn.channel().set_consumer(Some(tag));
            *chn = ChannelState::Unbound {
                remote: remote.resolve(domain),
            };
        }
        state.internal_ports += 1;

        log::debug!("{} port {}: internal, unbound for {}", d.id(), port, remote);
        Ok(port)
    }

    /// Close a port allocated with [`Self::alloc_unbound_internal`].
    ///
    /// A port of a dying domain may already be gone, that is not an error.
    pub fn free_internal(&self, domain: DomainId, port: Port) -> Result<(), EvtchnError> {
        log::trace!("Free internal {} port {}", domain, port);
        let d = self.domain(domain)?;
        match d.channel(port) {
            None if d.is_dying() => Ok(()),
            None => Err(EvtchnError::InvalidArgument),
            Some(chn) if !chn.is_internal() => {
                if d.is_dying() {
                    Ok(())
                } else {
                    Err(EvtchnError::InvalidArgument)
                }
            }
            Some(_) => self.close_port(&d, port, false),
        }
    }

    // ————————————————————————————————— Close —————————————————————————————————— //

    /// Close `port1` of `d1`.
    ///
    /// Guest callers may not close channels owned by a hypervisor-internal consumer.
    pub(crate) fn close_port(
        &self,
        d1: &Domain,
        port1: Port,
        guest: bool,
    ) -> Result<(), EvtchnError> {
        let mut state1 = d1.lock();

        loop {
            let chn1 = d1.channel(port1).ok_or(EvtchnError::InvalidArgument)?;
            if guest && chn1.is_internal() {
                return Err(EvtchnError::InvalidArgument);
            }

            let peer = match &*chn1.read() {
                ChannelState::Free | ChannelState::Reserved => {
                    return Err(EvtchnError::InvalidArgument)
                }
                ChannelState::Interdomain {
                    remote,
                    remote_id,
                    remote_port,
                } => Some((remote.clone(), *remote_id, *remote_port)),
                _ => None,
            };
            let (remote, remote_id, port2) = match peer {
                Some(peer) => peer,
                None => {
                    self.close_local(d1, &mut state1, port1);
                    return Ok(());
                }
            };

            let d2 = match remote.upgrade() {
                Some(d2) => d2,
                None => panic!(
                    "{} port {} is connected to {} which no longer exists",
                    d1.id(),
                    port1,
                    remote_id
                ),
            };

            if d2.id() == d1.id() {
                close_interdomain(&mut state1, (d1, port1), (&*d2, port2));
                return Ok(());
            }

            let _state2 = if d1.id() < d2.id() {
                d2.lock()
            } else {
                drop(state1);
                let state2 = d2.lock();
                state1 = d1.lock();

                // The port may have changed while unlocked.
                let still_connected = match &*chn1.read() {
                    ChannelState::Interdomain { remote_id, .. } if *remote_id == d2.id() => true,
                    ChannelState::Interdomain { .. } => return Err(EvtchnError::InvalidArgument),
                    _ => false,
                };
                if !still_connected {
                    drop(state2);
                    continue;
                }
                state2
            };

            let port2 = match &*chn1.read() {
                ChannelState::Interdomain { remote_port, .. } => *remote_port,
                _ => port2,
            };
            close_interdomain(&mut state1, (d1, port1), (&*d2, port2));
            return Ok(());
        }
    }

    /// Close a channel that does not involve another domain.
    fn close_local(&self, d: &Domain, state: &mut EventState, port: Port) {
        let mut chn = d.slot(port).write();
        match &*chn {
            ChannelState::Pirq { pirq } => {
                let pirq = *pirq;
                self.platform.pirq_unbind(d.id(), pirq);
                d.pirq_ports().write().remove(&pirq);
                let vcpu = chn.channel().notify_vcpu();
                if let Some(ports) = state.vcpu_pirqs.get_mut(vcpu.as_usize()) {
                    ports.remove(&port);
                }
            }
            ChannelState::Virq { virq } => {
                let virq = *virq;
                for vcpu in d.vcpus() {
                    if vcpu.virq_port(virq) == Some(port) {
                        vcpu.set_virq_port(virq, None);
                    }
                }
            }
            _ => (),
        }

        d.free_channel(state, &mut chn);
        log::debug!("{} port {}: closed", d.id(), port);
    }
}

/// Free the local end of an interdomain pair, the remote end goes back to waiting for us.
///
/// Both event locks must be held.
fn close_interdomain(
    state1: &mut EventState,
    (d1, port1): (&Domain, Port),
    (d2, port2): (&Domain, Port),
) {
    let (mut chn1, mut chn2) = double_write((d1, port1), (d2, port2));
    match &*chn2 {
        ChannelState::Interdomain {
            remote_id,
            remote_port,
            ..
        } if *remote_id == d1.id() && *remote_port == port1 => (),
        _ => panic!(
            "{} port {} is not connected back to {} port {}",
            d2.id(),
            port2,
            d1.id(),
            port1
        ),
    }

    *chn2 = ChannelState::Unbound { remote: d1.id() };
    d1.free_channel(state1, &mut chn1);

    log::debug!(
        "{} port {}: closed, {} port {} unbound",
        d1.id(),
        port1,
        d2.id(),
        port2
    );
}
