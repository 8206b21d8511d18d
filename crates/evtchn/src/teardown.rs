//! Bulk reset and teardown
//!
//! Both walks are preemptible: every `PREEMPT_BATCH` ports they ask the platform whether to
//! yield, and if so persist a cursor in the domain and return [`Progress::Restart`]. The caller
//! resumes by invoking the same operation again.

use alloc::sync::Arc;

use crate::config::PREEMPT_BATCH;
use crate::debug::{debug_check, validate_counters};
use crate::domain::Domain;
use crate::ids::{DomainId, Port};
use crate::platform::{Action, Platform};
use crate::{EvtchnEngine, EvtchnError, Progress};

impl<P: Platform> EvtchnEngine<P> {
    /// Close every channel of `dom` that is not owned by a hypervisor-internal consumer.
    ///
    /// A fresh reset fails with `Busy` while another one is in progress, `resuming` picks up a
    /// preempted one. Fails with `TryAgain` if guest channels are live once the walk is over.
    pub fn reset(
        &self,
        caller: DomainId,
        dom: DomainId,
        resuming: bool,
    ) -> Result<Progress, EvtchnError> {
        let dom = dom.resolve(caller);
        log::trace!("Reset {} (resuming: {})", dom, resuming);
        self.platform
            .authorize(caller, Action::Reset { domain: dom })?;

        let d = self.domain(dom)?;
        let mut port = {
            let mut state = d.lock();
            let start = if resuming {
                state.next_port
            } else if state.next_port == 0 {
                1
            } else {
                0
            };
            if start == 0 {
                log::warn!("A reset of {} is already in progress", dom);
                return Err(EvtchnError::Busy);
            }
            state.next_port = start;
            start
        };

        while d.ports().is_valid(Port::new(port)) {
            // Internal channels are refused, they stay with their owner.
            let _ = self.close_port(&d, Port::new(port), true);
            port += 1;

            if port % PREEMPT_BATCH == 0 && self.platform.preempt_check() {
                d.lock().next_port = port;
                log::debug!("Reset of {} preempted at port {}", dom, port);
                return Ok(Progress::Restart);
            }
        }

        let mut state = d.lock();
        state.next_port = 0;
        debug_check!(validate_counters(&d, &state));
        if state.active_ports > state.internal_ports {
            log::debug!(
                "{} still holds {} guest channels after reset",
                dom,
                state.active_ports - state.internal_ports
            );
            return Err(EvtchnError::TryAgain);
        }

        log::info!("Reset event channels of {}", dom);
        Ok(Progress::Done)
    }

    /// Mark a domain as dying and close all of its channels.
    ///
    /// Preemptible, invoke again on `Restart`. Once `Done`, [`Self::reap_domain`] can release the
    /// table.
    pub fn destroy_domain(&self, id: DomainId) -> Result<Progress, EvtchnError> {
        log::trace!("Destroy {}", id);
        let d = self.domain(id)?;
        if !d.set_dying() {
            log::info!("Destroying event channels of {}", id);
            // Allocations in flight complete before the walk, none start after.
            drop(d.lock());
        }
        self.destroy(&d)
    }

    /// Close every channel of a dying domain, walking down from the highest valid port.
    ///
    /// The valid bound doubles as the resume cursor: everything above it is already closed.
    pub fn destroy(&self, d: &Domain) -> Result<Progress, EvtchnError> {
        if !d.is_dying() {
            return Err(EvtchnError::InvalidArgument);
        }

        let mut port = d.valid_ports();
        while port > 1 {
            port -= 1;
            let _ = self.close_port(d, Port::new(port), false);

            if port % PREEMPT_BATCH == 0 && self.platform.preempt_check() {
                let _state = d.lock();
                d.ports().shrink_to(port);
                log::debug!("Destruction of {} preempted at port {}", d.id(), port);
                return Ok(Progress::Restart);
            }
        }

        let state = d.lock();
        debug_check!(validate_counters(d, &state));
        assert_eq!(
            state.active_ports,
            0,
            "{} has live channels after destruction",
            d.id()
        );
        Ok(Progress::Done)
    }

    /// Remove a destroyed domain from the engine and release its port table.
    ///
    /// Fails with `Busy` while a reference to the domain is still held elsewhere, in which case
    /// the domain stays registered.
    pub fn reap_domain(&self, id: DomainId) -> Result<(), EvtchnError> {
        log::trace!("Reap {}", id);
        let mut domains = self.domains.write();
        let d = domains.remove(&id).ok_or(EvtchnError::NoSuchDomain)?;

        if !d.is_dying() {
            domains.insert(id, d);
            return Err(EvtchnError::InvalidArgument);
        }
        if d.active_ports() != 0 {
            domains.insert(id, d);
            return Err(EvtchnError::Busy);
        }

        match Arc::try_unwrap(d) {
            Ok(mut d) => {
                destroy_final(&mut d);
                log::info!("Reaped {}", id);
                Ok(())
            }
            Err(d) => {
                log::warn!("{} is still referenced, cannot reap it", id);
                domains.insert(id, d);
                Err(EvtchnError::Busy)
            }
        }
    }
}

/// Release every group and bucket of a fully destroyed domain.
///
/// Exclusive access guarantees that no reader still holds a channel reference.
pub fn destroy_final(domain: &mut Domain) {
    domain.ports_mut().release_all();
    domain.pirq_ports().write().clear();
    log::debug!("Released port table of {}", domain.id());
}
