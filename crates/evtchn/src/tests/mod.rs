//! # Tests for the event channel crate.


use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::debug::validate_counters;
use crate::{Action, Domain, DomainConfig, DomainId, EvtchnEngine, EvtchnError, Pirq, Platform, VcpuId};

pub(crate) const A: DomainId = DomainId::new(1);
pub(crate) const B: DomainId = DomainId::new(2);
pub(crate) const C: DomainId = DomainId::new(3);

/// Platform recording every call the engine makes.
#[derive(Default)]
pub(crate) struct TestPlatform {
    pub wakes: Mutex<Vec<(DomainId, VcpuId)>>,
    pub pirq_binds: Mutex<Vec<(DomainId, Pirq, bool)>>,
    pub pirq_unbinds: Mutex<Vec<(DomainId, Pirq)>>,
    pub affinity: Mutex<Vec<(Pirq, VcpuId)>>,
    pub preempt: AtomicBool,
    pub refuse_pirqs: AtomicBool,
    /// Subject whose requests are all denied.
    pub denied: Mutex<Option<DomainId>>,
}

impl TestPlatform {
    pub fn take_wakes(&self) -> Vec<(DomainId, VcpuId)> {
        core::mem::take(&mut *self.wakes.lock())
    }
}

impl Platform for TestPlatform {
    fn wake(&self, domain: DomainId, vcpu: VcpuId) {
        self.wakes.lock().push((domain, vcpu));
    }

    fn preempt_check(&self) -> bool {
        self.preempt.load(Ordering::SeqCst)
    }

    fn pirq_bind(
        &self,
        domain: DomainId,
        pirq: Pirq,
        _vcpu: VcpuId,
        shared: bool,
    ) -> Result<(), EvtchnError> {
        if self.refuse_pirqs.load(Ordering::SeqCst) {
            return Err(EvtchnError::Busy);
        }
        self.pirq_binds.lock().push((domain, pirq, shared));
        Ok(())
    }

    fn pirq_unbind(&self, domain: DomainId, pirq: Pirq) {
        self.pirq_unbinds.lock().push((domain, pirq));
    }

    fn pirq_set_affinity(&self, _domain: DomainId, pirq: Pirq, vcpu: VcpuId) {
        self.affinity.lock().push((pirq, vcpu));
    }

    fn authorize(&self, subject: DomainId, _action: Action) -> Result<(), EvtchnError> {
        if *self.denied.lock() == Some(subject) {
            return Err(EvtchnError::AccessDenied);
        }
        Ok(())
    }
}

pub(crate) fn engine() -> EvtchnEngine<TestPlatform> {
    EvtchnEngine::new(TestPlatform::default())
}

pub(crate) fn domain(
    engine: &EvtchnEngine<TestPlatform>,
    id: DomainId,
    nr_vcpus: u32,
) -> Arc<Domain> {
    let config = DomainConfig {
        nr_vcpus,
        max_port: 1023,
        nr_pirqs: 32,
    };
    engine.create_domain(id, config).unwrap()
}

/// Assert that the counters of `domain` match its table.
pub(crate) fn check_counters(domain: &Domain) {
    let state = domain.lock();
    validate_counters(domain, &state);
}
