//! Event Channels
//!
//! The hypervisor's asynchronous notification primitive: inter-domain signaling, virtual and
//! physical interrupt delivery, and hypervisor-to-guest wakeups all go through ports allocated
//! from a per-domain table.
//!
//! Lock order, from outermost to innermost:
//! 1. domain event locks, by ascending domain ID;
//! 2. channel write locks, by ascending `(domain ID, port)`.
//!
//! The delivery paths never wait on a channel lock: they try a read lock and drop the event if a
//! transition is in progress.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod abi;
mod binding;
mod channel;
mod consumer;
mod debug;
mod domain;
mod error;
mod ids;
mod notify;
mod platform;
mod table;
mod teardown;

#[cfg(test)]
mod tests;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::RwLock;

pub use binding::{ChannelStatus, StatusKind};
pub use channel::{Channel, ChannelFlags, ChannelKind};
pub use consumer::{ConsumerTag, NotifyFn};
pub use debug::PortsDump;
pub use domain::{Domain, DomainConfig, Vcpu};
pub use error::{EvtchnError, Progress};
pub use ids::{DomainId, Pirq, Port, VcpuId, Virq};
pub use platform::{Action, NoPlatform, Platform};
pub use table::PortTable;
pub use teardown::destroy_final;

use crate::consumer::ConsumerRegistry;

/// Configuration for the static sizes of the engine.
pub mod config {
    pub const PORTS_PER_BUCKET: usize = 64;
    pub const BUCKETS_PER_GROUP: usize = 8;
    pub const PORTS_PER_GROUP: usize = PORTS_PER_BUCKET * BUCKETS_PER_GROUP;
    pub const NR_GROUPS: usize = 8;
    /// The 2-level ABI: 64 selector bits, each covering a word of 64 ports.
    pub const MAX_PORTS: usize = PORTS_PER_GROUP * NR_GROUPS;
    pub const BITS_PER_WORD: usize = 64;

    pub const NR_VIRQS: usize = 24;
    pub const NR_CONSUMERS: usize = 8;
    pub const DEFAULT_NR_PIRQS: u32 = 256;

    /// Number of ports closed between two preemption checks of bulk walks.
    pub const PREEMPT_BATCH: u32 = 64;

    pub const DEFAULT_PRIORITY: u8 = 7;
    pub const LOWEST_PRIORITY: u8 = 15;
}

// ————————————————————————————————— Engine ————————————————————————————————— //

pub struct EvtchnEngine<P: Platform> {
    platform: P,
    domains: RwLock<BTreeMap<DomainId, Arc<Domain>>>,
    consumers: ConsumerRegistry,
}

impl<P: Platform> EvtchnEngine<P> {
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            domains: RwLock::new(BTreeMap::new()),
            consumers: ConsumerRegistry::new(),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Register a domain and initialize its event channels.
    pub fn create_domain(
        &self,
        id: DomainId,
        config: DomainConfig,
    ) -> Result<Arc<Domain>, EvtchnError> {
        log::trace!("Create domain {}", id);

        if id == DomainId::SELF {
            return Err(EvtchnError::InvalidArgument);
        }
        let mut domains = self.domains.write();
        if domains.contains_key(&id) {
            log::warn!("Domain {} already exists", id);
            return Err(EvtchnError::AlreadyExists);
        }

        let domain = Arc::new(Domain::new(id, config)?);
        domains.insert(id, Arc::clone(&domain));
        Ok(domain)
    }

    /// Look up a domain. The returned reference keeps the domain alive.
    pub fn domain(&self, id: DomainId) -> Result<Arc<Domain>, EvtchnError> {
        self.domains
            .read()
            .get(&id)
            .cloned()
            .ok_or(EvtchnError::NoSuchDomain)
    }

    pub fn domain_ids(&self) -> alloc::vec::Vec<DomainId> {
        self.domains.read().keys().copied().collect()
    }

    /// Register a hypervisor-internal consumer, to be used with internal unbound ports.
    pub fn register_consumer(&self, notify: NotifyFn) -> Result<ConsumerTag, EvtchnError> {
        self.consumers.register(notify)
    }
}
