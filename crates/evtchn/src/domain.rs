use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::{Mutex, MutexGuard, RwLock};

use crate::channel::{Channel, ChannelKind, ChannelState, ChannelWriteGuard};
use crate::config::{DEFAULT_NR_PIRQS, MAX_PORTS, NR_VIRQS};
use crate::ids::{DomainId, Pirq, Port, VcpuId, Virq};
use crate::table::PortTable;
use crate::EvtchnError;

// ————————————————————————————— Configuration —————————————————————————————— //

/// Per-domain parameters given at domain creation.
#[derive(Clone, Copy, Debug)]
pub struct DomainConfig {
    pub nr_vcpus: u32,
    /// Highest port the domain may allocate, clamped to what the table can hold.
    pub max_port: u32,
    pub nr_pirqs: u32,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            nr_vcpus: 1,
            max_port: MAX_PORTS as u32 - 1,
            nr_pirqs: DEFAULT_NR_PIRQS,
        }
    }
}

// —————————————————————————————————— vCPU —————————————————————————————————— //

/// Event-channel view of a vCPU: its VIRQ index and its upcall state.
pub struct Vcpu {
    id: VcpuId,
    /// VIRQ to port index, 0 meaning unbound as port 0 is never handed out.
    virq_to_port: [AtomicU32; NR_VIRQS],
    /// Selector of pending words, bit i covers ports 64 * i to 64 * i + 63.
    pending_sel: AtomicU64,
    upcall_pending: AtomicBool,
}

impl Vcpu {
    fn new(id: VcpuId) -> Self {
        const UNBOUND: AtomicU32 = AtomicU32::new(0);

        Self {
            id,
            virq_to_port: [UNBOUND; NR_VIRQS],
            pending_sel: AtomicU64::new(0),
            upcall_pending: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> VcpuId {
        self.id
    }

    pub fn virq_port(&self, virq: Virq) -> Option<Port> {
        let slot = self.virq_to_port.get(virq.as_usize())?;
        match slot.load(Ordering::Acquire) {
            0 => None,
            port => Some(Port::new(port)),
        }
    }

    pub(crate) fn set_virq_port(&self, virq: Virq, port: Option<Port>) {
        let raw = port.map_or(0, Port::as_u32);
        self.virq_to_port[virq.as_usize()].store(raw, Ordering::Release);
    }

    pub fn pending_sel(&self) -> u64 {
        self.pending_sel.load(Ordering::Acquire)
    }

    /// Consume the selector, as the guest does when it scans its pending words.
    pub fn take_pending_sel(&self) -> u64 {
        self.pending_sel.swap(0, Ordering::AcqRel)
    }

    /// Returns whether the selector bit was already set.
    pub(crate) fn test_and_set_sel(&self, word: usize) -> bool {
        let bit = 1u64 << word;
        self.pending_sel.fetch_or(bit, Ordering::AcqRel) & bit != 0
    }

    pub fn upcall_pending(&self) -> bool {
        self.upcall_pending.load(Ordering::Acquire)
    }

    /// Acknowledge the upcall, returns whether one was pending.
    pub fn ack_upcall(&self) -> bool {
        self.upcall_pending.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn test_and_set_upcall(&self) -> bool {
        self.upcall_pending.swap(true, Ordering::AcqRel)
    }
}

// —————————————————————————————— Event State ——————————————————————————————— //

/// Everything guarded by the domain event lock.
pub(crate) struct EventState {
    pub max_port: u32,
    /// Resume cursor of an in-progress reset, 0 when no reset is running.
    pub next_port: u32,
    pub active_ports: u32,
    pub internal_ports: u32,
    /// Ports bound to physical interrupts, per notified vCPU.
    pub vcpu_pirqs: Vec<BTreeSet<Port>>,
}

// ————————————————————————————————— Domain ————————————————————————————————— //

pub struct Domain {
    /// Unique domain ID.
    id: DomainId,
    vcpus: Box<[Vcpu]>,
    nr_pirqs: u32,
    /// The port table, readable without the event lock.
    ports: PortTable,
    /// Serializes port allocation and every state transition of this domain's channels.
    event_lock: Mutex<EventState>,
    /// Written with the event lock held, read from interrupt delivery.
    pirq_ports: RwLock<BTreeMap<Pirq, Port>>,
    /// Is the domain in the process of being destroyed?
    is_dying: AtomicBool,
}

impl Domain {
    /// Create a domain and initialize its event channels.
    ///
    /// Port 0 is allocated and reserved, it is not counted as active.
    pub fn new(id: DomainId, config: DomainConfig) -> Result<Self, EvtchnError> {
        if config.nr_vcpus == 0 {
            log::warn!("Refusing to create {} without vCPUs", id);
            return Err(EvtchnError::InvalidArgument);
        }
        if config.max_port as usize >= MAX_PORTS {
            log::debug!(
                "Clamping max port of {} from {} to {}",
                id,
                config.max_port,
                MAX_PORTS - 1
            );
        }
        let max_port = config.max_port.min(MAX_PORTS as u32 - 1);

        let domain = Self {
            id,
            vcpus: (0..config.nr_vcpus).map(|v| Vcpu::new(VcpuId::new(v))).collect(),
            nr_pirqs: config.nr_pirqs,
            ports: PortTable::new(),
            event_lock: Mutex::new(EventState {
                max_port,
                next_port: 0,
                active_ports: 0,
                internal_ports: 0,
                vcpu_pirqs: (0..config.nr_vcpus).map(|_| BTreeSet::new()).collect(),
            }),
            pirq_ports: RwLock::new(BTreeMap::new()),
            is_dying: AtomicBool::new(false),
        };

        {
            let mut state = domain.lock();
            domain.allocate_port(&mut state, Port::RESERVED)?;
            let mut chn = domain.slot(Port::RESERVED).write();
            *chn = ChannelState::Reserved;
            state.active_ports = 0;
        }

        log::info!(
            "Initialized event channels of {} ({} vCPUs, max port {})",
            id,
            config.nr_vcpus,
            max_port
        );
        Ok(domain)
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn nr_vcpus(&self) -> usize {
        self.vcpus.len()
    }

    pub fn vcpu(&self, id: VcpuId) -> Result<&Vcpu, EvtchnError> {
        self.vcpus.get(id.as_usize()).ok_or(EvtchnError::NoSuchVcpu)
    }

    pub fn vcpus(&self) -> &[Vcpu] {
        &self.vcpus
    }

    pub fn nr_pirqs(&self) -> u32 {
        self.nr_pirqs
    }

    /// The channel behind `port`, if the port is valid.
    pub fn channel(&self, port: Port) -> Option<&Channel> {
        self.ports.get(port)
    }

    pub(crate) fn ports(&self) -> &PortTable {
        &self.ports
    }

    pub(crate) fn ports_mut(&mut self) -> &mut PortTable {
        &mut self.ports
    }

    pub fn valid_ports(&self) -> u32 {
        self.ports.valid_ports()
    }

    pub fn active_ports(&self) -> u32 {
        self.lock().active_ports
    }

    pub fn internal_ports(&self) -> u32 {
        self.lock().internal_ports
    }

    pub fn max_port(&self) -> u32 {
        self.lock().max_port
    }

    /// Resume cursor of an in-progress reset.
    pub fn next_port(&self) -> u32 {
        self.lock().next_port
    }

    pub fn is_dying(&self) -> bool {
        self.is_dying.load(Ordering::Acquire)
    }

    /// Returns whether the domain was already dying.
    pub(crate) fn set_dying(&self) -> bool {
        self.is_dying.swap(true, Ordering::AcqRel)
    }

    pub fn pirq_port(&self, pirq: Pirq) -> Option<Port> {
        self.pirq_ports.read().get(&pirq).copied()
    }

    pub(crate) fn pirq_ports(&self) -> &RwLock<BTreeMap<Pirq, Port>> {
        &self.pirq_ports
    }

    /// Ports bound to physical interrupts and notifying `vcpu`, in ascending order.
    pub fn pirq_ports_on(&self, vcpu: VcpuId) -> Vec<Port> {
        self.lock()
            .vcpu_pirqs
            .get(vcpu.as_usize())
            .map(|ports| ports.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EventState> {
        self.event_lock.lock()
    }

    /// Channel behind a port the caller already validated.
    pub(crate) fn slot(&self, port: Port) -> &Channel {
        match self.ports.get(port) {
            Some(chn) => chn,
            None => panic!("{}: port {} used without being valid", self.id, port),
        }
    }

    // ——————————————————————————— Port Allocation ———————————————————————————— //

    /// Claim `port`, growing the table if needed.
    ///
    /// The claimed channel stays `Free` until the caller installs a state, which it must do
    /// without releasing the event lock.
    pub(crate) fn allocate_port(
        &self,
        state: &mut EventState,
        port: Port,
    ) -> Result<(), EvtchnError> {
        if self.is_dying() {
            return Err(EvtchnError::InvalidArgument);
        }
        if port.as_u32() > state.max_port || port.as_usize() >= MAX_PORTS {
            return Err(EvtchnError::NoSpace);
        }

        match self.ports.get(port) {
            Some(chn) => {
                if chn.kind() != ChannelKind::Free {
                    return Err(EvtchnError::Busy);
                }
            }
            None => self.ports.grow_to(port)?,
        }

        state.active_ports += 1;
        Ok(())
    }

    /// Claim the lowest free port.
    pub(crate) fn get_free_port(&self, state: &mut EventState) -> Result<Port, EvtchnError> {
        if self.is_dying() {
            return Err(EvtchnError::InvalidArgument);
        }

        for port in 0..=state.max_port {
            let port = Port::new(port);
            match self.allocate_port(state, port) {
                Ok(()) => return Ok(port),
                Err(EvtchnError::Busy) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(EvtchnError::NoSpace)
    }

    /// Claim `port` if given, the lowest free port otherwise.
    pub(crate) fn claim_port(
        &self,
        state: &mut EventState,
        port: Option<Port>,
    ) -> Result<Port, EvtchnError> {
        match port {
            Some(port) => self.allocate_port(state, port).map(|_| port),
            None => self.get_free_port(state),
        }
    }

    /// Undo a claim whose binding failed before any state was installed.
    pub(crate) fn release_claim(&self, state: &mut EventState, port: Port) {
        debug_assert_eq!(self.slot(port).kind(), ChannelKind::Free);
        state.active_ports = decrement(state.active_ports, "active ports");
    }

    /// Return a channel to `Free` and update the counters.
    pub(crate) fn free_channel(&self, state: &mut EventState, chn: &mut ChannelWriteGuard<'_>) {
        if chn.release() {
            state.internal_ports = decrement(state.internal_ports, "internal ports");
        }
        state.active_ports = decrement(state.active_ports, "active ports");
    }
}

fn decrement(counter: u32, name: &str) -> u32 {
    match counter.checked_sub(1) {
        Some(value) => value,
        None => panic!("Underflow of {} counter", name),
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PORTS_PER_BUCKET;

    fn domain(max_port: u32) -> Domain {
        let config = DomainConfig {
            nr_vcpus: 2,
            max_port,
            nr_pirqs: 16,
        };
        Domain::new(DomainId::new(1), config).unwrap()
    }

    #[test]
    fn init_reserves_port_zero() {
        let d = domain(100);
        assert_eq!(d.valid_ports() as usize, PORTS_PER_BUCKET);
        assert_eq!(d.channel(Port::RESERVED).unwrap().kind(), ChannelKind::Reserved);
        assert_eq!(d.active_ports(), 0);
    }

    #[test]
    fn free_port_is_lowest() {
        let d = domain(100);
        let mut state = d.lock();
        assert_eq!(d.get_free_port(&mut state), Ok(Port::new(1)));
        // Still free until a state is installed.
        {
            let mut chn = d.slot(Port::new(1)).write();
            *chn = ChannelState::Ipi;
        }
        assert_eq!(d.get_free_port(&mut state), Ok(Port::new(2)));
        assert_eq!(state.active_ports, 2);
    }

    #[test]
    fn explicit_port() {
        let d = domain(100);
        let mut state = d.lock();
        assert_eq!(
            d.allocate_port(&mut state, Port::new(101)),
            Err(EvtchnError::NoSpace)
        );
        assert_eq!(
            d.allocate_port(&mut state, Port::RESERVED),
            Err(EvtchnError::Busy)
        );
        d.allocate_port(&mut state, Port::new(99)).unwrap();
        assert_eq!(d.ports().valid_ports() as usize, 2 * PORTS_PER_BUCKET);
    }

    #[test]
    fn exhaustion() {
        let d = domain(3);
        let mut state = d.lock();
        for expected in 1..=3 {
            let port = d.get_free_port(&mut state).unwrap();
            assert_eq!(port, Port::new(expected));
            let mut chn = d.slot(port).write();
            *chn = ChannelState::Ipi;
        }
        assert_eq!(d.get_free_port(&mut state), Err(EvtchnError::NoSpace));
    }

    #[test]
    fn dying_domain_cannot_allocate() {
        let d = domain(100);
        d.set_dying();
        let mut state = d.lock();
        assert_eq!(
            d.get_free_port(&mut state),
            Err(EvtchnError::InvalidArgument)
        );
    }

    #[test]
    fn no_vcpus() {
        let config = DomainConfig {
            nr_vcpus: 0,
            ..DomainConfig::default()
        };
        assert!(matches!(
            Domain::new(DomainId::new(1), config),
            Err(EvtchnError::InvalidArgument)
        ));
    }
}
