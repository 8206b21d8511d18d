//! Hypervisor-internal consumers
//!
//! Channels whose remote end is serviced by the hypervisor carry a small tag instead of a
//! function reference. Tags are handed out by a fixed-capacity registry and stay valid for the
//! lifetime of the engine.

use core::num::NonZeroU8;

use spin::{Mutex, Once};

use crate::config::NR_CONSUMERS;
use crate::ids::{DomainId, Port, VcpuId};
use crate::EvtchnError;

/// Callback invoked when a guest notifies a hypervisor-internal channel.
///
/// Receives the domain owning the internal port, the vCPU it notifies and the port itself.
pub type NotifyFn = fn(DomainId, VcpuId, Port);

/// Stable handle to a registered consumer. Never zero, as zero denotes a guest consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsumerTag(NonZeroU8);

impl ConsumerTag {
    pub(crate) fn from_raw(raw: u8) -> Option<Self> {
        NonZeroU8::new(raw).map(ConsumerTag)
    }

    pub(crate) fn as_raw(self) -> u8 {
        self.0.get()
    }

    fn slot(self) -> usize {
        self.0.get() as usize - 1
    }
}

pub struct ConsumerRegistry {
    slots: [Once<NotifyFn>; NR_CONSUMERS],
    /// Serializes registrations, lookups only go through the `Once` cells.
    next: Mutex<usize>,
}

impl ConsumerRegistry {
    pub const fn new() -> Self {
        const EMPTY_SLOT: Once<NotifyFn> = Once::new();

        Self {
            slots: [EMPTY_SLOT; NR_CONSUMERS],
            next: Mutex::new(0),
        }
    }

    pub fn register(&self, notify: NotifyFn) -> Result<ConsumerTag, EvtchnError> {
        let mut next = self.next.lock();
        if *next >= NR_CONSUMERS {
            log::warn!("Consumer registry is full ({} slots)", NR_CONSUMERS);
            return Err(EvtchnError::NoSpace);
        }
        let slot = *next;
        self.slots[slot].call_once(|| notify);
        *next += 1;

        // Slots are 1-based so that 0 keeps meaning "guest".
        ConsumerTag::from_raw((slot + 1) as u8).ok_or(EvtchnError::NoSpace)
    }

    pub fn get(&self, tag: ConsumerTag) -> Option<NotifyFn> {
        self.slots.get(tag.slot())?.get().copied()
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
