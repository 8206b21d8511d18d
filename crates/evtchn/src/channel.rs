//! Event channels
//!
//! A channel is the record behind a port. Its state and payload live behind a reader/writer lock,
//! while everything a remote sender needs to touch (notify vCPU, consumer tag and the
//! pending/masked bits) is kept in atomics so that a sender never holds two channel locks.

use alloc::sync::Weak;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use bitflags::bitflags;
use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::consumer::ConsumerTag;
use crate::domain::Domain;
use crate::ids::{DomainId, Pirq, Port, VcpuId, Virq};

bitflags! {
    /// Per-channel bits of the 2-level pending and mask bitmaps.
    pub struct ChannelFlags: u8 {
        const PENDING = 1 << 0;
        const MASKED = 1 << 1;
    }
}

// ————————————————————————————————— States ————————————————————————————————— //

/// The state tag of a channel, without payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    Free,
    Reserved,
    Unbound,
    Interdomain,
    Pirq,
    Virq,
    Ipi,
}

impl ChannelKind {
    /// States from or to which every exclusive critical section must go.
    pub fn is_free_or_unbound(self) -> bool {
        matches!(self, ChannelKind::Free | ChannelKind::Unbound)
    }
}

pub enum ChannelState {
    Free,
    Reserved,
    /// Waiting for `remote` to complete an interdomain bind.
    Unbound { remote: DomainId },
    /// Connected to `remote_port` in `remote_id`.
    Interdomain {
        remote: Weak<Domain>,
        remote_id: DomainId,
        remote_port: Port,
    },
    Pirq { pirq: Pirq },
    Virq { virq: Virq },
    Ipi,
}

impl ChannelState {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelState::Free => ChannelKind::Free,
            ChannelState::Reserved => ChannelKind::Reserved,
            ChannelState::Unbound { .. } => ChannelKind::Unbound,
            ChannelState::Interdomain { .. } => ChannelKind::Interdomain,
            ChannelState::Pirq { .. } => ChannelKind::Pirq,
            ChannelState::Virq { .. } => ChannelKind::Virq,
            ChannelState::Ipi => ChannelKind::Ipi,
        }
    }
}

// ———————————————————————————————— Channel ————————————————————————————————— //

pub struct Channel {
    state: RwLock<ChannelState>,
    notify_vcpu: AtomicU32,
    /// 0 for guest consumers, a registry tag for hypervisor-internal ones.
    consumer: AtomicU8,
    flags: AtomicU8,
    priority: AtomicU8,
}

impl Channel {
    pub const fn new() -> Self {
        Self {
            state: RwLock::new(ChannelState::Free),
            notify_vcpu: AtomicU32::new(0),
            consumer: AtomicU8::new(0),
            flags: AtomicU8::new(0),
            priority: AtomicU8::new(crate::config::DEFAULT_PRIORITY),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, ChannelState> {
        self.state.read()
    }

    /// Read lock for paths that must never wait on a concurrent close.
    pub(crate) fn try_read(&self) -> Option<RwLockReadGuard<'_, ChannelState>> {
        self.state.try_read()
    }

    pub(crate) fn write(&self) -> ChannelWriteGuard<'_> {
        let state = self.state.write();
        let entry = state.kind();
        ChannelWriteGuard {
            channel: self,
            state,
            entry,
        }
    }

    /// Snapshot of the state tag.
    pub fn kind(&self) -> ChannelKind {
        self.state.read().kind()
    }

    pub fn notify_vcpu(&self) -> VcpuId {
        VcpuId::new(self.notify_vcpu.load(Ordering::Acquire))
    }

    pub(crate) fn set_notify_vcpu(&self, vcpu: VcpuId) {
        self.notify_vcpu.store(vcpu.as_u32(), Ordering::Release);
    }

    pub fn consumer(&self) -> Option<ConsumerTag> {
        ConsumerTag::from_raw(self.consumer.load(Ordering::Acquire))
    }

    pub fn is_internal(&self) -> bool {
        self.consumer.load(Ordering::Acquire) != 0
    }

    pub(crate) fn set_consumer(&self, tag: Option<ConsumerTag>) {
        let raw = tag.map_or(0, ConsumerTag::as_raw);
        self.consumer.store(raw, Ordering::Release);
    }

    pub fn flags(&self) -> ChannelFlags {
        ChannelFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_pending(&self) -> bool {
        self.flags().contains(ChannelFlags::PENDING)
    }

    pub fn is_masked(&self) -> bool {
        self.flags().contains(ChannelFlags::MASKED)
    }

    /// Set the pending bit, returns the flags as they were before.
    pub(crate) fn test_and_set_pending(&self) -> ChannelFlags {
        let old = self
            .flags
            .fetch_or(ChannelFlags::PENDING.bits(), Ordering::AcqRel);
        ChannelFlags::from_bits_truncate(old)
    }

    pub(crate) fn clear_pending(&self) {
        self.flags
            .fetch_and(!ChannelFlags::PENDING.bits(), Ordering::AcqRel);
    }

    pub(crate) fn set_masked(&self) {
        self.flags
            .fetch_or(ChannelFlags::MASKED.bits(), Ordering::AcqRel);
    }

    /// Clear the mask bit, returns the flags as they were before.
    pub(crate) fn test_and_clear_masked(&self) -> ChannelFlags {
        let old = self
            .flags
            .fetch_and(!ChannelFlags::MASKED.bits(), Ordering::AcqRel);
        ChannelFlags::from_bits_truncate(old)
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Relaxed)
    }

    pub(crate) fn set_priority(&self, priority: u8) {
        self.priority.store(priority, Ordering::Relaxed);
    }
}

// —————————————————————————————— Write Guard ——————————————————————————————— //

/// Exclusive access to a channel state.
///
/// Every exclusive critical section must either start or end with the channel `Free` or
/// `Unbound`. Dropping a guard that did neither means a transition skipped the lock somewhere.
pub(crate) struct ChannelWriteGuard<'a> {
    channel: &'a Channel,
    state: RwLockWriteGuard<'a, ChannelState>,
    entry: ChannelKind,
}

impl<'a> ChannelWriteGuard<'a> {
    /// Return the channel to `Free`, dropping any per-binding metadata.
    ///
    /// Returns whether the channel belonged to a hypervisor-internal consumer.
    pub fn release(&mut self) -> bool {
        let was_internal = self.channel.is_internal();
        *self.state = ChannelState::Free;
        self.channel.set_notify_vcpu(VcpuId::BOOT);
        self.channel.set_consumer(None);
        self.channel.clear_pending();
        was_internal
    }

    pub fn channel(&self) -> &'a Channel {
        self.channel
    }
}

impl<'a> Deref for ChannelWriteGuard<'a> {
    type Target = ChannelState;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl<'a> DerefMut for ChannelWriteGuard<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state
    }
}

impl<'a> Drop for ChannelWriteGuard<'a> {
    fn drop(&mut self) {
        let exit = self.state.kind();
        debug_assert!(
            self.entry.is_free_or_unbound() || exit.is_free_or_unbound(),
            "Channel lock discipline violated: {:?} -> {:?}",
            self.entry,
            exit
        );
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_bits() {
        let chn = Channel::new();
        assert!(!chn.is_pending());
        assert!(!chn.test_and_set_pending().contains(ChannelFlags::PENDING));
        assert!(chn.test_and_set_pending().contains(ChannelFlags::PENDING));
        chn.set_masked();
        assert!(chn.is_masked() && chn.is_pending());
        assert!(chn.test_and_clear_masked().contains(ChannelFlags::MASKED));
        assert!(!chn.is_masked());
        chn.clear_pending();
        assert_eq!(chn.flags(), ChannelFlags::empty());
    }

    #[test]
    fn release_resets_metadata() {
        let chn = Channel::new();
        {
            let mut guard = chn.write();
            *guard = ChannelState::Unbound {
                remote: DomainId::new(1),
            };
        }
        chn.set_notify_vcpu(VcpuId::new(3));
        chn.test_and_set_pending();
        {
            let mut guard = chn.write();
            assert!(!guard.release());
        }
        assert_eq!(chn.kind(), ChannelKind::Free);
        assert_eq!(chn.notify_vcpu(), VcpuId::BOOT);
        assert!(!chn.is_pending());
        assert!(chn.consumer().is_none());
    }

    #[test]
    #[cfg(debug_assertions)]
    fn lock_discipline_is_checked() {
        let result = std::panic::catch_unwind(|| {
            let chn = Channel::new();
            {
                let mut guard = chn.write();
                *guard = ChannelState::Ipi;
            }
            // Ipi -> Virq without passing through Free.
            let mut guard = chn.write();
            *guard = ChannelState::Virq { virq: Virq::TIMER };
        });
        assert!(result.is_err());
    }
}
