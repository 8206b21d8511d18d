//! Port Table
//!
//! A sparse two-level table: a fixed array of groups, each group an array of bucket slots, each
//! bucket a fixed array of channels. Groups and buckets are published once, on first use, and
//! are only released when the whole table is torn down.
//!
//! Readers never take a lock: a port is valid iff it is below `valid_ports`, and `valid_ports` is
//! only advanced after the bucket holding the port has been published.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Once;

use crate::channel::Channel;
use crate::config::{BUCKETS_PER_GROUP, MAX_PORTS, NR_GROUPS, PORTS_PER_BUCKET, PORTS_PER_GROUP};
use crate::ids::Port;
use crate::EvtchnError;

type Bucket = Box<[Channel]>;
type Group = Box<[Once<Bucket>]>;

pub struct PortTable {
    groups: [Once<Group>; NR_GROUPS],
    /// Number of ports backed by a published bucket, always a multiple of the bucket size.
    valid_ports: AtomicU32,
}

impl PortTable {
    pub const fn new() -> Self {
        const EMPTY_GROUP: Once<Group> = Once::new();

        Self {
            groups: [EMPTY_GROUP; NR_GROUPS],
            valid_ports: AtomicU32::new(0),
        }
    }

    pub fn valid_ports(&self) -> u32 {
        self.valid_ports.load(Ordering::Acquire)
    }

    pub fn is_valid(&self, port: Port) -> bool {
        port.as_u32() < self.valid_ports()
    }

    /// Lock-free lookup of a valid port.
    pub fn get(&self, port: Port) -> Option<&Channel> {
        if !self.is_valid(port) {
            return None;
        }
        Some(self.slot(port))
    }

    fn slot(&self, port: Port) -> &Channel {
        let idx = port.as_usize();
        let bucket = self.groups[idx / PORTS_PER_GROUP]
            .get()
            .and_then(|group| group[(idx % PORTS_PER_GROUP) / PORTS_PER_BUCKET].get());
        match bucket {
            Some(bucket) => &bucket[idx % PORTS_PER_BUCKET],
            None => panic!("Port {} is below the valid bound but has no bucket", port),
        }
    }

    /// Publish every bucket up to and including the one holding `port`.
    ///
    /// Must be called with the owning domain's event lock held, so that only one grower exists.
    pub(crate) fn grow_to(&self, port: Port) -> Result<(), EvtchnError> {
        if port.as_usize() >= MAX_PORTS {
            return Err(EvtchnError::NoSpace);
        }

        let mut valid = self.valid_ports();
        while valid <= port.as_u32() {
            let idx = valid as usize;
            let group = self.groups[idx / PORTS_PER_GROUP].try_call_once(alloc_group)?;
            group[(idx % PORTS_PER_GROUP) / PORTS_PER_BUCKET].try_call_once(alloc_bucket)?;

            valid += PORTS_PER_BUCKET as u32;
            self.valid_ports.store(valid, Ordering::Release);
            log::trace!("Port table grown to {} ports", valid);
        }
        Ok(())
    }

    /// Lower the valid bound, used as the resume cursor while a dying domain is torn down.
    pub(crate) fn shrink_to(&self, valid: u32) {
        debug_assert!(valid <= self.valid_ports());
        self.valid_ports.store(valid, Ordering::Release);
    }

    /// Drop every group and bucket. Requires exclusive access to the table.
    pub(crate) fn release_all(&mut self) {
        *self.valid_ports.get_mut() = 0;
        for group in self.groups.iter_mut() {
            *group = Once::new();
        }
    }

    /// Number of buckets currently allocated, published or not yet below the valid bound.
    pub fn allocated_buckets(&self) -> usize {
        self.groups
            .iter()
            .filter_map(|group| group.get())
            .map(|group| group.iter().filter(|bucket| bucket.get().is_some()).count())
            .sum()
    }
}

// ——————————————————————————————— Allocation ——————————————————————————————— //

fn alloc_group() -> Result<Group, EvtchnError> {
    const EMPTY_BUCKET: Once<Bucket> = Once::new();

    let mut group = Vec::new();
    group
        .try_reserve_exact(BUCKETS_PER_GROUP)
        .map_err(|_| EvtchnError::OutOfMemory)?;
    group.extend((0..BUCKETS_PER_GROUP).map(|_| EMPTY_BUCKET));
    Ok(group.into_boxed_slice())
}

fn alloc_bucket() -> Result<Bucket, EvtchnError> {
    let mut bucket = Vec::new();
    bucket
        .try_reserve_exact(PORTS_PER_BUCKET)
        .map_err(|_| EvtchnError::OutOfMemory)?;
    bucket.extend((0..PORTS_PER_BUCKET).map(|_| Channel::new()));
    Ok(bucket.into_boxed_slice())
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;

    #[test]
    fn lazy_growth() {
        let table = PortTable::new();
        assert_eq!(table.valid_ports(), 0);
        assert!(table.get(Port::new(0)).is_none());

        table.grow_to(Port::new(3)).unwrap();
        assert_eq!(table.valid_ports(), PORTS_PER_BUCKET as u32);
        assert_eq!(table.allocated_buckets(), 1);
        assert_eq!(table.get(Port::new(3)).unwrap().kind(), ChannelKind::Free);
        assert!(table.get(Port::new(PORTS_PER_BUCKET as u32)).is_none());
    }

    #[test]
    fn growth_publishes_intermediate_buckets() {
        let table = PortTable::new();
        let far = Port::new((PORTS_PER_GROUP + 5) as u32);
        table.grow_to(far).unwrap();

        // Every port below the bound must be backed, including the ones we skipped over.
        let valid = table.valid_ports();
        assert_eq!(valid as usize, PORTS_PER_GROUP + PORTS_PER_BUCKET);
        for port in 0..valid {
            assert!(table.get(Port::new(port)).is_some());
        }
        assert_eq!(table.allocated_buckets(), BUCKETS_PER_GROUP + 1);
    }

    #[test]
    fn bounded_by_max_ports() {
        let table = PortTable::new();
        assert_eq!(
            table.grow_to(Port::new(MAX_PORTS as u32)),
            Err(EvtchnError::NoSpace)
        );
        table.grow_to(Port::new(MAX_PORTS as u32 - 1)).unwrap();
        assert_eq!(table.valid_ports() as usize, MAX_PORTS);
    }

    #[test]
    fn release() {
        let mut table = PortTable::new();
        table.grow_to(Port::new(200)).unwrap();
        table.release_all();
        assert_eq!(table.valid_ports(), 0);
        assert_eq!(table.allocated_buckets(), 0);
    }
}
