//! Identifiers used across the event-channel engine.

use core::fmt;

use crate::config::NR_VIRQS;

// ——————————————————————————————— Domain IDs ——————————————————————————————— //

/// A domain identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(u16);

impl DomainId {
    /// Alias accepted by the operation surface for "the calling domain".
    pub const SELF: DomainId = DomainId(0x7ff0);

    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Replaces the `SELF` alias by the caller.
    pub fn resolve(self, caller: DomainId) -> DomainId {
        if self == Self::SELF {
            caller
        } else {
            self
        }
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

// —————————————————————————————————— Ports ————————————————————————————————— //

/// A domain-local event-channel port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Port(u32);

impl Port {
    /// The reserved port, never handed out to guests.
    pub const RESERVED: Port = Port(0);

    pub const fn new(port: u32) -> Self {
        Self(port)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ————————————————————————————————— vCPUs —————————————————————————————————— //

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VcpuId(u32);

impl VcpuId {
    pub const BOOT: VcpuId = VcpuId(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VcpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// —————————————————————————————————— VIRQs ————————————————————————————————— //

/// A virtual interrupt line.
///
/// Local VIRQs exist once per vCPU, global VIRQs once per domain and are always bound on vCPU 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Virq(u32);

#[rustfmt::skip]
impl Virq {
    pub const TIMER:      Virq = Virq(0);
    pub const DEBUG:      Virq = Virq(1);
    pub const CONSOLE:    Virq = Virq(2);
    pub const DOM_EXC:    Virq = Virq(3);
    pub const TBUF:       Virq = Virq(4);
    pub const DEBUGGER:   Virq = Virq(6);
    pub const XENOPROF:   Virq = Virq(7);
    pub const CON_RING:   Virq = Virq(8);
    pub const PCPU_STATE: Virq = Virq(9);
    pub const MEM_EVENT:  Virq = Virq(10);
    pub const ARGO:       Virq = Virq(11);
    pub const ENOMEM:     Virq = Virq(12);
    pub const XENPMU:     Virq = Virq(13);
    /// First architecture-specific VIRQ, all of them are per-vCPU.
    pub const ARCH_0:     Virq = Virq(16);
}

impl Virq {
    pub const fn new(virq: u32) -> Self {
        Self(virq)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < NR_VIRQS
    }

    /// Whether a single instance exists per domain rather than one per vCPU.
    pub fn is_global(self) -> bool {
        match self {
            Self::TIMER | Self::DEBUG | Self::XENOPROF | Self::XENPMU => false,
            v if v.0 >= Self::ARCH_0.0 => false,
            _ => true,
        }
    }
}

impl fmt::Display for Virq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "virq {}", self.0)
    }
}

// —————————————————————————————————— PIRQs ————————————————————————————————— //

/// A physical interrupt line as numbered inside its domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pirq(u32);

impl Pirq {
    pub const fn new(pirq: u32) -> Self {
        Self(pirq)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pirq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pirq {}", self.0)
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virq_scope() {
        assert!(!Virq::TIMER.is_global());
        assert!(!Virq::DEBUG.is_global());
        assert!(!Virq::XENPMU.is_global());
        assert!(!Virq::new(20).is_global());
        assert!(Virq::CONSOLE.is_global());
        assert!(Virq::DOM_EXC.is_global());
        assert!(!Virq::new(NR_VIRQS as u32).is_valid());
    }

    #[test]
    fn self_alias() {
        let caller = DomainId::new(3);
        assert_eq!(DomainId::SELF.resolve(caller), caller);
        assert_eq!(DomainId::new(7).resolve(caller), DomainId::new(7));
    }
}
