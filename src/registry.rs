//! Intercept registry (spec §4.2) and the active-flow index used for mass
//! teardown (spec §4.7).

use crate::addr::{address_match, port_in_any, Address, PortRange, Protocol};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque handle identifying one `intercept()` registration. Flows reference
/// their originating intercept only by this handle, resolved by lookup
/// (spec §9: "weak back-references ... as an opaque identifier").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptHandle(u64);

static NEXT_INTERCEPT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl InterceptHandle {
    fn next() -> Self {
        InterceptHandle(NEXT_INTERCEPT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

/// A registered interception rule (spec §3 `InterceptEntry`).
pub struct InterceptEntry {
    pub handle: InterceptHandle,
    pub service_name: String,
    pub protocols: HashSet<Protocol>,
    pub addresses: Vec<Address>,
    pub port_ranges: Vec<PortRange>,
}

/// Everything needed to register one service (spec §3). Invariants enforced
/// by [`InterceptRegistry::add`]: protocols/addresses/port_ranges non-empty.
pub struct InterceptSpec {
    pub service_name: String,
    pub protocols: HashSet<Protocol>,
    pub addresses: Vec<Address>,
    pub port_ranges: Vec<PortRange>,
}

/// Ordered catalogue of intercepts. Lookup is insertion order; first match
/// wins (spec invariant #1).
#[derive(Default)]
pub struct InterceptRegistry {
    entries: Vec<InterceptEntry>,
}

impl InterceptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new intercept. No conflict detection against existing
    /// entries is performed; a later, shadowing entry simply never wins a
    /// `match` while the earlier one still exists (spec §4.2).
    pub fn add(&mut self, spec: InterceptSpec) -> crate::error::Result<InterceptHandle> {
        if spec.protocols.is_empty() || spec.addresses.is_empty() || spec.port_ranges.is_empty() {
            return Err(crate::error::TunnelError::Config(format!(
                "intercept for service '{}' must have at least one protocol, address and port range",
                spec.service_name
            )));
        }
        let handle = InterceptHandle::next();
        self.entries.push(InterceptEntry {
            handle,
            service_name: spec.service_name,
            protocols: spec.protocols,
            addresses: spec.addresses,
            port_ranges: spec.port_ranges,
        });
        Ok(handle)
    }

    /// Remove and return the entry registered under `handle`, if any.
    pub fn remove(&mut self, handle: InterceptHandle) -> Option<InterceptEntry> {
        let idx = self.entries.iter().position(|e| e.handle == handle)?;
        Some(self.entries.remove(idx))
    }

    pub fn find_by_handle(&self, handle: InterceptHandle) -> Option<&InterceptEntry> {
        self.entries.iter().find(|e| e.handle == handle)
    }

    /// First entry (in insertion order) whose protocol/address/port all
    /// match (spec §4.2, invariant #1).
    pub fn matching(&self, proto: Protocol, ip: IpAddr, port: u16) -> Option<&InterceptEntry> {
        self.entries.iter().find(|e| {
            e.protocols.contains(&proto)
                && address_match(ip, &e.addresses)
                && port_in_any(port, &e.port_ranges)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &InterceptEntry> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::parse_address;

    fn spec(name: &str, proto: Protocol, addr: &str, low: u16, high: u16) -> InterceptSpec {
        InterceptSpec {
            service_name: name.to_string(),
            protocols: HashSet::from([proto]),
            addresses: vec![parse_address(addr).unwrap()],
            port_ranges: vec![crate::addr::parse_port_range(low, high)],
        }
    }

    #[test]
    fn first_match_wins() {
        let mut reg = InterceptRegistry::new();
        let a = reg
            .add(spec("a", Protocol::Tcp, "10.0.0.0/24", 80, 80))
            .unwrap();
        reg.add(spec("b", Protocol::Tcp, "10.0.0.0/16", 80, 80))
            .unwrap();

        let hit = reg
            .matching(Protocol::Tcp, "10.0.0.7".parse().unwrap(), 80)
            .unwrap();
        assert_eq!(hit.handle, a);
    }

    #[test]
    fn remove_drops_entry() {
        let mut reg = InterceptRegistry::new();
        let h = reg
            .add(spec("a", Protocol::Tcp, "10.0.0.0/24", 80, 80))
            .unwrap();
        assert!(reg.remove(h).is_some());
        assert!(reg
            .matching(Protocol::Tcp, "10.0.0.7".parse().unwrap(), 80)
            .is_none());
    }

    #[test]
    fn rejects_empty_protocols() {
        let mut reg = InterceptRegistry::new();
        let spec = InterceptSpec {
            service_name: "a".into(),
            protocols: HashSet::new(),
            addresses: vec![parse_address("10.0.0.0/24").unwrap()],
            port_ranges: vec![crate::addr::parse_port_range(80, 80)],
        };
        assert!(reg.add(spec).is_err());
    }
}
