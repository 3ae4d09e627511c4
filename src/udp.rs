//! UDP flow engine (spec §4.6): per-5-tuple pseudo-connection table with
//! pre-dial datagram buffering and idle eviction.

use crate::registry::InterceptHandle;
use smoltcp::iface::SocketHandle;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpFlowId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpState {
    DialPending,
    Active,
    Closed,
}

/// Identifies a pseudo-connection: source/destination pair plus protocol is
/// implicit (this table only ever holds UDP flows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub client_endpoint: SocketAddr,
    pub intercepted_endpoint: SocketAddr,
}

pub struct UdpFlow {
    pub id: UdpFlowId,
    pub socket_handle: SocketHandle,
    pub intercept: InterceptHandle,
    pub service_name: String,
    pub tuple: FiveTuple,
    pub overlay_handle: Option<crate::overlay::OverlayHandle>,
    pub state: UdpState,
    /// Datagrams received before the dial completed (spec §4.6, §8 invariant
    /// 7, scenario S4). Boundaries are preserved — one `Vec<u8>` per datagram.
    pending_datagrams: Vec<Vec<u8>>,
    pub idle_timeout: Duration,
    pub idle_deadline: Instant,
}

impl UdpFlow {
    fn new(
        id: UdpFlowId,
        socket_handle: SocketHandle,
        intercept: InterceptHandle,
        service_name: String,
        tuple: FiveTuple,
        idle_timeout: Duration,
        now: Instant,
    ) -> Self {
        UdpFlow {
            id,
            socket_handle,
            intercept,
            service_name,
            tuple,
            overlay_handle: None,
            state: UdpState::DialPending,
            pending_datagrams: Vec::new(),
            idle_timeout,
            idle_deadline: now + idle_timeout,
        }
    }

    /// Buffer a datagram arriving while the dial is still in flight.
    pub fn buffer(&mut self, datagram: Vec<u8>) {
        debug_assert_eq!(self.state, UdpState::DialPending);
        self.pending_datagrams.push(datagram);
    }

    /// `dial_completed(true)`: return the buffered datagrams, in arrival
    /// order, for replay to the overlay (spec §4.6).
    pub fn dial_succeeded(&mut self, overlay_handle: crate::overlay::OverlayHandle) -> Vec<Vec<u8>> {
        self.overlay_handle = Some(overlay_handle);
        self.state = UdpState::Active;
        std::mem::take(&mut self.pending_datagrams)
    }

    /// `dial_completed(false)`: flow dies, buffered datagrams are dropped.
    pub fn dial_failed(&mut self) {
        self.pending_datagrams.clear();
        self.state = UdpState::Closed;
    }

    pub fn close(&mut self) {
        self.state = UdpState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == UdpState::Closed
    }

    pub fn touch(&mut self, now: Instant) {
        self.idle_deadline = now + self.idle_timeout;
    }

    pub fn is_idle_expired(&self, now: Instant) -> bool {
        now >= self.idle_deadline
    }
}

#[derive(Default)]
pub struct UdpEngine {
    flows: HashMap<UdpFlowId, UdpFlow>,
    by_tuple: HashMap<FiveTuple, UdpFlowId>,
    next_id: u64,
}

impl UdpEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, tuple: &FiveTuple) -> Option<&UdpFlow> {
        self.by_tuple.get(tuple).and_then(|id| self.flows.get(id))
    }

    pub fn create(
        &mut self,
        socket_handle: SocketHandle,
        intercept: InterceptHandle,
        service_name: String,
        tuple: FiveTuple,
        idle_timeout: Duration,
        now: Instant,
    ) -> UdpFlowId {
        self.next_id += 1;
        let id = UdpFlowId(self.next_id);
        self.flows.insert(
            id,
            UdpFlow::new(id, socket_handle, intercept, service_name, tuple, idle_timeout, now),
        );
        self.by_tuple.insert(tuple, id);
        id
    }

    pub fn get(&self, id: UdpFlowId) -> Option<&UdpFlow> {
        self.flows.get(&id)
    }

    pub fn get_mut(&mut self, id: UdpFlowId) -> Option<&mut UdpFlow> {
        self.flows.get_mut(&id)
    }

    pub fn remove(&mut self, id: UdpFlowId) -> Option<UdpFlow> {
        let flow = self.flows.remove(&id)?;
        self.by_tuple.remove(&flow.tuple);
        Some(flow)
    }

    pub fn active(&self, intercept: InterceptHandle) -> impl Iterator<Item = &UdpFlow> {
        self.flows.values().filter(move |f| f.intercept == intercept)
    }

    pub fn active_ids(&self, intercept: InterceptHandle) -> Vec<UdpFlowId> {
        self.active(intercept).map(|f| f.id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UdpFlow> {
        self.flows.values()
    }

    pub fn expired(&self, now: Instant) -> Vec<UdpFlowId> {
        self.flows
            .values()
            .filter(|f| f.is_idle_expired(now))
            .map(|f| f.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::OverlayHandle;

    fn fake_handle() -> SocketHandle {
        let mut set = smoltcp::iface::SocketSet::new(vec![]);
        let rx = smoltcp::socket::udp::PacketBuffer::new(
            vec![smoltcp::socket::udp::PacketMetadata::EMPTY; 4],
            vec![0; 256],
        );
        let tx = smoltcp::socket::udp::PacketBuffer::new(
            vec![smoltcp::socket::udp::PacketMetadata::EMPTY; 4],
            vec![0; 256],
        );
        set.add(smoltcp::socket::udp::Socket::new(rx, tx))
    }

    fn fake_intercept() -> InterceptHandle {
        let mut reg = crate::registry::InterceptRegistry::new();
        reg.add(crate::registry::InterceptSpec {
            service_name: "svc".into(),
            protocols: std::collections::HashSet::from([crate::addr::Protocol::Udp]),
            addresses: vec![crate::addr::parse_address("10.0.1.1/32").unwrap()],
            port_ranges: vec![crate::addr::parse_port_range(53, 53)],
        })
        .unwrap()
    }

    fn tuple() -> FiveTuple {
        FiveTuple {
            client_endpoint: "192.0.2.9:4000".parse().unwrap(),
            intercepted_endpoint: "10.0.1.1:53".parse().unwrap(),
        }
    }

    #[test]
    fn buffered_first_datagram_replays_on_dial_success_s4() {
        let mut engine = UdpEngine::new();
        let now = Instant::now();
        let id = engine.create(fake_handle(), fake_intercept(), "A".into(), tuple(), Duration::from_secs(60), now);
        let flow = engine.get_mut(id).unwrap();
        flow.buffer(vec![7u8; 50]);
        let replayed = flow.dial_succeeded(OverlayHandle(1));
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].len(), 50);
    }

    #[test]
    fn dial_failure_drops_buffered_datagrams() {
        let mut engine = UdpEngine::new();
        let now = Instant::now();
        let id = engine.create(fake_handle(), fake_intercept(), "A".into(), tuple(), Duration::from_secs(60), now);
        let flow = engine.get_mut(id).unwrap();
        flow.buffer(vec![1, 2, 3]);
        flow.dial_failed();
        assert!(flow.is_closed());
    }

    #[test]
    fn lookup_by_five_tuple() {
        let mut engine = UdpEngine::new();
        let now = Instant::now();
        let t = tuple();
        let id = engine.create(fake_handle(), fake_intercept(), "A".into(), t, Duration::from_secs(60), now);
        assert_eq!(engine.lookup(&t).unwrap().id, id);
    }

    #[test]
    fn idle_eviction_after_deadline() {
        let mut engine = UdpEngine::new();
        let now = Instant::now();
        engine.create(fake_handle(), fake_intercept(), "A".into(), tuple(), Duration::from_secs(10), now);
        assert!(engine.expired(now).is_empty());
        assert_eq!(engine.expired(now + Duration::from_secs(11)).len(), 1);
    }
}
