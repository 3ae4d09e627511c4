//! TCP flow engine (spec §4.5): per-connection state machine, half-close
//! bookkeeping, and the write/ack ledger that implements the backpressure
//! link between the embedded stack's receive window and the overlay.

use crate::registry::InterceptHandle;
use smoltcp::iface::SocketHandle;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listening,
    DialPending,
    Established,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// One outstanding chunk handed to the overlay, awaiting `ack` before the
/// receive window can grow (spec §4.5 `write_ctx`).
struct PendingWrite {
    ctx: u64,
    len: usize,
}

pub struct TcpFlow {
    pub id: FlowId,
    pub socket_handle: SocketHandle,
    pub intercept: InterceptHandle,
    pub service_name: String,
    pub client_endpoint: SocketAddr,
    pub intercepted_endpoint: SocketAddr,
    pub overlay_handle: Option<crate::overlay::OverlayHandle>,
    pub state: TcpState,
    pub idle_timeout: Option<Duration>,
    pub idle_deadline: Option<Instant>,
    pending_writes: VecDeque<PendingWrite>,
    next_write_ctx: u64,
}

impl TcpFlow {
    fn new(
        id: FlowId,
        socket_handle: SocketHandle,
        intercept: InterceptHandle,
        service_name: String,
        client_endpoint: SocketAddr,
        intercepted_endpoint: SocketAddr,
    ) -> Self {
        TcpFlow {
            id,
            socket_handle,
            intercept,
            service_name,
            client_endpoint,
            intercepted_endpoint,
            overlay_handle: None,
            state: TcpState::Listening,
            idle_timeout: None,
            idle_deadline: None,
            pending_writes: VecDeque::new(),
            next_write_ctx: 1,
        }
    }

    pub fn mark_dial_pending(&mut self) {
        debug_assert_eq!(self.state, TcpState::Listening);
        self.state = TcpState::DialPending;
    }

    /// `dial_completed(true)`: move to `Established` and remember the handle
    /// the bridge will use for subsequent overlay calls (spec §4.5).
    pub fn dial_succeeded(&mut self, overlay_handle: crate::overlay::OverlayHandle) {
        debug_assert_eq!(self.state, TcpState::DialPending);
        self.overlay_handle = Some(overlay_handle);
        self.state = TcpState::Established;
    }

    /// `dial_completed(false)`: the flow dies without ever reaching the
    /// overlay (spec §8 invariant 7's TCP analogue, scenario S2).
    pub fn dial_failed(&mut self) {
        debug_assert_eq!(self.state, TcpState::DialPending);
        self.state = TcpState::Closed;
    }

    /// Record that `len` peeked-but-not-yet-dequeued bytes were handed to
    /// the overlay. Returns the `write_ctx` the caller must present to
    /// [`TcpFlow::ack`] later.
    pub fn record_pending_write(&mut self, len: usize) -> u64 {
        let ctx = self.next_write_ctx;
        self.next_write_ctx += 1;
        self.pending_writes.push_back(PendingWrite { ctx, len });
        ctx
    }

    /// `ack(write_ctx)`: confirm the oldest outstanding write and return how
    /// many bytes the caller should now dequeue from the socket's receive
    /// buffer to re-open the window by exactly that count (spec §4.5, §8
    /// invariant 5). Acks must arrive in the order writes occurred; a
    /// mismatched `ctx` is a caller bug and is rejected.
    pub fn ack(&mut self, ctx: u64) -> Option<usize> {
        let front = self.pending_writes.front()?;
        if front.ctx != ctx {
            return None;
        }
        self.pending_writes.pop_front().map(|w| w.len)
    }

    pub fn pending_ack_bytes(&self) -> usize {
        self.pending_writes.iter().map(|w| w.len).sum()
    }

    /// Overlay EOF: emit FIN, `Established -> HalfClosedRemote` (spec §4.5).
    pub fn overlay_eof(&mut self) {
        self.state = match self.state {
            TcpState::Established => TcpState::HalfClosedRemote,
            TcpState::HalfClosedLocal => TcpState::Closed,
            other => other,
        };
    }

    /// Peer FIN observed by the stack: `Established -> HalfClosedLocal`.
    pub fn peer_fin(&mut self) {
        self.state = match self.state {
            TcpState::Established => TcpState::HalfClosedLocal,
            TcpState::HalfClosedRemote => TcpState::Closed,
            other => other,
        };
    }

    /// Peer RST, local error, or forced teardown: immediately `Closed`.
    pub fn reset(&mut self) {
        self.state = TcpState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == TcpState::Closed
    }

    pub fn touch(&mut self, now: Instant) {
        if let Some(timeout) = self.idle_timeout {
            self.idle_deadline = Some(now + timeout);
        }
    }

    pub fn is_idle_expired(&self, now: Instant) -> bool {
        matches!(self.idle_deadline, Some(deadline) if now >= deadline)
    }
}

/// Container for live TCP flows, keyed by opaque [`FlowId`] (spec §3
/// `TcpFlow`, never addressed by raw pointer or stack handle alone).
#[derive(Default)]
pub struct TcpEngine {
    flows: HashMap<FlowId, TcpFlow>,
    next_id: u64,
}

impl TcpEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        socket_handle: SocketHandle,
        intercept: InterceptHandle,
        service_name: String,
        client_endpoint: SocketAddr,
        intercepted_endpoint: SocketAddr,
    ) -> FlowId {
        self.next_id += 1;
        let id = FlowId(self.next_id);
        self.flows.insert(
            id,
            TcpFlow::new(
                id,
                socket_handle,
                intercept,
                service_name,
                client_endpoint,
                intercepted_endpoint,
            ),
        );
        id
    }

    pub fn get(&self, id: FlowId) -> Option<&TcpFlow> {
        self.flows.get(&id)
    }

    pub fn get_mut(&mut self, id: FlowId) -> Option<&mut TcpFlow> {
        self.flows.get_mut(&id)
    }

    pub fn remove(&mut self, id: FlowId) -> Option<TcpFlow> {
        self.flows.remove(&id)
    }

    /// Flows bound to `intercept`, used by mass teardown (spec §4.7
    /// `kill_active`, §8 invariant 8).
    pub fn active(&self, intercept: InterceptHandle) -> impl Iterator<Item = &TcpFlow> {
        self.flows.values().filter(move |f| f.intercept == intercept)
    }

    pub fn active_ids(&self, intercept: InterceptHandle) -> Vec<FlowId> {
        self.active(intercept).map(|f| f.id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TcpFlow> {
        self.flows.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TcpFlow> {
        self.flows.values_mut()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
