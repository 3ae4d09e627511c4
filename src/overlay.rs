//! External collaborator interfaces (spec §6): the overlay transport and the
//! TUN/UTAP device driver. Both are out of scope to implement — this module
//! only defines the traits the core drives.

use crate::registry::InterceptHandle;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::os::fd::RawFd;

/// Opaque handle the bridge hands to the overlay; the overlay passes it back
/// on every subsequent call (spec §9: never a raw pointer/borrow).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OverlayHandle(pub u64);

/// Context passed to [`Overlay::dial`] describing the flow being bridged.
#[derive(Debug, Clone)]
pub struct FlowInfo {
    pub service_name: String,
    pub client_endpoint: SocketAddr,
    pub intercepted_endpoint: SocketAddr,
}

/// Result of an asynchronous dial (spec §4.5/§4.6).
pub enum DialOutcome {
    Ok(OverlayHandle),
    Failed,
}

/// The external overlay transport (spec §6 callback set). Implemented as an
/// async trait so dial completion is delivered through the future itself
/// rather than a raw callback held across a suspension point (spec §9).
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Begin dialing the overlay service for `info`. Resolves to
    /// [`DialOutcome::Ok`] with the handle the bridge will use for this flow,
    /// or [`DialOutcome::Failed`].
    async fn dial(&self, intercept: InterceptHandle, info: FlowInfo) -> DialOutcome;

    /// Deliver bytes for the client-bound direction. Returns bytes accepted,
    /// which may be less than `bytes.len()` (spec §4.5 "synchronous-returning-partial").
    async fn write(&self, handle: OverlayHandle, bytes: &[u8]) -> std::io::Result<usize>;

    /// Hard close: both halves go away.
    async fn close(&self, handle: OverlayHandle);

    /// Half-close toward the client (peer FIN was observed).
    async fn close_write(&self, handle: OverlayHandle);

    /// Reverse-direction hosting; opaque to the core (spec §6 `host`).
    fn host(&self, service_name: &str) -> HostHandle;
}

/// Opaque result of [`Overlay::host`]; the core never inspects it.
pub struct HostHandle(pub Box<dyn std::any::Any + Send + Sync>);

/// How the device driver delivers inbound frames to the core (spec §4.8:
/// "exactly one of these two ingestion modes must be used").
pub enum IngressMode {
    /// The driver owns ingestion and calls `on_frame`/`on_rawsock_frame`
    /// itself (spec §6 `setup`).
    Driven,
    /// The core polls readability on this fd and pulls frames itself
    /// (spec §6 `uv_poll_init`).
    Polled(RawFd),
}

/// The TUN/UTAP device driver (spec §6). Platform-specific packet read/write
/// and route/address manipulation are out of scope; this is the seam.
#[async_trait]
pub trait TunDevice: Send + Sync {
    fn ingress_mode(&self) -> IngressMode;

    /// Transmit one frame the embedded stack produced.
    async fn write(&self, frame: &[u8]) -> std::io::Result<()>;

    async fn add_local_address(&self, ip: std::net::IpAddr) -> std::io::Result<()>;
    async fn delete_local_address(&self, ip: std::net::IpAddr) -> std::io::Result<()>;

    async fn add_route(&self, address: crate::addr::Address) -> std::io::Result<()>;

    /// Optional (spec §6: "`exclude_rt` is optional").
    async fn exclude_route(&self, _dst: std::net::IpAddr) -> std::io::Result<()> {
        Ok(())
    }
}
