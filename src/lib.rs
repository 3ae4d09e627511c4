//! Userspace network tunneler core: intercept registry, embedded TCP/UDP
//! stack, flow lifecycle/bridge to an external overlay transport, and the
//! raw-socket shadow forwarder for spoofed local addresses.

pub mod addr;
pub mod bridge;
pub mod config;
pub mod error;
pub mod overlay;
pub mod rawsock;
pub mod registry;
pub mod stack;
pub mod supervisor;
pub mod tcp;
pub mod udp;

pub use bridge::Bridge;
pub use config::TunnelConfig;
pub use error::{Result, TunnelError};
pub use overlay::{FlowInfo, HostHandle, IngressMode, Overlay, OverlayHandle, TunDevice};
pub use registry::{InterceptEntry, InterceptHandle, InterceptRegistry, InterceptSpec};
pub use supervisor::{FlowRef, TunnelCore};
