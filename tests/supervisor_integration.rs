//! Integration tests exercising the public supervisor API end to end
//! against fake overlay/device collaborators (spec §8 scenarios S5/S6).

use async_trait::async_trait;
use smoltcp::wire::IpCidr;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tunnel_core::overlay::{DialOutcome, FlowInfo, HostHandle, IngressMode, Overlay, OverlayHandle, TunDevice};
use tunnel_core::registry::InterceptSpec;
use tunnel_core::{addr, TunnelConfig, TunnelCore};

struct RecordingOverlay {
    close_calls: AtomicUsize,
}

#[async_trait]
impl Overlay for RecordingOverlay {
    async fn dial(&self, _intercept: tunnel_core::InterceptHandle, _info: FlowInfo) -> DialOutcome {
        DialOutcome::Ok(OverlayHandle(1))
    }

    async fn write(&self, _handle: OverlayHandle, bytes: &[u8]) -> std::io::Result<usize> {
        Ok(bytes.len())
    }

    async fn close(&self, _handle: OverlayHandle) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn close_write(&self, _handle: OverlayHandle) {}

    fn host(&self, _service_name: &str) -> HostHandle {
        HostHandle(Box::new(()))
    }
}

struct RecordingDevice {
    routes_added: AtomicUsize,
    local_addresses: AtomicUsize,
}

#[async_trait]
impl TunDevice for RecordingDevice {
    fn ingress_mode(&self) -> IngressMode {
        IngressMode::Driven
    }

    async fn write(&self, _frame: &[u8]) -> std::io::Result<()> {
        Ok(())
    }

    async fn add_local_address(&self, _ip: IpAddr) -> std::io::Result<()> {
        self.local_addresses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_local_address(&self, _ip: IpAddr) -> std::io::Result<()> {
        self.local_addresses.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_route(&self, _address: addr::Address) -> std::io::Result<()> {
        self.routes_added.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn local_addrs() -> Vec<IpCidr> {
    vec![IpCidr::new(smoltcp::wire::IpAddress::v4(10, 0, 0, 1), 24)]
}

#[tokio::test]
async fn intercept_installs_routes_and_stop_intercepting_removes_entry() {
    let overlay = Arc::new(RecordingOverlay {
        close_calls: AtomicUsize::new(0),
    });
    let device = Arc::new(RecordingDevice {
        routes_added: AtomicUsize::new(0),
        local_addresses: AtomicUsize::new(0),
    });
    let mut core = TunnelCore::init(TunnelConfig::default(), overlay, device.clone(), local_addrs()).unwrap();

    let spec = InterceptSpec {
        service_name: "A".into(),
        protocols: HashSet::from([addr::Protocol::Tcp]),
        addresses: vec![addr::parse_address("10.0.0.0/24").unwrap()],
        port_ranges: vec![addr::parse_port_range(80, 80)],
    };
    let handle = core.intercept(spec).await.unwrap();
    assert_eq!(device.routes_added.load(Ordering::SeqCst), 1);
    assert!(core.registry().find_by_handle(handle).is_some());

    core.stop_intercepting(handle).await.unwrap();
    assert!(core.registry().find_by_handle(handle).is_none());
}

#[tokio::test]
async fn local_address_refcount_matches_invariant4() {
    let overlay = Arc::new(RecordingOverlay {
        close_calls: AtomicUsize::new(0),
    });
    let device = Arc::new(RecordingDevice {
        routes_added: AtomicUsize::new(0),
        local_addresses: AtomicUsize::new(0),
    });
    let mut core = TunnelCore::init(TunnelConfig::default(), overlay, device.clone(), local_addrs()).unwrap();

    let ip: IpAddr = "10.0.0.7".parse().unwrap();
    core.add_local_address(ip).await.unwrap();
    core.add_local_address(ip).await.unwrap();
    assert_eq!(device.local_addresses.load(Ordering::SeqCst), 1);

    core.delete_local_address(ip).await.unwrap();
    assert_eq!(device.local_addresses.load(Ordering::SeqCst), 1);
    core.delete_local_address(ip).await.unwrap();
    assert_eq!(device.local_addresses.load(Ordering::SeqCst), 0);
}
