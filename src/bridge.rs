//! Flow lifecycle / bridge (spec §4.7): dials the overlay, carries dial
//! completion back onto the reactor without holding a raw callback across a
//! suspension point (spec §9), and implements mass teardown.

use crate::overlay::{DialOutcome, FlowInfo, Overlay, OverlayHandle};
use crate::registry::InterceptHandle;
use crate::tcp::{FlowId, TcpEngine};
use crate::udp::{UdpEngine, UdpFlowId};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A completed dial, delivered back onto the reactor loop (spec §5
/// supplement: dial future spawned, result threaded through a channel).
pub enum DialCompletion {
    Tcp(FlowId, DialOutcome),
    Udp(UdpFlowId, DialOutcome),
}

pub struct Bridge {
    pub tcp: TcpEngine,
    pub udp: UdpEngine,
    overlay: Arc<dyn Overlay>,
    completions_tx: mpsc::UnboundedSender<DialCompletion>,
    completions_rx: mpsc::UnboundedReceiver<DialCompletion>,
}

impl Bridge {
    pub fn new(overlay: Arc<dyn Overlay>) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Bridge {
            tcp: TcpEngine::new(),
            udp: UdpEngine::new(),
            overlay,
            completions_tx,
            completions_rx,
        }
    }

    /// Begin an overlay dial for a TCP flow (spec §4.5). The dial runs as a
    /// detached task; its result is picked up by [`Bridge::drain_completions`]
    /// on a later tick.
    pub fn dial_tcp(&self, intercept: InterceptHandle, flow_id: FlowId, info: FlowInfo) {
        let overlay = Arc::clone(&self.overlay);
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let outcome = overlay.dial(intercept, info).await;
            let _ = tx.send(DialCompletion::Tcp(flow_id, outcome));
        });
    }

    /// Begin an overlay dial for a UDP pseudo-connection (spec §4.6).
    pub fn dial_udp(&self, intercept: InterceptHandle, flow_id: UdpFlowId, info: FlowInfo) {
        let overlay = Arc::clone(&self.overlay);
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let outcome = overlay.dial(intercept, info).await;
            let _ = tx.send(DialCompletion::Udp(flow_id, outcome));
        });
    }

    /// Drain every dial completion queued so far; called once per reactor
    /// tick (spec §4.8 `run_once`).
    pub fn drain_completions(&mut self) -> Vec<DialCompletion> {
        let mut out = Vec::new();
        while let Ok(completion) = self.completions_rx.try_recv() {
            out.push(completion);
        }
        out
    }

    pub async fn write_to_overlay(&self, handle: OverlayHandle, bytes: &[u8]) -> std::io::Result<usize> {
        self.overlay.write(handle, bytes).await
    }

    pub async fn close_overlay(&self, handle: OverlayHandle) {
        self.overlay.close(handle).await;
    }

    pub async fn close_write_overlay(&self, handle: OverlayHandle) {
        self.overlay.close_write(handle).await;
    }

    pub fn overlay(&self) -> &Arc<dyn Overlay> {
        &self.overlay
    }

    /// `kill_active(app_intercept_handle)` (spec §4.7, §8 invariant 8):
    /// enumerate every TCP/UDP flow bound to `intercept`, close its overlay
    /// half, and drop it. Idempotent — a second call finds nothing left.
    pub async fn kill_active(&mut self, intercept: InterceptHandle) {
        for id in self.tcp.active_ids(intercept) {
            let overlay_handle = self.tcp.get(id).and_then(|f| f.overlay_handle);
            if let Some(flow) = self.tcp.get_mut(id) {
                flow.reset();
            }
            if let Some(handle) = overlay_handle {
                self.overlay.close(handle).await;
            }
            self.tcp.remove(id);
        }

        for id in self.udp.active_ids(intercept) {
            let overlay_handle = self.udp.get(id).and_then(|f| f.overlay_handle);
            if let Some(flow) = self.udp.get_mut(id) {
                flow.close();
            }
            if let Some(handle) = overlay_handle {
                self.overlay.close(handle).await;
            }
            self.udp.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::{HostHandle, IngressMode, TunDevice};
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockOverlay {
        dial_ok: bool,
        close_calls: AtomicUsize,
    }

    #[async_trait]
    impl Overlay for MockOverlay {
        async fn dial(&self, _intercept: InterceptHandle, _info: FlowInfo) -> DialOutcome {
            if self.dial_ok {
                DialOutcome::Ok(OverlayHandle(42))
            } else {
                DialOutcome::Failed
            }
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

    #[allow(dead_code)]
    struct NoopTunDevice;

    #[async_trait]
    impl TunDevice for NoopTunDevice {
        fn ingress_mode(&self) -> IngressMode {
            IngressMode::Driven
        }
        async fn write(&self, _frame: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
        async fn add_local_address(&self, _ip: IpAddr) -> std::io::Result<()> {
            Ok(())
        }
        async fn delete_local_address(&self, _ip: IpAddr) -> std::io::Result<()> {
            Ok(())
        }
        async fn add_route(&self, _address: crate::addr::Address) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn fake_tcp_handle() -> smoltcp::iface::SocketHandle {
        let mut set = smoltcp::iface::SocketSet::new(vec![]);
        let rx = smoltcp::socket::tcp::SocketBuffer::new(vec![0; 64]);
        let tx = smoltcp::socket::tcp::SocketBuffer::new(vec![0; 64]);
        set.add(smoltcp::socket::tcp::Socket::new(rx, tx))
    }

    fn fake_intercept() -> InterceptHandle {
        let mut reg = crate::registry::InterceptRegistry::new();
        reg.add(crate::registry::InterceptSpec {
            service_name: "A".into(),
            protocols: std::collections::HashSet::from([crate::addr::Protocol::Tcp]),
            addresses: vec![crate::addr::parse_address("10.0.0.0/24").unwrap()],
            port_ranges: vec![crate::addr::parse_port_range(80, 80)],
        })
        .unwrap()
    }

    #[tokio::test]
    async fn dial_success_delivers_completion() {
        let overlay = Arc::new(MockOverlay {
            dial_ok: true,
            close_calls: AtomicUsize::new(0),
        });
        let mut bridge = Bridge::new(overlay);
        let intercept = fake_intercept();
        let flow_id = bridge.tcp.create(
            fake_tcp_handle(),
            intercept,
            "A".into(),
            "192.0.2.5:55000".parse().unwrap(),
            "10.0.0.7:80".parse().unwrap(),
        );
        bridge.dial_tcp(
            intercept,
            flow_id,
            FlowInfo {
                service_name: "A".into(),
                client_endpoint: "192.0.2.5:55000".parse().unwrap(),
                intercepted_endpoint: "10.0.0.7:80".parse().unwrap(),
            },
        );

        let mut completions = Vec::new();
        for _ in 0..50 {
            completions = bridge.drain_completions();
            if !completions.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(completions.len(), 1);
        match &completions[0] {
            DialCompletion::Tcp(id, DialOutcome::Ok(_)) => assert_eq!(*id, flow_id),
            _ => panic!("expected successful tcp dial completion"),
        }
    }

    #[tokio::test]
    async fn kill_active_closes_overlay_and_is_idempotent_s6() {
        let overlay = Arc::new(MockOverlay {
            dial_ok: true,
            close_calls: AtomicUsize::new(0),
        });
        let mut bridge = Bridge::new(Arc::clone(&overlay) as Arc<dyn Overlay>);
        let intercept = fake_intercept();
        for i in 0..3u16 {
            let id = bridge.tcp.create(
                fake_tcp_handle(),
                intercept,
                "A".into(),
                format!("192.0.2.5:{}", 55000 + i).parse().unwrap(),
                "10.0.0.7:80".parse().unwrap(),
            );
            let flow = bridge.tcp.get_mut(id).unwrap();
            flow.mark_dial_pending();
            flow.dial_succeeded(OverlayHandle(100 + i as u64));
        }
        for i in 0..2u16 {
            let id = bridge.udp.create(
                fake_udp_handle(),
                intercept,
                "A".into(),
                crate::udp::FiveTuple {
                    client_endpoint: format!("192.0.2.6:{}", 6000 + i).parse().unwrap(),
                    intercepted_endpoint: "10.0.1.1:53".parse().unwrap(),
                },
                Duration::from_secs(60),
                std::time::Instant::now(),
            );
            bridge.udp.get_mut(id).unwrap().dial_succeeded(OverlayHandle(i as u64));
        }

        bridge.kill_active(intercept).await;
        assert_eq!(bridge.tcp.active_ids(intercept).len(), 0);
        assert_eq!(bridge.udp.active_ids(intercept).len(), 0);

        // idempotent: second call finds nothing, makes no further overlay calls
        bridge.kill_active(intercept).await;
        assert_eq!(overlay.close_calls.load(Ordering::SeqCst), 5);
    }

    fn fake_udp_handle() -> smoltcp::iface::SocketHandle {
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
}
