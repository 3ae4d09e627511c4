//! Embedded stack adapter (spec §4.4): brings up one virtual interface over
//! `smoltcp`, ingests frames from the TUN device or a shadow forwarder, and
//! hands completed frames back out for transmission.

use smoltcp::iface::{Config, Interface, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use smoltcp::wire::{HardwareAddress, IpCidr, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};

/// An in-memory [`Device`] fed by `on_frame`/`on_rawsock_frame` and drained
/// by the supervisor on every tick. Frames carry raw IP packets, matching a
/// TUN device's framing (no Ethernet header) per spec §4.4.
pub struct FrameQueueDevice {
    mtu: usize,
    rx_queue: VecDeque<Vec<u8>>,
    tx_queue: VecDeque<Vec<u8>>,
}

impl FrameQueueDevice {
    fn new(mtu: usize) -> Self {
        FrameQueueDevice {
            mtu,
            rx_queue: VecDeque::new(),
            tx_queue: VecDeque::new(),
        }
    }

    fn push_rx(&mut self, frame: Vec<u8>) {
        self.rx_queue.push_back(frame);
    }

    fn take_tx_queue(&mut self) -> VecDeque<Vec<u8>> {
        std::mem::take(&mut self.tx_queue)
    }
}

pub struct RxTokenImpl {
    buf: Vec<u8>,
}

impl RxToken for RxTokenImpl {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.buf)
    }
}

pub struct TxTokenImpl<'a> {
    queue: &'a mut VecDeque<Vec<u8>>,
}

impl<'a> TxToken for TxTokenImpl<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        self.queue.push_back(buf);
        result
    }
}

impl Device for FrameQueueDevice {
    type RxToken<'a>
        = RxTokenImpl
    where
        Self: 'a;
    type TxToken<'a>
        = TxTokenImpl<'a>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let buf = self.rx_queue.pop_front()?;
        Some((
            RxTokenImpl { buf },
            TxTokenImpl {
                queue: &mut self.tx_queue,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(TxTokenImpl {
            queue: &mut self.tx_queue,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = self.mtu;
        caps.medium = Medium::Ip;
        caps
    }
}

/// Owns the virtual interface, its socket set, and the frame queue that
/// stands in for the TUN device's read/write surface.
///
/// There is no internal smoltcp raw socket here. An earlier revision bound
/// `IpProtocol::Tcp`/`Udp` raw sockets as the observer (spec §4.4's Rust
/// analogue of lwIP's raw PCB), but smoltcp's `Interface::poll` dispatches
/// to every socket — raw and protocol — against the *same* ingress frame in
/// one pass: by the time a raw socket's `recv()` could reveal an observed
/// SYN, the same `poll()` call has already found no listening TCP socket
/// for it and synthesized an RST. Observing has to happen strictly before
/// dispatch, so `peek_pending_tcp_syns`/`peek_pending_udp_datagrams` below
/// inspect the queued ingress frames directly, ahead of `poll()`.
pub struct StackAdapter {
    pub iface: Interface,
    pub device: FrameQueueDevice,
    pub sockets: SocketSet<'static>,
}

impl StackAdapter {
    pub fn new(mtu: usize, addrs: &[IpCidr]) -> Self {
        let mut device = FrameQueueDevice::new(mtu);
        let mut iface = Interface::new(Config::new(HardwareAddress::Ip), &mut device, Instant::now());
        iface.update_ip_addrs(|ip_addrs| {
            for cidr in addrs {
                ip_addrs.push(*cidr).expect("virtual interface address list is full");
            }
        });

        let sockets = SocketSet::new(vec![]);

        StackAdapter { iface, device, sockets }
    }

    /// TCP SYNs sitting in the ingress queue, not yet dispatched (spec
    /// §4.4/§4.5). Must be called — and any listening socket it implies
    /// created — before `poll()` runs on the same frames, or smoltcp will
    /// answer the SYN with an RST before a listener ever sees it.
    pub fn peek_pending_tcp_syns(&self) -> Vec<ObservedTcpSyn> {
        self.device.rx_queue.iter().filter_map(|frame| inspect_tcp_syn(frame)).collect()
    }

    /// UDP datagrams sitting in the ingress queue, not yet dispatched (spec
    /// §4.4/§4.6). Same ordering requirement as `peek_pending_tcp_syns`.
    pub fn peek_pending_udp_datagrams(&self) -> Vec<ObservedUdpDatagram> {
        self.device.rx_queue.iter().filter_map(|frame| inspect_udp_datagram(frame)).collect()
    }

    /// Ingest a frame read from the TUN device (spec §4.4 `on_frame`).
    pub fn on_frame(&mut self, bytes: &[u8]) {
        self.device.push_rx(bytes.to_vec());
    }

    /// Ingest a frame captured by a shadow forwarder (spec §4.4
    /// `on_rawsock_frame`). Funnels into the same input routine as `on_frame`.
    pub fn on_rawsock_frame(&mut self, bytes: &[u8]) {
        self.device.push_rx(bytes.to_vec());
    }

    /// Service the stack: dispatch queued ingress frames to sockets and
    /// produce any egress frames those sockets triggered.
    pub fn poll(&mut self) -> smoltcp::iface::PollResult {
        self.iface.poll(Instant::now(), &mut self.device, &mut self.sockets)
    }

    pub fn poll_delay(&self) -> Option<smoltcp::time::Duration> {
        self.iface.poll_delay(Instant::now(), &self.sockets)
    }

    /// Drain frames the stack produced for transmission, in order.
    pub fn drain_egress(&mut self) -> VecDeque<Vec<u8>> {
        self.device.take_tx_queue()
    }
}

/// A TCP SYN observed on the raw protocol handler, not yet backed by any
/// listening socket (spec §4.5: "if the segment is a SYN to an endpoint
/// matched by the intercept registry, a new TcpFlow is created").
#[derive(Debug, Clone, Copy)]
pub struct ObservedTcpSyn {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

/// A UDP datagram observed on the raw protocol handler, carrying its full
/// payload (spec §4.6 pre-dial buffering needs the bytes immediately, since
/// UDP has no retransmission to fall back on).
#[derive(Debug, Clone)]
pub struct ObservedUdpDatagram {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload: Vec<u8>,
}

fn split_ip(bytes: &[u8]) -> Option<(IpAddr, IpAddr, &[u8])> {
    let version = bytes.first()? >> 4;
    match version {
        4 => {
            let packet = Ipv4Packet::new_checked(bytes).ok()?;
            let src = IpAddr::V4(packet.src_addr().into());
            let dst = IpAddr::V4(packet.dst_addr().into());
            Some((src, dst, packet.payload()))
        }
        6 => {
            let packet = Ipv6Packet::new_checked(bytes).ok()?;
            let src = IpAddr::V6(packet.src_addr().into());
            let dst = IpAddr::V6(packet.dst_addr().into());
            Some((src, dst, packet.payload()))
        }
        _ => None,
    }
}

fn inspect_tcp_syn(ip_packet: &[u8]) -> Option<ObservedTcpSyn> {
    let (src_ip, dst_ip, payload) = split_ip(ip_packet)?;
    let tcp = TcpPacket::new_checked(payload).ok()?;
    if !tcp.syn() || tcp.ack() {
        return None;
    }
    Some(ObservedTcpSyn {
        src: SocketAddr::new(src_ip, tcp.src_port()),
        dst: SocketAddr::new(dst_ip, tcp.dst_port()),
    })
}

fn inspect_udp_datagram(ip_packet: &[u8]) -> Option<ObservedUdpDatagram> {
    let (src_ip, dst_ip, payload) = split_ip(ip_packet)?;
    let udp = UdpPacket::new_checked(payload).ok()?;
    Some(ObservedUdpDatagram {
        src: SocketAddr::new(src_ip, udp.src_port()),
        dst: SocketAddr::new(dst_ip, udp.dst_port()),
        payload: udp.payload().to_vec(),
    })
}
