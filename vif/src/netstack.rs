//! The embedded userspace TCP/IP stack attached to the TUN device.
//!
//! TCP is terminated by smoltcp: the first SYN of an unknown flow creates a
//! listening socket bound to exactly that destination, so any destination is
//! accepted without filtering (the router controls what reaches us at all).
//! UDP carries no connection state and is decoded and re-encoded directly.
//! Every accepted flow yields a [`ConnId`] and is bound to a stream through
//! the [`StreamCreator`].

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant as StdInstant};

use bytes::Bytes;
use ip_packet::{IpPacket, IpPacketBuf};
use parking_lot::Mutex;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{DeviceCapabilities, Medium};
use smoltcp::socket::tcp;
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{HardwareAddress, IpEndpoint, Ipv4Address, Ipv4Cidr, Ipv6Address, Ipv6Cidr};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tun::Device;
use tunnel::{ConnId, Dialer, Handler, HandlerPool, Proto, StreamCreator};

use crate::udp_flow::UdpFlow;

// Rx/tx socket buffers; values are the Linux defaults.
const TCP_RECV_BUFFER_SIZE: usize = 87380;
const TCP_SEND_BUFFER_SIZE: usize = 16384;

const IP4_ADDR: Ipv4Address = Ipv4Address::new(127, 0, 0, 1);
const IP6_ADDR: Ipv6Address = Ipv6Address::new(0, 0, 0, 0, 0, 0, 0, 1);

#[derive(Clone, Debug)]
pub struct NetstackConfig {
    /// Carried in each stream's handshake so the peer knows how long to wait.
    pub dial_timeout: Duration,
}

impl Default for NetstackConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
        }
    }
}

/// The running stack; owns its three loops until cancelled.
pub struct Netstack {
    cancel: CancellationToken,
    done: CancellationToken,
}

impl Netstack {
    /// Attaches a stack to `device` and starts its loops.
    ///
    /// Panics if called without a Tokio runtime.
    pub fn spawn(
        device: Arc<dyn Device>,
        pool: HandlerPool,
        creator: Arc<dyn StreamCreator>,
        config: NetstackConfig,
        cancel: CancellationToken,
    ) -> Self {
        let notify = Arc::new(Notify::new());
        let manager = Arc::new(Mutex::new(SocketManager::new()));
        let (outbound_tx, outbound_rx) = mpsc::channel(tun::OUT_QUEUE_SIZE);

        let reader = tokio::spawn(tun_to_stack(
            device.clone(),
            manager.clone(),
            notify.clone(),
            pool,
            creator,
            outbound_tx.clone(),
            config,
            cancel.clone(),
        ));
        let driver = tokio::spawn(drive(
            manager.clone(),
            notify.clone(),
            outbound_tx,
            cancel.clone(),
        ));
        let writer = tokio::spawn(stack_to_tun(device, outbound_rx, cancel.clone()));

        let done = CancellationToken::new();
        tokio::spawn({
            let done = done.clone();

            async move {
                let _ = tokio::join!(reader, driver, writer);
                done.cancel();
            }
        });

        Self { cancel, done }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Cancelled once all loops have exited.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }
}

struct SocketManager {
    device: InMemoryDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
    flows: HashMap<ConnId, SocketHandle>,
    created_at: StdInstant,
}

impl SocketManager {
    fn new() -> Self {
        let mut device = InMemoryDevice::default();
        let iface = create_interface(&mut device);

        Self {
            device,
            iface,
            sockets: SocketSet::new(Vec::default()),
            flows: HashMap::new(),
            created_at: StdInstant::now(),
        }
    }

    fn now(&self) -> SmolInstant {
        smol_now(self.created_at, StdInstant::now())
    }
}

/// Creates a smoltcp [`Interface`] for our in-memory device.
///
/// The interface accepts packets with any destination IP; its own addresses
/// are dummies that never show up anywhere, and catch-all routes steer every
/// generated packet back to the device.
fn create_interface(device: &mut InMemoryDevice) -> Interface {
    let mut interface = Interface::new(
        Config::new(HardwareAddress::Ip),
        device,
        SmolInstant::ZERO,
    );

    interface.set_any_ip(true);

    interface.update_ip_addrs(|ips| {
        ips.push(Ipv4Cidr::new(IP4_ADDR, 32).into())
            .expect("should be a valid IPv4 CIDR");
        ips.push(Ipv6Cidr::new(IP6_ADDR, 128).into())
            .expect("should be a valid IPv6 CIDR");
    });

    interface
        .routes_mut()
        .add_default_ipv4_route(IP4_ADDR)
        .expect("IPv4 default route should fit");
    interface
        .routes_mut()
        .add_default_ipv6_route(IP6_ADDR)
        .expect("IPv6 default route should fit");

    interface
}

fn smol_now(created_at: StdInstant, now: StdInstant) -> SmolInstant {
    SmolInstant::ZERO + smoltcp::time::Duration::from_micros((now - created_at).as_micros() as u64)
}

/// TUN -> stack: reads packets, accepts new flows, injects into the device.
async fn tun_to_stack(
    device: Arc<dyn Device>,
    manager: Arc<Mutex<SocketManager>>,
    notify: Arc<Notify>,
    pool: HandlerPool,
    creator: Arc<dyn StreamCreator>,
    outbound_tx: mpsc::Sender<IpPacket>,
    config: NetstackConfig,
    cancel: CancellationToken,
) {
    loop {
        let mut buf = IpPacketBuf::new();

        let read = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("TUN read loop cancelled");
                break;
            }
            read = device.read_packet(&mut buf) => read,
        };

        let len = match read {
            Ok(0) => continue,
            Ok(len) => len,
            Err(e) => {
                tracing::debug!("TUN device is gone: {e}");
                break;
            }
        };

        let packet = match IpPacket::new(buf, len) {
            Ok(packet) => packet,
            Err(e) => {
                // Not IPv4/IPv6 (or fragmented); nothing we can do with it.
                tracing::trace!("Ignoring frame: {e:#}");
                continue;
            }
        };

        if let Some((sport, dport, is_syn)) = packet
            .as_tcp()
            .map(|tcp| (tcp.source_port(), tcp.destination_port(), tcp.syn() && !tcp.ack()))
        {
            let id = ConnId::from_parts(
                Proto::Tcp,
                packet.source(),
                sport,
                packet.destination(),
                dport,
            );

            if is_syn {
                accept_tcp_flow(
                    &id,
                    packet.destination(),
                    dport,
                    &manager,
                    &notify,
                    &pool,
                    &creator,
                    &config,
                );
            }

            manager.lock().device.receive(packet);
            notify.notify_waiters();
        } else if let Some((sport, dport, payload)) = packet
            .as_udp()
            .map(|udp| (udp.source_port(), udp.destination_port(), Bytes::copy_from_slice(udp.payload())))
        {
            let id = ConnId::from_parts(
                Proto::Udp,
                packet.source(),
                sport,
                packet.destination(),
                dport,
            );

            dispatch_udp(&id, payload, &pool, &creator, &outbound_tx);
        } else {
            tracing::trace!(src = %packet.source(), dst = %packet.destination(), "Ignoring non-TCP/UDP packet");
        }
    }
}

/// Creates the listening socket and handler for a fresh TCP flow.
fn accept_tcp_flow(
    id: &ConnId,
    dst: IpAddr,
    dport: u16,
    manager: &Arc<Mutex<SocketManager>>,
    notify: &Arc<Notify>,
    pool: &HandlerPool,
    creator: &Arc<dyn StreamCreator>,
    config: &NetstackConfig,
) {
    if manager.lock().flows.contains_key(id) {
        return; // Retransmitted SYN.
    }

    let mut socket = tcp::Socket::new(
        tcp::SocketBuffer::new(vec![0u8; TCP_RECV_BUFFER_SIZE]),
        tcp::SocketBuffer::new(vec![0u8; TCP_SEND_BUFFER_SIZE]),
    );
    socket.set_ack_delay(None);

    if let Err(e) = socket.listen(IpEndpoint::new(dst.into(), dport)) {
        tracing::warn!(%id, "Failed to listen for flow: {e}");
        return;
    }

    let handle = {
        let mut manager = manager.lock();
        let handle = manager.sockets.add(socket);
        manager.flows.insert(id.clone(), handle);
        handle
    };

    let conn = NetstackConn {
        id: id.clone(),
        handle,
        manager: manager.clone(),
        notify: notify.clone(),
    };

    let result = pool.get_or_create(id, |release| {
        Ok(Dialer::with_conn(
            id.clone(),
            conn,
            creator.clone(),
            config.dial_timeout,
            release,
        ) as Arc<dyn Handler>)
    });

    match result {
        Ok((_, false)) => tracing::debug!(%id, "Accepted TCP flow"),
        Ok((_, true)) => {
            // The SYN raced the teardown of the previous handler for this
            // 5-tuple. Dropping the unused endpoint removes the socket again;
            // the stack answers with RST and the client retries.
            tracing::debug!(%id, "Flow raced its predecessor's teardown");
        }
        Err(e) => tracing::warn!(%id, "Failed to create flow handler: {e:#}"),
    }
}

/// Routes one datagram to its conversation, creating it if needed.
fn dispatch_udp(
    id: &ConnId,
    payload: Bytes,
    pool: &HandlerPool,
    creator: &Arc<dyn StreamCreator>,
    outbound_tx: &mpsc::Sender<IpPacket>,
) {
    let result = pool.get_or_create(id, |release| {
        Ok(UdpFlow::new(
            id.clone(),
            outbound_tx.clone(),
            creator.clone(),
            release,
        ) as Arc<dyn Handler>)
    });

    match result {
        Ok((handler, _)) => {
            let Some(flow) = handler.as_any().downcast_ref::<UdpFlow>() else {
                tracing::warn!(%id, "Handler is not a UDP conversation");
                return;
            };

            flow.enqueue(payload);
        }
        Err(e) => tracing::warn!(%id, "Failed to create conversation handler: {e:#}"),
    }
}

/// Polls the interface whenever there is work and drains generated packets.
async fn drive(
    manager: Arc<Mutex<SocketManager>>,
    notify: Arc<Notify>,
    outbound_tx: mpsc::Sender<IpPacket>,
    cancel: CancellationToken,
) {
    loop {
        let (packets, delay) = {
            let mut guard = manager.lock();
            let now = guard.now();

            let SocketManager {
                device,
                iface,
                sockets,
                ..
            } = &mut *guard;

            let _ = iface.poll(now, device, sockets);

            let mut packets = Vec::new();
            while let Some(packet) = device.next_send() {
                packets.push(packet);
            }

            let delay = iface.poll_delay(now, sockets).map(Duration::from);

            (packets, delay)
        };

        for packet in packets {
            if outbound_tx.send(packet).await.is_err() {
                return;
            }
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = notify.notified() => {}
            () = tokio::time::sleep(delay.unwrap_or(Duration::from_millis(50))) => {}
        }
    }
}

/// Stack -> TUN: writes generated packets to the device.
async fn stack_to_tun(
    device: Arc<dyn Device>,
    mut outbound_rx: mpsc::Receiver<IpPacket>,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            () = cancel.cancelled() => break,
            packet = outbound_rx.recv() => packet,
        };

        let Some(packet) = packet else {
            break;
        };

        if let Err(e) = device.write_packet(&packet).await {
            tracing::warn!("Failed to write to TUN device: {e}");
        }
    }
}

/// An in-memory device for smoltcp that is entirely backed by buffers.
#[derive(Debug, Default)]
struct InMemoryDevice {
    inbound_packets: std::collections::VecDeque<IpPacket>,
    outbound_packets: std::collections::VecDeque<IpPacket>,
}

impl InMemoryDevice {
    fn receive(&mut self, packet: IpPacket) {
        self.inbound_packets.push_back(packet);
    }

    fn next_send(&mut self) -> Option<IpPacket> {
        self.outbound_packets.pop_front()
    }
}

impl smoltcp::phy::Device for InMemoryDevice {
    type RxToken<'a> = SmolRxToken;
    type TxToken<'a> = SmolTxToken<'a>;

    fn receive(
        &mut self,
        _timestamp: SmolInstant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let rx_token = SmolRxToken {
            packet: self.inbound_packets.pop_front()?,
        };
        let tx_token = SmolTxToken {
            outbound_packets: &mut self.outbound_packets,
        };

        Some((rx_token, tx_token))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(SmolTxToken {
            outbound_packets: &mut self.outbound_packets,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = ip_packet::MAX_IP_SIZE;

        caps
    }
}

struct SmolTxToken<'a> {
    outbound_packets: &'a mut std::collections::VecDeque<IpPacket>,
}

impl smoltcp::phy::TxToken for SmolTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        if len > ip_packet::MAX_IP_SIZE {
            tracing::warn!(%len, "Packets larger than the MTU are not supported");

            let mut buf = vec![0u8; len];
            return f(&mut buf);
        }

        let mut ip_packet_buf = IpPacketBuf::new();
        let result = f(&mut ip_packet_buf.buf()[..len]);

        match IpPacket::new(ip_packet_buf, len) {
            Ok(packet) => self.outbound_packets.push_back(packet),
            Err(e) => tracing::warn!("Generated an invalid IP packet: {e:#}"),
        }

        result
    }
}

struct SmolRxToken {
    packet: IpPacket,
}

impl smoltcp::phy::RxToken for SmolRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(self.packet.packet())
    }
}

/// The local end of an accepted TCP flow, as a byte stream.
///
/// Read/write operate directly on the smoltcp socket buffers; wakers are
/// registered with the socket and the poll task is nudged after every
/// mutation so ACKs and window updates go out promptly.
struct NetstackConn {
    id: ConnId,
    handle: SocketHandle,
    manager: Arc<Mutex<SocketManager>>,
    notify: Arc<Notify>,
}

impl Drop for NetstackConn {
    fn drop(&mut self) {
        let mut manager = self.manager.lock();
        manager.sockets.remove(self.handle);
        manager.flows.remove(&self.id);
        drop(manager);

        self.notify.notify_waiters();
    }
}

impl AsyncRead for NetstackConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        {
            let mut manager = this.manager.lock();
            let socket = manager.sockets.get_mut::<tcp::Socket>(this.handle);

            if socket.can_recv() {
                let dst = buf.initialize_unfilled();

                match socket.recv_slice(dst) {
                    Ok(n) => buf.advance(n),
                    Err(e) => {
                        return Poll::Ready(Err(io::Error::other(format!("recv failed: {e}"))));
                    }
                }
            } else if socket.may_recv() {
                socket.register_recv_waker(cx.waker());

                return Poll::Pending;
            } else {
                return Poll::Ready(Ok(())); // Remote closed; EOF.
            }
        }

        this.notify.notify_waiters();

        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for NetstackConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        let written = {
            let mut manager = this.manager.lock();
            let socket = manager.sockets.get_mut::<tcp::Socket>(this.handle);

            if !socket.is_open() {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }

            if !socket.can_send() {
                socket.register_send_waker(cx.waker());

                return Poll::Pending;
            }

            match socket.send_slice(buf) {
                Ok(n) => n,
                Err(e) => {
                    return Poll::Ready(Err(io::Error::other(format!("send failed: {e}"))));
                }
            }
        };

        this.notify.notify_waiters();

        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        {
            let mut manager = this.manager.lock();
            let socket = manager.sockets.get_mut::<tcp::Socket>(this.handle);

            if socket.is_open() {
                socket.close();
            }

            if socket.state() != tcp::State::Closed {
                socket.register_send_waker(cx.waker());
                drop(manager);

                // Nudge the poll task so the FIN actually goes out.
                this.notify.notify_waiters();

                return Poll::Pending;
            }
        }

        this.notify.notify_waiters();

        Poll::Ready(Ok(()))
    }
}
