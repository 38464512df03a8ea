//! Test doubles: an in-memory TUN device and a loopback stream creator.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use ip_network::IpNetwork;
use ip_packet::{IpPacket, IpPacketBuf};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tunnel::transport::pipe;
use tunnel::{ConnId, Stream, StreamCreator, Tag};

pub const TUN_NAME: &str = "tun-test";

/// An in-memory device: the test is the "OS" side of the TUN.
pub struct FakeDevice {
    subnets: Mutex<Vec<IpNetwork>>,
    pub subnet_mutations: AtomicUsize,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<IpPacket>>,
    outbound_tx: mpsc::Sender<IpPacket>,
    closing: CancellationToken,
}

impl FakeDevice {
    /// Returns the device plus the test's handles: inject inbound packets,
    /// observe written ones.
    pub fn new() -> (Arc<Self>, mpsc::Sender<IpPacket>, mpsc::Receiver<IpPacket>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);

        let device = Arc::new(Self {
            subnets: Mutex::new(Vec::new()),
            subnet_mutations: AtomicUsize::new(0),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound_tx,
            closing: CancellationToken::new(),
        });

        (device, inbound_tx, outbound_rx)
    }

    pub fn routes_via_tun(&self, ip: IpAddr) -> bool {
        self.subnets.lock().iter().any(|subnet| subnet.contains(ip))
    }

    pub fn mutations(&self) -> usize {
        self.subnet_mutations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl tun::Device for FakeDevice {
    async fn read_packet(&self, buf: &mut IpPacketBuf) -> io::Result<usize> {
        let mut inbound_rx = self.inbound_rx.lock().await;

        let packet = tokio::select! {
            () = self.closing.cancelled() => return Err(io::ErrorKind::UnexpectedEof.into()),
            packet = inbound_rx.recv() => packet,
        };

        let Some(packet) = packet else {
            return Err(io::ErrorKind::UnexpectedEof.into());
        };

        let bytes = packet.packet();
        buf.buf()[..bytes.len()].copy_from_slice(bytes);

        Ok(bytes.len())
    }

    async fn write_packet(&self, packet: &IpPacket) -> io::Result<usize> {
        let len = packet.packet().len();

        self.outbound_tx
            .send(packet.clone())
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;

        Ok(len)
    }

    async fn add_subnet(&self, subnet: IpNetwork) -> Result<()> {
        self.subnet_mutations.fetch_add(1, Ordering::SeqCst);
        self.subnets.lock().push(subnet);

        Ok(())
    }

    async fn remove_subnet(&self, subnet: IpNetwork) -> Result<()> {
        self.subnet_mutations.fetch_add(1, Ordering::SeqCst);
        self.subnets.lock().retain(|s| *s != subnet);

        Ok(())
    }

    async fn set_mtu(&self, _mtu: u32) -> Result<()> {
        Ok(())
    }

    async fn set_dns(
        &self,
        _cluster_domain: &str,
        _server: IpAddr,
        _search: &[String],
    ) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        TUN_NAME
    }

    fn close(&self) {
        self.closing.cancel();
    }
}

/// Opens loopback streams: the server half of every created stream is handed
/// to the test.
pub struct LoopbackCreator {
    created: mpsc::Sender<(ConnId, Stream)>,
}

impl LoopbackCreator {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<(ConnId, Stream)>) {
        let (created, created_rx) = mpsc::channel(16);

        (Arc::new(Self { created }), created_rx)
    }
}

#[async_trait]
impl StreamCreator for LoopbackCreator {
    async fn create_stream(&self, id: &ConnId) -> Result<Stream> {
        let (client_channel, server_channel) = pipe(50);

        let server = tokio::spawn(Stream::server(server_channel, Tag::Srv));
        let client = Stream::client(
            client_channel,
            id.clone(),
            "test-session",
            Duration::from_secs(5),
            Duration::ZERO,
            Tag::Fwd,
        )
        .await?;
        let server = server.await??;

        self.created.send((id.clone(), server)).await.ok();

        Ok(client)
    }
}
