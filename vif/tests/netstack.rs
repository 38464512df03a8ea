#![allow(clippy::unwrap_used)]

mod support;

use std::time::Duration;

use bytes::Bytes;
use ip_packet::{IpPacket, IpPacketBuf};
use support::{FakeDevice, LoopbackCreator};
use tokio_util::sync::CancellationToken;
use tunnel::{Code, Error, HandlerPool, Message, Proto};
use vif::{Netstack, NetstackConfig};

fn tcp_syn_packet(src: &str, dst: &str, sport: u16, dport: u16) -> IpPacket {
    let src: std::net::Ipv4Addr = src.parse().unwrap();
    let dst: std::net::Ipv4Addr = dst.parse().unwrap();

    let builder = etherparse::PacketBuilder::ipv4(src.octets(), dst.octets(), 64)
        .tcp(sport, dport, 1, 64240)
        .syn();

    let size = builder.size(0);
    let mut buf = IpPacketBuf::new();
    builder
        .write(&mut std::io::Cursor::new(buf.buf()), &[])
        .unwrap();

    IpPacket::new(buf, size).unwrap()
}

fn udp_packet(src: &str, dst: &str, payload: &[u8]) -> IpPacket {
    ip_packet::make::udp_packet(src.parse().unwrap(), dst.parse().unwrap(), payload).unwrap()
}

#[tokio::test]
async fn tcp_syn_accepts_flow_and_answers_syn_ack() {
    let _guard = logging::test("debug");

    let (device, inbound, mut outbound) = FakeDevice::new();
    let (creator, mut created) = LoopbackCreator::new();
    let pool = HandlerPool::new();
    let cancel = CancellationToken::new();

    let netstack = Netstack::spawn(
        device.clone(),
        pool.clone(),
        creator,
        NetstackConfig::default(),
        cancel.clone(),
    );

    inbound
        .send(tcp_syn_packet("10.0.0.1", "192.0.2.1", 43210, 8080))
        .await
        .unwrap();

    // The stack accepts any destination: the flow is bound to a stream...
    let (id, _server_stream) = tokio::time::timeout(Duration::from_secs(5), created.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(id.to_string(), "tcp 10.0.0.1:43210 -> 192.0.2.1:8080");
    assert_eq!(pool.len(), 1);

    // ...and answers the handshake on the wire.
    let reply = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
        .await
        .unwrap()
        .unwrap();

    let tcp = reply.as_tcp().unwrap();
    assert!(tcp.syn() && tcp.ack());
    assert_eq!(tcp.source_port(), 8080);
    assert_eq!(tcp.destination_port(), 43210);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), netstack.done().cancelled_owned())
        .await
        .unwrap();
}

#[tokio::test]
async fn udp_conversation_round_trips() {
    let _guard = logging::test("debug");

    let (device, inbound, mut outbound) = FakeDevice::new();
    let (creator, mut created) = LoopbackCreator::new();
    let pool = HandlerPool::new();
    let cancel = CancellationToken::new();

    let _netstack = Netstack::spawn(
        device.clone(),
        pool.clone(),
        creator,
        NetstackConfig::default(),
        cancel.clone(),
    );

    inbound
        .send(udp_packet("10.0.0.1:5353", "192.0.2.53:53", b"query"))
        .await
        .unwrap();

    let (id, mut server_stream) = tokio::time::timeout(Duration::from_secs(5), created.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(id.proto(), Proto::Udp);

    // The datagram arrives as a Normal frame on the stream.
    let msg = tokio::time::timeout(Duration::from_secs(5), server_stream.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.code(), Code::Normal);
    assert_eq!(msg.payload(), "query");

    // A reply frame is synthesised back into a UDP packet on the TUN.
    server_stream
        .send(Message::normal(Bytes::from_static(b"answer")))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
        .await
        .unwrap()
        .unwrap();

    let udp = reply.as_udp().unwrap();
    assert_eq!(reply.source(), "192.0.2.53".parse::<std::net::IpAddr>().unwrap());
    assert_eq!(reply.destination(), "10.0.0.1".parse::<std::net::IpAddr>().unwrap());
    assert_eq!(udp.source_port(), 53);
    assert_eq!(udp.destination_port(), 5353);
    assert_eq!(udp.payload(), b"answer");

    cancel.cancel();
}

#[tokio::test]
async fn second_datagram_reuses_the_conversation() {
    let _guard = logging::test("debug");

    let (device, inbound, _outbound) = FakeDevice::new();
    let (creator, mut created) = LoopbackCreator::new();
    let pool = HandlerPool::new();
    let cancel = CancellationToken::new();

    let _netstack = Netstack::spawn(
        device.clone(),
        pool.clone(),
        creator,
        NetstackConfig::default(),
        cancel.clone(),
    );

    inbound
        .send(udp_packet("10.0.0.1:5353", "192.0.2.53:53", b"one"))
        .await
        .unwrap();
    inbound
        .send(udp_packet("10.0.0.1:5353", "192.0.2.53:53", b"two"))
        .await
        .unwrap();

    let (_, mut server_stream) = tokio::time::timeout(Duration::from_secs(5), created.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(server_stream.receive().await.unwrap().payload(), "one");
    assert_eq!(server_stream.receive().await.unwrap().payload(), "two");
    assert_eq!(pool.len(), 1);

    // The peer tearing the conversation down releases the handler.
    server_stream.send(Message::disconnect()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if pool.is_empty() {
                break;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Draining our half afterwards observes the closed stream.
    loop {
        match server_stream.receive().await {
            Ok(_) => {}
            Err(Error::Closed | Error::Eof) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    cancel.cancel();
}
