#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tunnel::transport::pipe;
use tunnel::{
    Code, ConnId, Error, HandlerPool, Message, Proto, Stream, StreamCreator, Tag, UdpListener,
};

const TARGET: &str = "192.0.2.53:53";

/// Opens loopback streams, handing the server half of each to the test.
struct LoopbackCreator {
    created: mpsc::Sender<(ConnId, Stream)>,
}

#[async_trait]
impl StreamCreator for LoopbackCreator {
    async fn create_stream(&self, id: &ConnId) -> anyhow::Result<Stream> {
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

/// Binds a listener socket and runs a [`UdpListener`] on it.
async fn start_listener() -> (
    SocketAddr,
    HandlerPool,
    mpsc::Receiver<(ConnId, Stream)>,
    CancellationToken,
) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let listener_addr = socket.local_addr().unwrap();

    let (created_tx, created_rx) = mpsc::channel(16);
    let pool = HandlerPool::new();
    let cancel = CancellationToken::new();

    let listener = UdpListener::new(
        socket,
        TARGET.parse().unwrap(),
        pool.clone(),
        Arc::new(LoopbackCreator {
            created: created_tx,
        }),
        cancel.clone(),
    );
    tokio::spawn(listener.run());

    (listener_addr, pool, created_rx, cancel)
}

#[tokio::test]
async fn relays_datagrams_in_both_directions() {
    let _guard = logging::test("debug");

    let (listener_addr, pool, mut created, cancel) = start_listener().await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"ping", listener_addr).await.unwrap();

    // The first datagram of a source opens a stream identified by the
    // (source -> target) pair.
    let (id, mut server_stream) = tokio::time::timeout(Duration::from_secs(5), created.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(id.proto(), Proto::Udp);
    assert_eq!(id.source_addr(), client.local_addr().unwrap());
    assert_eq!(id.destination_addr(), TARGET.parse().unwrap());

    let msg = tokio::time::timeout(Duration::from_secs(5), server_stream.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.code(), Code::Normal);
    assert_eq!(msg.payload(), "ping");

    // Replies are routed back to the conversation's source address.
    server_stream
        .send(Message::normal(Bytes::from_static(b"pong")))
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"pong");
    assert_eq!(from, listener_addr);

    assert_eq!(pool.len(), 1);

    cancel.cancel();
}

#[tokio::test]
async fn conversations_are_deduplicated_per_source_and_released() {
    let _guard = logging::test("debug");

    let (listener_addr, pool, mut created, cancel) = start_listener().await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"one", listener_addr).await.unwrap();
    client.send_to(b"two", listener_addr).await.unwrap();

    let (_, mut server_stream) = tokio::time::timeout(Duration::from_secs(5), created.recv())
        .await
        .unwrap()
        .unwrap();

    // Both datagrams arrive on the same stream, in order.
    assert_eq!(server_stream.receive().await.unwrap().payload(), "one");
    assert_eq!(server_stream.receive().await.unwrap().payload(), "two");
    assert_eq!(pool.len(), 1);

    // A different source is its own conversation.
    let other = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    other.send_to(b"hello", listener_addr).await.unwrap();

    let (other_id, mut other_stream) = tokio::time::timeout(Duration::from_secs(5), created.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(other_id.source_addr(), other.local_addr().unwrap());
    assert_eq!(other_stream.receive().await.unwrap().payload(), "hello");
    assert_eq!(pool.len(), 2);

    // A peer disconnect releases exactly that conversation.
    server_stream.send(Message::disconnect()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if pool.len() == 1 {
                break;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // The released conversation's stream winds down cleanly.
    loop {
        match server_stream.receive().await {
            Ok(_) => {}
            Err(Error::Closed | Error::Eof) => break,
            Err(e) => panic!("unexpected receive error: {e}"),
        }
    }

    cancel.cancel();
}
