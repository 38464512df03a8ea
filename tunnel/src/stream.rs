//! One logical bidirectional framed channel carried over the transport.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::message::{self, Code, ConnectInfo, Message};
use crate::transport::{Channel, TransportRx, TransportTx};
use crate::{ConnId, Error};

/// The tunnel protocol version spoken by this implementation.
///
/// Versions 0 and 1 are historical and never emitted.
pub const VERSION: u16 = 2;

/// Marks which role created a stream, for logs only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    Cli,
    Srv,
    Fwd,
    Snd,
    Rcv,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tag::Cli => "CLI",
            Tag::Srv => "SRV",
            Tag::Fwd => "FWD",
            Tag::Snd => "SND",
            Tag::Rcv => "RCV",
        };

        write!(f, "{name}")
    }
}

/// Immutable metadata of an established stream, shared by both halves.
#[derive(Debug)]
pub struct Info {
    pub id: ConnId,
    pub session_id: String,
    pub peer_version: u16,
    pub dial_timeout: Duration,
    pub roundtrip_latency: Duration,
    pub tag: Tag,
}

pub struct Stream {
    reader: ReadHalf,
    writer: WriteHalf,
}

impl Stream {
    /// Establishes the client side of a stream.
    ///
    /// Sends `StreamInfo` announcing version, flow id, session and timings,
    /// then blocks reading exactly one message which must be `StreamOK`.
    pub async fn client(
        channel: Channel,
        id: ConnId,
        session_id: impl Into<String>,
        dial_timeout: Duration,
        roundtrip_latency: Duration,
        tag: Tag,
    ) -> Result<Self, Error> {
        let Channel { mut tx, mut rx } = channel;
        let session_id = session_id.into();

        let hello = message::stream_info(&id, &session_id, roundtrip_latency, dial_timeout);
        tx.send(hello.tunnel_message())
            .await
            .map_err(Error::Transport)?;

        let frame = rx
            .recv()
            .await
            .map_err(Error::Transport)?
            .ok_or(Error::Eof)?;
        let msg = Message::from_frame(frame)?;

        if msg.code() != Code::StreamOk {
            return Err(Error::Handshake(format!(
                "expected StreamOK, got {}",
                msg.code()
            )));
        }

        let peer_version = message::parse_stream_ok(msg.payload())?;

        tracing::debug!(%id, %peer_version, %tag, "Established client stream");

        Ok(Self::assemble(
            Info {
                id,
                session_id,
                peer_version,
                dial_timeout,
                roundtrip_latency,
                tag,
            },
            tx,
            rx,
        ))
    }

    /// Accepts the server side of a stream.
    ///
    /// Reads exactly one message which must be `StreamInfo`, then answers with
    /// `StreamOK` carrying our version. Callers bound the handshake by
    /// wrapping this in their context's deadline.
    pub async fn server(channel: Channel, tag: Tag) -> Result<Self, Error> {
        let Channel { mut tx, mut rx } = channel;

        let frame = rx
            .recv()
            .await
            .map_err(Error::Transport)?
            .ok_or(Error::Eof)?;
        let msg = Message::from_frame(frame)?;

        if msg.code() != Code::StreamInfo {
            return Err(Error::Handshake(format!(
                "expected StreamInfo, got {}",
                msg.code()
            )));
        }

        let ConnectInfo {
            version,
            roundtrip_latency,
            dial_timeout,
            id,
            session_id,
        } = message::parse_connect_info(msg.payload())?;

        tx.send(message::stream_ok(VERSION).tunnel_message())
            .await
            .map_err(Error::Transport)?;

        tracing::debug!(%id, peer_version = %version, %tag, "Accepted server stream");

        Ok(Self::assemble(
            Info {
                id,
                session_id,
                peer_version: version,
                dial_timeout,
                roundtrip_latency,
                tag,
            },
            tx,
            rx,
        ))
    }

    fn assemble(info: Info, tx: Box<dyn TransportTx>, rx: Box<dyn TransportRx>) -> Self {
        let info = Arc::new(info);

        Self {
            reader: ReadHalf {
                info: info.clone(),
                rx,
                closed: false,
            },
            writer: WriteHalf {
                info,
                tx,
                closed: false,
            },
        }
    }

    pub fn info(&self) -> &Info {
        &self.reader.info
    }

    pub fn id(&self) -> &ConnId {
        &self.reader.info.id
    }

    pub fn session_id(&self) -> &str {
        &self.reader.info.session_id
    }

    pub fn peer_version(&self) -> u16 {
        self.reader.info.peer_version
    }

    pub fn dial_timeout(&self) -> Duration {
        self.reader.info.dial_timeout
    }

    pub fn roundtrip_latency(&self) -> Duration {
        self.reader.info.roundtrip_latency
    }

    pub fn tag(&self) -> Tag {
        self.reader.info.tag
    }

    pub async fn receive(&mut self) -> Result<Message, Error> {
        self.reader.receive().await
    }

    pub async fn send(&mut self, msg: Message) -> Result<(), Error> {
        self.writer.send(msg).await
    }

    pub async fn close_send(&mut self) -> Result<(), Error> {
        self.writer.close_send().await
    }

    /// Splits the stream for its two loops. A single stream tolerates exactly
    /// one concurrent reader and one concurrent writer.
    pub fn into_split(self) -> (ReadHalf, WriteHalf) {
        (self.reader, self.writer)
    }
}

pub struct ReadHalf {
    info: Arc<Info>,
    rx: Box<dyn TransportRx>,
    closed: bool,
}

impl ReadHalf {
    pub fn info(&self) -> &Info {
        &self.info
    }

    pub fn shared_info(&self) -> Arc<Info> {
        self.info.clone()
    }

    /// The next decoded message.
    ///
    /// A `CloseSend` frame from the peer closes the read half: this and every
    /// subsequent call return [`Error::Closed`]. A transport without further
    /// frames returns [`Error::Eof`]. Sends on the write half remain
    /// permitted in both cases.
    pub async fn receive(&mut self) -> Result<Message, Error> {
        if self.closed {
            return Err(Error::Closed);
        }

        let Some(frame) = self.rx.recv().await.map_err(Error::Transport)? else {
            self.closed = true;

            return Err(Error::Eof);
        };

        let msg = Message::from_frame(frame)?;

        if msg.code() == Code::CloseSend {
            self.closed = true;

            return Err(Error::Closed);
        }

        Ok(msg)
    }
}

pub struct WriteHalf {
    info: Arc<Info>,
    tx: Box<dyn TransportTx>,
    closed: bool,
}

impl WriteHalf {
    pub fn info(&self) -> &Info {
        &self.info
    }

    pub fn shared_info(&self) -> Arc<Info> {
        self.info.clone()
    }

    pub async fn send(&mut self, msg: Message) -> Result<(), Error> {
        if self.closed {
            debug_assert!(false, "send after close_send");

            return Err(Error::Bug("send after close_send"));
        }

        self.tx
            .send(msg.tunnel_message())
            .await
            .map_err(Error::Transport)
    }

    /// Sends a `CloseSend` frame and closes the underlying send half.
    /// Idempotent.
    pub async fn close_send(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }

        self.closed = true;

        self.tx
            .send(Message::close_send().tunnel_message())
            .await
            .map_err(Error::Transport)?;
        self.tx.close().await.map_err(Error::Transport)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::pipe;
    use crate::{Message, Proto};
    use bytes::Bytes;

    fn test_id() -> ConnId {
        ConnId::new(
            Proto::Tcp,
            "127.0.0.1:1001".parse().unwrap(),
            "192.168.0.1:8080".parse().unwrap(),
        )
    }

    async fn handshake() -> (Stream, Stream) {
        let (client_channel, server_channel) = pipe(8);

        let server = tokio::spawn(Stream::server(server_channel, Tag::Srv));
        let client = Stream::client(
            client_channel,
            test_id(),
            "session-1",
            Duration::from_secs(5),
            Duration::from_millis(7),
            Tag::Cli,
        )
        .await
        .unwrap();
        let server = server.await.unwrap().unwrap();

        (client, server)
    }

    #[tokio::test]
    async fn server_recovers_client_connect_info() {
        let (client, server) = handshake().await;

        assert_eq!(server.id(), client.id());
        assert_eq!(server.session_id(), "session-1");
        assert_eq!(server.dial_timeout(), Duration::from_secs(5));
        assert_eq!(server.roundtrip_latency(), Duration::from_millis(7));
        assert_eq!(server.peer_version(), VERSION);
        assert_eq!(client.peer_version(), VERSION);
    }

    #[tokio::test]
    async fn wrong_first_frame_fails_handshake() {
        let (mut raw, server_channel) = pipe(8);

        let server = tokio::spawn(Stream::server(server_channel, Tag::Srv));

        raw.tx
            .send(Message::normal(Bytes::from_static(b"x")).tunnel_message())
            .await
            .unwrap();

        assert!(matches!(
            server.await.unwrap(),
            Err(Error::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn close_send_surfaces_exactly_one_eof() {
        let (mut client, mut server) = handshake().await;

        client.send(Message::normal(Bytes::from_static(b"x"))).await.unwrap();
        client.close_send().await.unwrap();

        assert_eq!(server.receive().await.unwrap().payload(), "x");
        assert!(matches!(server.receive().await, Err(Error::Closed)));
        assert!(matches!(server.receive().await, Err(Error::Closed)));

        // The server's send half is still usable after the peer's CloseSend.
        server.send(Message::normal(Bytes::from_static(b"y"))).await.unwrap();
        assert_eq!(client.receive().await.unwrap().payload(), "y");
    }
}
