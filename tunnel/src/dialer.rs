//! The per-flow handler relaying a local byte endpoint over a stream.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::loops::{self, MESSAGE_CHANNEL_CAPACITY};
use crate::message::{Code, Message};
use crate::pool::{Handler, Release};
use crate::probe::FlowProbes;
use crate::stream::Stream;
use crate::timer::IdleTimer;
use crate::{ConnId, Error, StreamCreator};

/// Idle TTL for established TCP flows.
pub const TCP_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Idle TTL once a flow is partly closed and only needs to drain.
pub const PARTLY_CLOSED_TTL: Duration = Duration::from_secs(5);

/// Upper bound for a single read from the local endpoint.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A local bidirectional byte endpoint relayed by a [`Dialer`].
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Conn for T {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    NotConnected,
    Connecting,
    Connected,
    Disconnecting,
}

enum StreamSource {
    /// The stream already exists; the local endpoint is dialled from its id.
    Established(Box<Stream>),
    /// The stream is opened lazily against the remote peer; the local
    /// endpoint was handed to us by the stack.
    Create(Arc<dyn StreamCreator>),
}

/// Relays bytes between a local endpoint and a stream, in both directions,
/// honouring the idle timeout.
///
/// State machine: `NotConnected -> Connecting -> Connected -> Disconnecting`.
/// All I/O errors tear the flow down and release the handler; there is no
/// per-flow retry.
pub struct Dialer {
    id: ConnId,
    conn: Mutex<Option<Box<dyn Conn>>>,
    stream_source: Mutex<Option<StreamSource>>,
    state: Mutex<State>,
    idle: IdleTimer,
    probes: FlowProbes,
    release: Release,
    cancel: CancellationToken,
    done: CancellationToken,
    dial_timeout: Duration,
}

impl Dialer {
    /// A dialer for a stream that arrived from the peer: the local endpoint
    /// is dialled from the stream's connection id.
    pub fn from_stream(stream: Stream, release: Release) -> Arc<Self> {
        let dial_timeout = stream.dial_timeout();

        Arc::new(Self {
            id: stream.id().clone(),
            conn: Mutex::new(None),
            stream_source: Mutex::new(Some(StreamSource::Established(Box::new(stream)))),
            state: Mutex::new(State::NotConnected),
            idle: IdleTimer::new(TCP_TTL),
            probes: FlowProbes::default(),
            release,
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            dial_timeout,
        })
    }

    /// A dialer for a locally accepted flow: the stream to the peer is opened
    /// on start and the given endpoint is relayed over it.
    pub fn with_conn(
        id: ConnId,
        conn: impl Conn,
        creator: Arc<dyn StreamCreator>,
        dial_timeout: Duration,
        release: Release,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            conn: Mutex::new(Some(Box::new(conn))),
            stream_source: Mutex::new(Some(StreamSource::Create(creator))),
            state: Mutex::new(State::NotConnected),
            idle: IdleTimer::new(TCP_TTL),
            probes: FlowProbes::default(),
            release,
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            dial_timeout,
        })
    }

    pub fn probes(&self) -> &FlowProbes {
        &self.probes
    }

    /// Marks the flow as draining: state moves to `Disconnecting` and the
    /// idle TTL shortens so a peer that never drains is reaped.
    fn start_disconnect(&self) {
        let mut state = self.state.lock();

        if *state == State::Disconnecting {
            return;
        }

        *state = State::Disconnecting;
        self.idle.set_ttl(PARTLY_CLOSED_TTL);
    }

    async fn run(self: Arc<Self>) {
        match self.clone().run_inner().await {
            Ok(()) => tracing::debug!(id = %self.id, "Flow done"),
            Err(e) if e.is_graceful() => tracing::debug!(id = %self.id, "Flow closed: {e}"),
            Err(e) => tracing::error!(id = %self.id, "Flow failed: {e}"),
        }

        *self.state.lock() = State::NotConnected;
        self.release.release();
        self.done.cancel();
    }

    async fn run_inner(self: Arc<Self>) -> Result<(), Error> {
        let source = self
            .stream_source
            .lock()
            .take()
            .ok_or(Error::Bug("dialer started twice"))?;

        *self.state.lock() = State::Connecting;

        let (stream, conn) = match source {
            StreamSource::Established(stream) => {
                let mut stream = *stream;
                let conn = self.connect_local(&mut stream).await?;

                (stream, conn)
            }
            StreamSource::Create(creator) => {
                let conn = self
                    .conn
                    .lock()
                    .take()
                    .ok_or(Error::Bug("dialer without endpoint"))?;

                let stream = tokio::select! {
                    () = self.cancel.cancelled() => return Err(Error::Cancelled),
                    res = creator.create_stream(&self.id) => {
                        res.map_err(|e| Error::Handshake(format!("{e:#}")))?
                    }
                };

                (stream, conn)
            }
        };

        *self.state.lock() = State::Connected;
        tracing::debug!(id = %self.id, tag = %stream.tag(), "Connected");

        let flow = self.cancel.child_token();

        let (reader, writer) = stream.into_split();
        let (mut msgs, mut errs) = loops::read_loop(
            reader,
            Some(self.probes.stream_to_conn.clone()),
            flow.clone(),
        );

        let (out_tx, out_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let control_tx = out_tx.downgrade();
        let write_done = loops::write_loop(
            writer,
            out_rx,
            Some(self.probes.conn_to_stream.clone()),
            flow.clone(),
        );

        let (mut conn_read, mut conn_write) = tokio::io::split(conn);

        // Conn -> stream: blocking reads of up to 64 KiB, each framed as one
        // `Normal` message. EOF or a read error starts the disconnect.
        let conn_to_stream = tokio::spawn({
            let this = self.clone();
            let flow = flow.clone();

            async move {
                let mut buf = vec![0u8; READ_BUFFER_SIZE];

                loop {
                    let read = tokio::select! {
                        () = flow.cancelled() => break,
                        read = conn_read.read(&mut buf) => read,
                    };

                    match read {
                        Ok(0) => {
                            tracing::debug!(id = %this.id, "Local endpoint closed");
                            this.start_disconnect();
                            break;
                        }
                        Ok(n) => {
                            if !this.idle.reset() {
                                // Reaped concurrently; drop the in-flight bytes.
                                break;
                            }

                            let payload = Bytes::copy_from_slice(&buf[..n]);

                            if out_tx.send(Message::normal(payload)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(id = %this.id, "Failed to read from local endpoint: {e}");
                            this.start_disconnect();
                            break;
                        }
                    }
                }

                // Dropping the sender lets the write loop issue `close_send`.
            }
        });

        // Stream -> conn, plus the idle timer.
        let result = loop {
            tokio::select! {
                () = self.cancel.cancelled() => break Err(Error::Cancelled),
                () = self.idle.expired() => {
                    tracing::debug!(id = %self.id, "Idle timeout expired, disconnecting");

                    // A hard close; `Disconnect` is reserved for this and the
                    // peer must not expect a drain.
                    if let Some(tx) = control_tx.upgrade() {
                        let _ = tx.try_send(Message::disconnect());
                    }

                    break Ok(());
                }
                Some(err) = errs.recv() => break Err(err),
                msg = msgs.recv() => {
                    let Some(msg) = msg else {
                        // Peer closed its send side and we drained every frame.
                        break Ok(());
                    };

                    if let Some(result) = self.handle_message(msg, &mut conn_write).await {
                        break result;
                    }
                }
            }
        };

        self.start_disconnect();
        flow.cancel();

        let _ = conn_write.shutdown().await;
        let _ = conn_to_stream.await;
        let _ = write_done.await;

        result
    }

    /// Dials the local TCP endpoint for a stream that arrived from the peer,
    /// answering with `DialOK` or `DialReject`.
    async fn connect_local(&self, stream: &mut Stream) -> Result<Box<dyn Conn>, Error> {
        let addr = stream.id().destination_addr();
        let dial = tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr));

        let connected = tokio::select! {
            () = self.cancel.cancelled() => return Err(Error::Cancelled),
            res = dial => res,
        };

        match connected {
            Ok(Ok(tcp)) => {
                stream.send(Message::dial_ok()).await?;

                Ok(Box::new(tcp))
            }
            Ok(Err(e)) => {
                tracing::debug!(id = %self.id, "Failed to dial local endpoint: {e}");
                let _ = stream.send(Message::dial_reject()).await;

                Err(Error::LocalIo(e))
            }
            Err(_) => {
                tracing::debug!(id = %self.id, "Dialling the local endpoint timed out");
                let _ = stream.send(Message::dial_reject()).await;

                Err(Error::Timeout("dial"))
            }
        }
    }

    /// Handles one message from the stream. Returns `Some` once the flow is
    /// over.
    async fn handle_message(
        &self,
        msg: Message,
        conn_write: &mut (impl AsyncWrite + Unpin),
    ) -> Option<Result<(), Error>> {
        match msg.code() {
            Code::Normal => {
                if !self.idle.reset() {
                    return Some(Ok(()));
                }

                // write_all retries partial writes until the payload drained.
                if let Err(e) = conn_write.write_all(&msg.payload()).await {
                    return Some(Err(Error::LocalIo(e)));
                }

                None
            }
            Code::Disconnect => {
                tracing::debug!(id = %self.id, "Peer disconnected");

                Some(Ok(()))
            }
            Code::KeepAlive => {
                self.idle.reset();

                None
            }
            Code::DialOk => {
                // Both peers may present as dialers; the extra DialOK is
                // benign.
                tracing::trace!(id = %self.id, "Ignoring DialOK from peer");

                None
            }
            Code::DialReject => {
                // Deliberately NOT in the log-and-continue bucket below: a
                // reject means the remote dial failed and no data will ever
                // arrive, so continuing would park the flow until the idle
                // TTL reaps it. Treated like a disconnect instead.
                tracing::debug!(id = %self.id, "Peer rejected the dial");

                Some(Ok(()))
            }
            Code::StreamInfo | Code::StreamOk | Code::Session | Code::CloseSend => {
                tracing::error!(id = %self.id, code = %msg.code(), "Unexpected message code on established stream");

                None
            }
        }
    }
}

impl Handler for Dialer {
    fn start(self: Arc<Self>) {
        tokio::spawn(self.run());
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
