//! UDP multiplexing: one local socket, one stream per conversation.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::loops::{self, MESSAGE_CHANNEL_CAPACITY};
use crate::message::{Code, Message};
use crate::pool::{Handler, HandlerPool, Release};
use crate::timer::IdleTimer;
use crate::{ConnId, Error, Proto, StreamCreator};

/// Idle TTL for UDP conversations, in either direction.
pub const UDP_TTL: Duration = Duration::from_secs(60);

const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Multiplexes many UDP conversations over a single local socket.
///
/// Each unique `(source -> target)` pair becomes one [`UdpStream`] handler,
/// deduplicated through the pool.
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    pool: HandlerPool,
    creator: Arc<dyn StreamCreator>,
    cancel: CancellationToken,
}

impl UdpListener {
    pub fn new(
        socket: UdpSocket,
        target: SocketAddr,
        pool: HandlerPool,
        creator: Arc<dyn StreamCreator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            socket: Arc::new(socket),
            target,
            pool,
            creator,
            cancel,
        }
    }

    pub async fn run(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let received = tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("UDP listener cancelled");
                    break;
                }
                received = self.socket.recv_from(&mut buf) => received,
            };

            let (n, peer) = match received {
                Ok(ok) => ok,
                Err(e) => {
                    tracing::error!("Failed to receive on UDP socket: {e}");
                    break;
                }
            };

            let id = ConnId::new(Proto::Udp, peer, self.target);
            let datagram = Bytes::copy_from_slice(&buf[..n]);

            if let Err(e) = self.dispatch(&id, datagram) {
                tracing::error!(%id, "Failed to dispatch datagram: {e:#}");
            }
        }
    }

    fn dispatch(&self, id: &ConnId, datagram: Bytes) -> anyhow::Result<()> {
        let (handler, _existed) = self.pool.get_or_create(id, |release| {
            Ok(UdpStream::new(
                id.clone(),
                self.socket.clone(),
                self.creator.clone(),
                release,
            ) as Arc<dyn Handler>)
        })?;

        let Some(udp) = handler.as_any().downcast_ref::<UdpStream>() else {
            anyhow::bail!("handler for {id} is not a UDP stream");
        };

        udp.enqueue(datagram);

        Ok(())
    }
}

/// One UDP conversation relayed over its own stream.
pub struct UdpStream {
    id: ConnId,
    socket: Arc<UdpSocket>,
    creator: Arc<dyn StreamCreator>,
    datagrams: mpsc::Sender<Bytes>,
    datagrams_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    idle: IdleTimer,
    release: Release,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl UdpStream {
    pub fn new(
        id: ConnId,
        socket: Arc<UdpSocket>,
        creator: Arc<dyn StreamCreator>,
        release: Release,
    ) -> Arc<Self> {
        let (datagrams, datagrams_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);

        Arc::new(Self {
            id,
            socket,
            creator,
            datagrams,
            datagrams_rx: Mutex::new(Some(datagrams_rx)),
            idle: IdleTimer::new(UDP_TTL),
            release,
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        })
    }

    /// Hands an incoming datagram to this conversation.
    ///
    /// Never blocks; a full queue drops the datagram, which is fine for UDP.
    pub fn enqueue(&self, datagram: Bytes) {
        if !self.idle.reset() {
            tracing::trace!(id = %self.id, "Conversation is being reaped, dropping datagram");
            return;
        }

        if self.datagrams.try_send(datagram).is_err() {
            tracing::trace!(id = %self.id, "Conversation queue full, dropping datagram");
        }
    }

    async fn run(self: Arc<Self>) {
        match self.clone().run_inner().await {
            Ok(()) => tracing::debug!(id = %self.id, "Conversation done"),
            Err(e) if e.is_graceful() => tracing::debug!(id = %self.id, "Conversation closed: {e}"),
            Err(e) => tracing::error!(id = %self.id, "Conversation failed: {e}"),
        }

        self.release.release();
        self.done.cancel();
    }

    async fn run_inner(self: Arc<Self>) -> Result<(), Error> {
        let mut datagrams_rx = self
            .datagrams_rx
            .lock()
            .take()
            .ok_or(Error::Bug("udp stream started twice"))?;

        let stream = tokio::select! {
            () = self.cancel.cancelled() => return Err(Error::Cancelled),
            res = self.creator.create_stream(&self.id) => {
                res.map_err(|e| Error::Handshake(format!("{e:#}")))?
            }
        };

        let flow = self.cancel.child_token();

        let (reader, writer) = stream.into_split();
        let (mut msgs, mut errs) = loops::read_loop(reader, None, flow.clone());

        let (out_tx, out_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let write_done = loops::write_loop(writer, out_rx, None, flow.clone());

        // Socket -> stream.
        let datagram_pump = tokio::spawn({
            let flow = flow.clone();

            async move {
                loop {
                    let datagram = tokio::select! {
                        () = flow.cancelled() => break,
                        datagram = datagrams_rx.recv() => datagram,
                    };

                    let Some(datagram) = datagram else {
                        break;
                    };

                    if out_tx.send(Message::normal(datagram)).await.is_err() {
                        break;
                    }
                }
            }
        });

        // Stream -> socket, plus the idle timer.
        let result = loop {
            tokio::select! {
                () = self.cancel.cancelled() => break Err(Error::Cancelled),
                () = self.idle.expired() => {
                    tracing::debug!(id = %self.id, "Conversation idle, disconnecting");
                    break Ok(());
                }
                Some(err) = errs.recv() => break Err(err),
                msg = msgs.recv() => {
                    let Some(msg) = msg else {
                        break Ok(());
                    };

                    if let Some(result) = self.handle_message(msg).await {
                        break result;
                    }
                }
            }
        };

        flow.cancel();

        let _ = datagram_pump.await;
        let _ = write_done.await;

        result
    }

    async fn handle_message(&self, msg: Message) -> Option<Result<(), Error>> {
        match msg.code() {
            Code::Normal => {
                if !self.idle.reset() {
                    return Some(Ok(()));
                }

                let reply_to = self.id.source_addr();

                if let Err(e) = self.socket.send_to(&msg.payload(), reply_to).await {
                    return Some(Err(Error::LocalIo(e)));
                }

                None
            }
            Code::DialReject => {
                tracing::debug!(id = %self.id, "Peer rejected the conversation");

                Some(Ok(()))
            }
            Code::Disconnect => {
                tracing::debug!(id = %self.id, "Peer disconnected");

                Some(Ok(()))
            }
            Code::DialOk
            | Code::KeepAlive
            | Code::Session
            | Code::StreamInfo
            | Code::StreamOk
            | Code::CloseSend => {
                tracing::trace!(id = %self.id, code = %msg.code(), "Ignoring control message");

                None
            }
        }
    }
}

impl Handler for UdpStream {
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
