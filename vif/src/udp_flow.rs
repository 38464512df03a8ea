//! UDP conversations accepted by the stack.
//!
//! UDP needs no connection state machine, so replies are written straight to
//! the TUN device as synthesised packets instead of round-tripping through
//! smoltcp.

use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;
use ip_packet::IpPacket;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tunnel::loops::{self, MESSAGE_CHANNEL_CAPACITY};
use tunnel::{Code, ConnId, Error, Handler, IdleTimer, Message, Release, StreamCreator, UDP_TTL};

/// One UDP conversation between a local source and a cluster destination,
/// relayed over its own stream.
pub struct UdpFlow {
    id: ConnId,
    outbound: mpsc::Sender<IpPacket>,
    creator: Arc<dyn StreamCreator>,
    datagrams: mpsc::Sender<Bytes>,
    datagrams_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    idle: IdleTimer,
    release: Release,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl UdpFlow {
    pub fn new(
        id: ConnId,
        outbound: mpsc::Sender<IpPacket>,
        creator: Arc<dyn StreamCreator>,
        release: Release,
    ) -> Arc<Self> {
        let (datagrams, datagrams_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);

        Arc::new(Self {
            id,
            outbound,
            creator,
            datagrams,
            datagrams_rx: Mutex::new(Some(datagrams_rx)),
            idle: IdleTimer::new(UDP_TTL),
            release,
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        })
    }

    /// Hands an incoming datagram payload to this conversation.
    ///
    /// Never blocks; a full queue drops the datagram.
    pub fn enqueue(&self, payload: Bytes) {
        if !self.idle.reset() {
            tracing::trace!(id = %self.id, "Conversation is being reaped, dropping datagram");
            return;
        }

        if self.datagrams.try_send(payload).is_err() {
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
            .ok_or(Error::Bug("conversation started twice"))?;

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

        // Stack -> stream.
        let datagram_pump = tokio::spawn({
            let flow = flow.clone();

            async move {
                loop {
                    let payload = tokio::select! {
                        () = flow.cancelled() => break,
                        payload = datagrams_rx.recv() => payload,
                    };

                    let Some(payload) = payload else {
                        break;
                    };

                    if out_tx.send(Message::normal(payload)).await.is_err() {
                        break;
                    }
                }
            }
        });

        // Stream -> stack, plus the idle timer.
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

                // Replies flow from the flow's destination back to its source.
                let reply = match ip_packet::make::udp_packet(
                    self.id.destination_addr(),
                    self.id.source_addr(),
                    &msg.payload(),
                ) {
                    Ok(reply) => reply,
                    Err(e) => {
                        tracing::warn!(id = %self.id, "Failed to build reply packet: {e:#}");
                        return None;
                    }
                };

                if self.outbound.send(reply).await.is_err() {
                    return Some(Err(Error::Eof));
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

impl Handler for UdpFlow {
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
