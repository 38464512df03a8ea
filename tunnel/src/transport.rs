//! The seam to the underlying byte-frame transport.
//!
//! The core treats the remote side as an opaque bidirectional frame channel;
//! the session layer owns the real multiplexed RPC stream. Tests and
//! in-process splices use the in-memory [`pipe`].

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Send half of a framed byte transport.
#[async_trait]
pub trait TransportTx: Send + 'static {
    async fn send(&mut self, frame: Bytes) -> io::Result<()>;

    /// Closes the send half; subsequent `send`s fail.
    async fn close(&mut self) -> io::Result<()>;
}

/// Receive half of a framed byte transport.
#[async_trait]
pub trait TransportRx: Send + 'static {
    /// The next frame, or `None` once the peer's send half is closed.
    async fn recv(&mut self) -> io::Result<Option<Bytes>>;
}

/// One endpoint of a bidirectional framed transport.
pub struct Channel {
    pub tx: Box<dyn TransportTx>,
    pub rx: Box<dyn TransportRx>,
}

/// An in-memory transport pair with the given per-direction capacity.
///
/// A full channel blocks the producer; closing one side's send half surfaces
/// as `None` on the peer's receive half.
pub fn pipe(capacity: usize) -> (Channel, Channel) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);

    (
        Channel {
            tx: Box::new(PipeTx(Some(a_tx))),
            rx: Box::new(PipeRx(a_rx)),
        },
        Channel {
            tx: Box::new(PipeTx(Some(b_tx))),
            rx: Box::new(PipeRx(b_rx)),
        },
    )
}

struct PipeTx(Option<mpsc::Sender<Bytes>>);

struct PipeRx(mpsc::Receiver<Bytes>);

#[async_trait]
impl TransportTx for PipeTx {
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        let Some(tx) = &self.0 else {
            return Err(io::ErrorKind::BrokenPipe.into());
        };

        tx.send(frame)
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.0.take();

        Ok(())
    }
}

#[async_trait]
impl TransportRx for PipeRx {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.0.recv().await)
    }
}
