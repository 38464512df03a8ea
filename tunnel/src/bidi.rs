//! A relay splicing two streams together.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::loops::{self, MESSAGE_CHANNEL_CAPACITY};
use crate::pool::{Handler, Release};
use crate::probe::FlowProbes;
use crate::stream::Stream;
use crate::ConnId;

/// Splices two streams: everything received on one is sent on the other.
///
/// Used when an accepted flow terminates at another stream instead of a local
/// socket. Once either side ends, the splice winds down both.
pub struct BidiPipe {
    id: ConnId,
    streams: Mutex<Option<(Stream, Stream)>>,
    probes: FlowProbes,
    release: Release,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl BidiPipe {
    pub fn new(a: Stream, b: Stream, release: Release) -> Arc<Self> {
        Arc::new(Self {
            id: a.id().clone(),
            streams: Mutex::new(Some((a, b))),
            probes: FlowProbes::default(),
            release,
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        })
    }

    pub fn probes(&self) -> &FlowProbes {
        &self.probes
    }

    async fn run(self: Arc<Self>) {
        let Some((a, b)) = self.streams.lock().take() else {
            tracing::error!(id = %self.id, "Splice started twice");
            return;
        };

        tracing::debug!(id = %self.id, "Splicing streams");

        let flow = self.cancel.child_token();

        let (a_reader, a_writer) = a.into_split();
        let (b_reader, b_writer) = b.into_split();

        let (a_msgs, _a_errs) = loops::read_loop(
            a_reader,
            Some(self.probes.conn_to_stream.clone()),
            flow.clone(),
        );
        let (b_msgs, _b_errs) = loops::read_loop(
            b_reader,
            Some(self.probes.stream_to_conn.clone()),
            flow.clone(),
        );

        let (to_b_tx, to_b_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let (to_a_tx, to_a_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);

        let a_to_b = tokio::spawn(forward(a_msgs, to_b_tx));
        let b_to_a = tokio::spawn(forward(b_msgs, to_a_tx));

        let b_done = loops::write_loop(b_writer, to_b_rx, None, flow.clone());
        let a_done = loops::write_loop(a_writer, to_a_rx, None, flow.clone());

        // Either direction ending closes its outgoing channel, which makes the
        // write loop close the other stream's send half; the peer answers by
        // closing theirs, ending the opposite direction too.
        let _ = a_to_b.await;
        let _ = b_to_a.await;
        let _ = a_done.await;
        let _ = b_done.await;

        tracing::debug!(id = %self.id, "Splice done");

        self.release.release();
        self.done.cancel();
    }
}

async fn forward(
    mut msgs: mpsc::Receiver<crate::Message>,
    out: mpsc::Sender<crate::Message>,
) {
    while let Some(msg) = msgs.recv().await {
        if out.send(msg).await.is_err() {
            break;
        }
    }
}

impl Handler for BidiPipe {
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
