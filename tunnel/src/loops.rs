//! Utility loops adapting a stream's `receive`/`send` to bounded channels.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::message::{Code, Message};
use crate::probe::Probe;
use crate::stream::{ReadHalf, WriteHalf};
use crate::Error;

/// Capacity of the per-stream message channels.
pub const MESSAGE_CHANNEL_CAPACITY: usize = 50;

/// Spawns a task pumping `reader` into a message channel.
///
/// Every received message is forwarded in order. On a terminal condition
/// (cancellation, transport error, EOF, peer `CloseSend`) both channels close;
/// at most one error is emitted before closing, and graceful ends emit none.
/// Payload bytes of `Normal` messages are counted on `probe`.
pub fn read_loop(
    mut reader: ReadHalf,
    probe: Option<Probe>,
    cancel: CancellationToken,
) -> (mpsc::Receiver<Message>, mpsc::Receiver<Error>) {
    let (msg_tx, msg_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
    let (err_tx, err_rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let info = reader.shared_info();

        loop {
            let msg = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!(id = %info.id, tag = %info.tag, "Read loop cancelled");
                    break;
                }
                msg = reader.receive() => msg,
            };

            match msg {
                Ok(msg) => {
                    if msg.code() == Code::Normal
                        && let Some(probe) = &probe
                    {
                        probe.increment(msg.payload().len() as u64);
                    }

                    if msg_tx.send(msg).await.is_err() {
                        break; // Consumer is gone.
                    }
                }
                Err(e) if e.is_graceful() => {
                    tracing::debug!(id = %info.id, tag = %info.tag, "Read loop done: {e}");
                    break;
                }
                Err(e) => {
                    tracing::error!(id = %info.id, tag = %info.tag, "Read loop failed: {e}");
                    let _ = err_tx.try_send(e);
                    break;
                }
            }
        }
    });

    (msg_rx, err_rx)
}

/// Spawns a task draining `msgs` into `writer`.
///
/// Once the channel closes (or the loop is cancelled), issues `close_send`
/// and resolves the returned handle. Payload bytes of `Normal` messages are
/// counted on `probe`.
pub fn write_loop(
    mut writer: WriteHalf,
    mut msgs: mpsc::Receiver<Message>,
    probe: Option<Probe>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let info = writer.shared_info();

        loop {
            let msg = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!(id = %info.id, tag = %info.tag, "Write loop cancelled");
                    break;
                }
                msg = msgs.recv() => msg,
            };

            let Some(msg) = msg else {
                break;
            };

            if msg.code() == Code::Normal
                && let Some(probe) = &probe
            {
                probe.increment(msg.payload().len() as u64);
            }

            match writer.send(msg).await {
                Ok(()) => {}
                Err(e) if e.is_graceful() => {
                    tracing::debug!(id = %info.id, tag = %info.tag, "Write loop done: {e}");
                    return;
                }
                Err(e) => {
                    tracing::error!(id = %info.id, tag = %info.tag, "Write loop failed: {e}");
                    return;
                }
            }
        }

        if let Err(e) = writer.close_send().await {
            tracing::debug!(id = %info.id, tag = %info.tag, "Failed to close send half: {e}");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Stream, Tag};
    use crate::transport::pipe;
    use crate::{ConnId, Proto};
    use bytes::Bytes;
    use std::time::Duration;

    async fn connected_pair() -> (Stream, Stream) {
        let (client_channel, server_channel) = pipe(8);
        let id = ConnId::new(
            Proto::Tcp,
            "127.0.0.1:1001".parse().unwrap(),
            "192.168.0.1:8080".parse().unwrap(),
        );

        let server = tokio::spawn(Stream::server(server_channel, Tag::Srv));
        let client = Stream::client(
            client_channel,
            id,
            "s",
            Duration::from_secs(1),
            Duration::ZERO,
            Tag::Cli,
        )
        .await
        .unwrap();

        (client, server.await.unwrap().unwrap())
    }

    #[tokio::test]
    async fn write_loop_closes_stream_when_channel_closes() {
        let (client, mut server) = connected_pair().await;
        let (_, writer) = client.into_split();

        let (tx, rx) = mpsc::channel(8);
        let done = write_loop(writer, rx, None, CancellationToken::new());

        tx.send(Message::normal(Bytes::from_static(b"data")))
            .await
            .unwrap();
        drop(tx);

        done.await.unwrap();

        assert_eq!(server.receive().await.unwrap().payload(), "data");
        assert!(matches!(server.receive().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn read_loop_counts_normal_bytes_and_closes() {
        let (mut client, server) = connected_pair().await;
        let (reader, _writer) = server.into_split();

        let probe = Probe::new();
        let (mut msgs, mut errs) =
            read_loop(reader, Some(probe.clone()), CancellationToken::new());

        client
            .send(Message::normal(Bytes::from_static(b"1234")))
            .await
            .unwrap();
        client.send(Message::keep_alive()).await.unwrap();
        client.close_send().await.unwrap();

        assert_eq!(msgs.recv().await.unwrap().code(), Code::Normal);
        assert_eq!(msgs.recv().await.unwrap().code(), Code::KeepAlive);
        assert!(msgs.recv().await.is_none());
        assert!(errs.recv().await.is_none());
        assert_eq!(probe.value(), 4);
    }
}
