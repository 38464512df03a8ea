//! The session: one multiplexed transport to the cluster agent, carrying all
//! streams.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tunnel::transport::Channel;
use tunnel::{ConnId, HandlerPool, Stream, StreamCreator, Tag};

/// Opens a new framed channel over the session's multiplexed transport.
///
/// The real implementation sits on the RPC connection to the cluster; the
/// core never sees more than this.
#[async_trait]
pub trait TransportOpener: Send + Sync + 'static {
    async fn open(&self) -> Result<Channel>;
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub session_id: String,
    /// Carried in every handshake so the peer knows how long to wait for its
    /// dial.
    pub dial_timeout: Duration,
    /// Last measured roundtrip to the peer, carried in every handshake.
    pub roundtrip_latency: Duration,
}

/// The transport carrying a session died. The session itself may be retried
/// by the caller.
#[derive(Debug, thiserror::Error)]
#[error("transport for session {session_id} ended unexpectedly")]
pub struct SessionError {
    pub session_id: String,
}

/// Ties the transport, the handler pool and the stream handshakes together.
///
/// Per-flow errors never reach this level; only the death of the transport
/// does, tearing down every carried stream and surfacing a retryable error.
pub struct Session {
    config: SessionConfig,
    pool: HandlerPool,
    creator: Arc<SessionStreams>,
    cancel: CancellationToken,
    transport_done: CancellationToken,
}

impl Session {
    /// `transport_done` must be cancelled by the transport owner when the
    /// underlying RPC stream ends.
    pub fn new(
        config: SessionConfig,
        opener: Arc<dyn TransportOpener>,
        transport_done: CancellationToken,
    ) -> Self {
        let creator = Arc::new(SessionStreams {
            config: config.clone(),
            opener,
        });

        Self {
            config,
            pool: HandlerPool::new(),
            creator,
            cancel: CancellationToken::new(),
            transport_done,
        }
    }

    pub fn pool(&self) -> HandlerPool {
        self.pool.clone()
    }

    pub fn stream_creator(&self) -> Arc<dyn StreamCreator> {
        self.creator.clone()
    }

    pub fn session_id(&self) -> &str {
        &self.config.session_id
    }

    /// Runs until cancelled or until the transport dies, then closes every
    /// handler.
    pub async fn run(&self) -> Result<(), SessionError> {
        let result = tokio::select! {
            () = self.cancel.cancelled() => {
                tracing::debug!(session_id = %self.config.session_id, "Session cancelled");
                Ok(())
            }
            () = self.transport_done.cancelled() => {
                tracing::info!(session_id = %self.config.session_id, "Transport ended, tearing down streams");
                Err(SessionError {
                    session_id: self.config.session_id.clone(),
                })
            }
        };

        self.pool.close_all().await;

        result
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// The [`StreamCreator`] handed to the virtual interface: every accepted flow
/// becomes a client stream over a fresh transport channel.
struct SessionStreams {
    config: SessionConfig,
    opener: Arc<dyn TransportOpener>,
}

#[async_trait]
impl StreamCreator for SessionStreams {
    async fn create_stream(&self, id: &ConnId) -> Result<Stream> {
        let channel = self
            .opener
            .open()
            .await
            .with_context(|| format!("Failed to open transport channel for {id}"))?;

        let stream = Stream::client(
            channel,
            id.clone(),
            self.config.session_id.clone(),
            self.config.dial_timeout,
            self.config.roundtrip_latency,
            Tag::Cli,
        )
        .await
        .with_context(|| format!("Failed to establish stream for {id}"))?;

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel::transport::pipe;

    struct LoopbackOpener;

    #[async_trait]
    impl TransportOpener for LoopbackOpener {
        async fn open(&self) -> Result<Channel> {
            let (client, server) = pipe(8);

            tokio::spawn(async move {
                let _ = Stream::server(server, Tag::Srv).await;
            });

            Ok(client)
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            session_id: "session-1".to_string(),
            dial_timeout: Duration::from_secs(5),
            roundtrip_latency: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn creates_client_streams() {
        let session = Session::new(
            config(),
            Arc::new(LoopbackOpener),
            CancellationToken::new(),
        );

        let id = ConnId::new(
            tunnel::Proto::Tcp,
            "127.0.0.1:1001".parse().unwrap(),
            "192.168.0.1:8080".parse().unwrap(),
        );

        let stream = session.stream_creator().create_stream(&id).await.unwrap();

        assert_eq!(stream.id(), &id);
        assert_eq!(stream.session_id(), "session-1");
        assert_eq!(stream.tag(), Tag::Cli);
    }

    #[tokio::test]
    async fn transport_death_surfaces_a_retryable_error() {
        let transport_done = CancellationToken::new();
        let session = Session::new(config(), Arc::new(LoopbackOpener), transport_done.clone());

        transport_done.cancel();

        let err = session.run().await.unwrap_err();
        assert_eq!(err.session_id, "session-1");
    }

    #[tokio::test]
    async fn stop_ends_the_session_cleanly() {
        let session = Session::new(
            config(),
            Arc::new(LoopbackOpener),
            CancellationToken::new(),
        );

        session.stop();

        session.run().await.unwrap();
    }
}
