#![cfg_attr(test, allow(clippy::unwrap_used))]

//! The tunnel layer: connection-oriented, bidirectional framed streams carried
//! over an opaque byte-frame transport.
//!
//! Each intercepted flow is identified by a [`ConnId`] and runs over its own
//! [`Stream`], established with a version-negotiating handshake. Per-flow
//! handlers ([`Dialer`], [`UdpStream`], [`BidiPipe`]) are deduplicated in a
//! [`HandlerPool`] and relay bytes between a local endpoint and the stream.

mod bidi;
mod connid;
mod dialer;
mod error;
pub mod loops;
pub mod message;
mod pool;
mod probe;
mod timer;
pub mod transport;
mod udp;

pub mod stream;

pub use bidi::BidiPipe;
pub use connid::{ConnId, Proto};
pub use dialer::{Conn, Dialer, PARTLY_CLOSED_TTL, TCP_TTL};
pub use error::Error;
pub use message::{Code, Message};
pub use pool::{Handler, HandlerPool, Release};
pub use probe::{FlowProbes, Probe};
pub use stream::{Stream, Tag, VERSION};
pub use timer::IdleTimer;
pub use udp::{UDP_TTL, UdpListener, UdpStream};

use async_trait::async_trait;

/// Opens a new [`Stream`] to the remote peer for an accepted flow.
///
/// The virtual interface calls this for every flow its stack accepts; the
/// implementation owns the transport multiplexing and the session identity.
#[async_trait]
pub trait StreamCreator: Send + Sync + 'static {
    async fn create_stream(&self, id: &ConnId) -> anyhow::Result<Stream>;
}
