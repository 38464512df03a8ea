use std::io;

/// Errors produced by the tunnel layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The first frame of a handshake was not what the protocol demands.
    #[error("stream handshake failed: {0}")]
    Handshake(String),
    /// A `StreamInfo` payload could not be decoded.
    #[error("malformed connect info")]
    MalformedConnect,
    /// A connection id on the wire had an invalid length or protocol byte.
    #[error("malformed connection id")]
    MalformedConnId,
    /// The message code byte is not a known value.
    #[error("unknown message code {0}")]
    UnknownCode(u8),
    /// A transport frame without even a code byte.
    #[error("empty frame")]
    EmptyFrame,
    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
    /// The underlying transport ended without the peer closing the stream.
    #[error("transport closed")]
    Eof,
    /// The peer closed its send half; no more `Normal` frames will arrive.
    #[error("stream closed by peer")]
    Closed,
    /// Reading or writing a local socket failed.
    #[error("local i/o error: {0}")]
    LocalIo(#[source] io::Error),
    /// A deadline elapsed.
    #[error("{0} timed out")]
    Timeout(&'static str),
    /// The surrounding context was cancelled.
    #[error("cancelled")]
    Cancelled,
    /// An invariant was violated. This is a bug.
    #[error("bug: {0}")]
    Bug(&'static str),
}

impl Error {
    /// Whether this is an expected end-of-flow condition.
    ///
    /// Graceful conditions are logged at debug level by the loops; everything
    /// else is an error.
    pub fn is_graceful(&self) -> bool {
        matches!(self, Error::Eof | Error::Closed | Error::Cancelled)
    }
}
