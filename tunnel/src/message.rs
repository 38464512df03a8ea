//! Typed frames carried over the transport.
//!
//! Each transport frame is a single byte sequence whose first byte is the
//! [`Code`] and whose remaining bytes are the code's payload. `Normal` is the
//! only code whose payload is opaque user data.

use std::fmt;
use std::time::Duration;

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};

use crate::{ConnId, Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Code {
    Normal = 0,
    StreamInfo = 1,
    StreamOk = 2,
    DialOk = 3,
    DialReject = 4,
    Disconnect = 5,
    KeepAlive = 6,
    Session = 7,
    CloseSend = 8,
}

impl Code {
    fn from_byte(b: u8) -> Result<Self, Error> {
        match b {
            0 => Ok(Code::Normal),
            1 => Ok(Code::StreamInfo),
            2 => Ok(Code::StreamOk),
            3 => Ok(Code::DialOk),
            4 => Ok(Code::DialReject),
            5 => Ok(Code::Disconnect),
            6 => Ok(Code::KeepAlive),
            7 => Ok(Code::Session),
            8 => Ok(Code::CloseSend),
            b => Err(Error::UnknownCode(b)),
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Normal => "Normal",
            Code::StreamInfo => "StreamInfo",
            Code::StreamOk => "StreamOK",
            Code::DialOk => "DialOK",
            Code::DialReject => "DialReject",
            Code::Disconnect => "Disconnect",
            Code::KeepAlive => "KeepAlive",
            Code::Session => "Session",
            Code::CloseSend => "CloseSend",
        };

        write!(f, "{name}")
    }
}

/// A typed frame: code byte followed by the payload, in a single allocation.
#[derive(Clone, PartialEq, Eq)]
pub struct Message(Bytes);

impl Message {
    pub fn new(code: Code, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();

        let mut buf = BytesMut::with_capacity(1 + payload.len());
        buf.put_u8(code as u8);
        buf.extend_from_slice(&payload);

        Self(buf.freeze())
    }

    /// Decodes a frame received from the transport.
    pub fn from_frame(frame: Bytes) -> Result<Self, Error> {
        let Some(first) = frame.first() else {
            return Err(Error::EmptyFrame);
        };

        Code::from_byte(*first)?;

        Ok(Self(frame))
    }

    pub fn code(&self) -> Code {
        #[expect(clippy::unwrap_used, reason = "Validated on construction.")]
        let code = Code::from_byte(self.0[0]).unwrap();

        code
    }

    pub fn payload(&self) -> Bytes {
        self.0.slice(1..)
    }

    /// The frame to hand to the transport.
    pub fn tunnel_message(&self) -> Bytes {
        self.0.clone()
    }

    pub fn normal(payload: impl Into<Bytes>) -> Self {
        Self::new(Code::Normal, payload)
    }

    pub fn dial_ok() -> Self {
        Self::new(Code::DialOk, Bytes::new())
    }

    pub fn dial_reject() -> Self {
        Self::new(Code::DialReject, Bytes::new())
    }

    pub fn disconnect() -> Self {
        Self::new(Code::Disconnect, Bytes::new())
    }

    pub fn keep_alive() -> Self {
        Self::new(Code::KeepAlive, Bytes::new())
    }

    /// A `Session` frame; the payload is the raw session id, self-delimited by
    /// the transport framing.
    pub fn session(session_id: &str) -> Self {
        Self::new(Code::Session, Bytes::copy_from_slice(session_id.as_bytes()))
    }

    pub(crate) fn close_send() -> Self {
        Self::new(Code::CloseSend, Bytes::new())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("code", &self.code())
            .field("len", &(self.0.len() - 1))
            .finish()
    }
}

/// The decoded contents of a `StreamInfo` frame.
#[derive(Debug, Clone)]
pub struct ConnectInfo {
    pub version: u16,
    pub roundtrip_latency: Duration,
    pub dial_timeout: Duration,
    pub id: ConnId,
    pub session_id: String,
}

/// Encodes a `StreamInfo` frame announcing our version and the flow identity.
///
/// Layout: `varint(version) ‖ varint(roundtrip_latency_ns) ‖
/// varint(dial_timeout_ns) ‖ varint(len_id) ‖ id ‖ varint(len_sid) ‖ sid`.
pub fn stream_info(
    id: &ConnId,
    session_id: &str,
    roundtrip_latency: Duration,
    dial_timeout: Duration,
) -> Message {
    let mut buf = BytesMut::new();
    put_uvarint(&mut buf, u64::from(crate::stream::VERSION));
    put_uvarint(&mut buf, roundtrip_latency.as_nanos() as u64);
    put_uvarint(&mut buf, dial_timeout.as_nanos() as u64);
    put_uvarint(&mut buf, id.as_bytes().len() as u64);
    buf.extend_from_slice(id.as_bytes());
    put_uvarint(&mut buf, session_id.len() as u64);
    buf.extend_from_slice(session_id.as_bytes());

    Message::new(Code::StreamInfo, buf.freeze())
}

/// Decodes a `StreamInfo` payload.
///
/// A truncated varint or a length field exceeding the remaining payload fails
/// with [`Error::MalformedConnect`], regardless of which field was cut short.
pub fn parse_connect_info(payload: Bytes) -> Result<ConnectInfo, Error> {
    let mut buf = payload;

    let version = get_uvarint(&mut buf)
        .and_then(|v| u16::try_from(v).ok())
        .ok_or(Error::MalformedConnect)?;
    let roundtrip_latency = Duration::from_nanos(get_uvarint(&mut buf).ok_or(Error::MalformedConnect)?);
    let dial_timeout = Duration::from_nanos(get_uvarint(&mut buf).ok_or(Error::MalformedConnect)?);

    let id = ConnId::from_bytes(get_prefixed(&mut buf)?).map_err(|_| Error::MalformedConnect)?;
    let session_id = String::from_utf8(get_prefixed(&mut buf)?.to_vec())
        .map_err(|_| Error::MalformedConnect)?;

    Ok(ConnectInfo {
        version,
        roundtrip_latency,
        dial_timeout,
        id,
        session_id,
    })
}

/// Encodes a `StreamOK` frame carrying our version.
pub fn stream_ok(version: u16) -> Message {
    let mut buf = BytesMut::new();
    put_uvarint(&mut buf, u64::from(version));

    Message::new(Code::StreamOk, buf.freeze())
}

/// Decodes the peer version from a `StreamOK` payload.
pub fn parse_stream_ok(payload: Bytes) -> Result<u16, Error> {
    let mut buf = payload;

    get_uvarint(&mut buf)
        .and_then(|v| u16::try_from(v).ok())
        .ok_or(Error::MalformedConnect)
}

fn get_prefixed(buf: &mut Bytes) -> Result<Bytes, Error> {
    let len = get_uvarint(buf).ok_or(Error::MalformedConnect)?;
    let len = usize::try_from(len).map_err(|_| Error::MalformedConnect)?;

    if len > buf.remaining() {
        return Err(Error::MalformedConnect);
    }

    Ok(buf.split_to(len))
}

fn put_uvarint(buf: &mut BytesMut, mut v: u64) {
    while v >= 0x80 {
        buf.put_u8(v as u8 | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

fn get_uvarint(buf: &mut Bytes) -> Option<u64> {
    let mut x = 0u64;
    let mut shift = 0u32;

    for i in 0..10 {
        if !buf.has_remaining() {
            return None;
        }

        let b = buf.get_u8();

        if b < 0x80 {
            if i == 9 && b > 1 {
                return None; // Overflows u64.
            }

            return Some(x | u64::from(b) << shift);
        }

        x |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }

    None
}
