#![forbid(unsafe_code)]

//! Wire format spoken between two pciemu proxy peers.
//!
//! The stream carries nothing but:
//!
//! ```text
//! code (u32 LE) [ len (u64 LE) | payload (len bytes) ]
//! ```
//!
//! The length/payload pair only follows a [`ProxyRequest::Sync`] code. There is no magic, version
//! or checksum: the transport is assumed to be a reliable, ordered byte stream between trusted
//! peers.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Size of an encoded request code.
pub const CODE_LEN: usize = 4;
/// Size of an encoded payload length.
pub const LENGTH_LEN: usize = 8;

/// Request/reply codes. Numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ProxyRequest {
    /// Placeholder for "nothing to do"; never put on the wire.
    None = 0,
    Ack = 1,
    Ping = 2,
    Pong = 3,
    Reset = 4,
    Quit = 5,
    InterruptNotify = 6,
    Sync = 7,
    SyncRequestToPeer = 8,
    /// Diagnostic reply to a code the receiver does not understand.
    Unrecognized = 0xff,
}

impl ProxyRequest {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::None,
            1 => Self::Ack,
            2 => Self::Ping,
            3 => Self::Pong,
            4 => Self::Reset,
            5 => Self::Quit,
            6 => Self::InterruptNotify,
            7 => Self::Sync,
            8 => Self::SyncRequestToPeer,
            0xff => Self::Unrecognized,
            _ => return None,
        })
    }

    /// Reply a well-behaved peer sends back when this request is issued.
    ///
    /// Replies themselves (and `None`) expect nothing.
    pub const fn expected_reply(self) -> Option<Self> {
        match self {
            Self::Ping => Some(Self::Pong),
            Self::Reset | Self::Quit | Self::InterruptNotify | Self::Sync => Some(Self::Ack),
            Self::SyncRequestToPeer => Some(Self::Sync),
            Self::None | Self::Ack | Self::Pong | Self::Unrecognized => None,
        }
    }

    /// Whether this code is only ever sent as the answer to another request.
    pub const fn is_reply(self) -> bool {
        matches!(self, Self::Ack | Self::Pong | Self::Unrecognized)
    }
}

impl From<ProxyRequest> for u32 {
    fn from(value: ProxyRequest) -> Self {
        value.code()
    }
}

impl TryFrom<u32> for ProxyRequest {
    type Error = DecodeError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or(DecodeError::UnknownCode(code))
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown request code {0:#x}")]
    UnknownCode(u32),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl DecodeError {
    /// True when the peer closed the stream cleanly before a new code started.
    pub fn is_eof(&self) -> bool {
        matches!(self, DecodeError::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}

pub fn encode_code(req: ProxyRequest) -> [u8; CODE_LEN] {
    req.code().to_le_bytes()
}

/// Send a request code. [`ProxyRequest::None`] is swallowed.
pub fn write_request<W: Write + ?Sized>(w: &mut W, req: ProxyRequest) -> io::Result<()> {
    if req == ProxyRequest::None {
        return Ok(());
    }
    w.write_all(&encode_code(req))?;
    w.flush()
}

/// Read a raw request code without interpreting it.
pub fn read_code<R: Read + ?Sized>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; CODE_LEN];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_request<R: Read + ?Sized>(r: &mut R) -> Result<ProxyRequest, DecodeError> {
    let code = read_code(r)?;
    ProxyRequest::try_from(code)
}

pub fn write_len<W: Write + ?Sized>(w: &mut W, len: u64) -> io::Result<()> {
    w.write_all(&len.to_le_bytes())
}

pub fn read_len<R: Read + ?Sized>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; LENGTH_LEN];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Write the `len | payload` tail of a `Sync` exchange.
pub fn write_payload<W: Write + ?Sized>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    write_len(w, payload.len() as u64)?;
    w.write_all(payload)?;
    w.flush()
}
