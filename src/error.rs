//! Typed errors for the packet codec, sessions and client operations

use std::path::PathBuf;

use crate::protocol::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("read timed out after {0} ms")]
    Timeout(u64),
    #[error("buffer too small: need {needed} bytes, have {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },
    #[error("packet too large: {len} bytes (limit {limit})")]
    PacketTooLarge { len: usize, limit: usize },
    #[error("protocol version mismatch: got {got}, expected {expected}")]
    VersionMismatch { got: u8, expected: u8 },
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("invalid name {0:?}")]
    InvalidName(String),
    #[error("file {name} is too large to transfer ({size} bytes)")]
    FileTooLarge { name: String, size: u64 },
    #[error("server error: {0}")]
    Remote(ErrorCode),
    /// The server declined to send a file but kept the session open
    #[error("server refused to send {0}")]
    Refused(String),
    #[error("unexpected {0} packet")]
    UnexpectedPacket(&'static str),
    #[error("{}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProtocolError {
    pub fn local(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// Code reported to the peer when this error ends a request
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Self::BufferTooSmall { .. }
            | Self::PacketTooLarge { .. }
            | Self::VersionMismatch { .. }
            | Self::UnknownPacketType(_)
            | Self::Malformed(_)
            | Self::InvalidName(_)
            | Self::UnexpectedPacket(_) => ErrorCode::MalformedRequest,
            Self::Remote(code) => *code,
            _ => ErrorCode::Unknown,
        }
    }

    /// Whether the connection is unusable after this error. Only errors raised
    /// before anything was sent, or answered by a respond-and-continue error
    /// packet, leave the stream in sync.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            Self::LocalIo { .. } | Self::FileTooLarge { .. } | Self::InvalidName(_) | Self::Refused(_) => false,
            Self::Remote(code) => *code != ErrorCode::FileNotExist,
            _ => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
