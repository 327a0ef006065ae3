//! Shared protocol constants for the syncbox packet transport

// Protocol header constants
pub const VERSION: u8 = 1;

/// Fixed header: version (1) | type (1) | packet_len (2, BE) | session_token (4, BE)
pub const HEADER_LEN: usize = 8;

/// `packet_len` is a u16, so no packet can declare more than this many bytes
pub const MAX_PACKET_LEN: usize = u16::MAX as usize;

/// Default per-connection packet buffer
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Smallest buffer that still holds a transfer header plus one list entry
pub const MIN_BUFFER_SIZE: usize = 128;

/// Fixed-width, NUL-padded name field used by list entries and transfer headers
pub const NAME_FIELD_LEN: usize = 64;

/// Longest name (user or file) that fits a name field with its terminator
pub const MAX_NAME_LEN: usize = NAME_FIELD_LEN - 1;

/// Longest password accepted on the wire
pub const MAX_PASSWORD_LEN: usize = 63;

/// One ListResponse entry: name field + 4-byte checksum
pub const LIST_ENTRY_LEN: usize = NAME_FIELD_LEN + 4;

/// Bytes that precede the body of a FileTransfer packet
/// Entries that fit in one ListResponse
pub const MAX_LIST_ENTRIES: usize = (MAX_PACKET_LEN - HEADER_LEN) / LIST_ENTRY_LEN;

pub const TRANSFER_PREFIX_LEN: usize = HEADER_LEN + NAME_FIELD_LEN;

/// Largest file body a single FileTransfer can declare
pub const MAX_TRANSFER_BODY: usize = MAX_PACKET_LEN - TRANSFER_PREFIX_LEN;

pub const DEFAULT_PORT: u16 = 30450;
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Prefix of in-flight upload/download files; never listed or synced
pub const PARTIAL_PREFIX: &str = ".syncbox-partial-";

/// Packet type IDs (numeric values are part of the wire format)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    SignupRequest = 1,
    LogonRequest = 2,
    TokenResponse = 3,
    LeaveRequest = 4,
    ListRequest = 5,
    ListResponse = 6,
    FileRequest = 7,
    FileTransfer = 8,
    FileReceived = 9,
    Error = 10,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::SignupRequest,
            2 => Self::LogonRequest,
            3 => Self::TokenResponse,
            4 => Self::LeaveRequest,
            5 => Self::ListRequest,
            6 => Self::ListResponse,
            7 => Self::FileRequest,
            8 => Self::FileTransfer,
            9 => Self::FileReceived,
            10 => Self::Error,
            _ => return None,
        })
    }

    /// Only FileTransfer may declare more bytes than the receive buffer holds;
    /// the rest of its body is streamed by the handler.
    pub fn is_streamed(self) -> bool {
        matches!(self, Self::FileTransfer)
    }
}

/// Error codes carried by an Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    Unknown = 1,
    MalformedRequest = 2,
    ServerBusy = 3,
    UsernameTaken = 4,
    InvalidPassword = 5,
    FileNotExist = 6,
    UploadFailed = 7,
}

impl ErrorCode {
    /// Unrecognised codes degrade to `Unknown` instead of failing the decode
    pub fn from_u8(v: u8) -> Self {
        match v {
            2 => Self::MalformedRequest,
            3 => Self::ServerBusy,
            4 => Self::UsernameTaken,
            5 => Self::InvalidPassword,
            6 => Self::FileNotExist,
            7 => Self::UploadFailed,
            _ => Self::Unknown,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Unknown => "unknown error",
            Self::MalformedRequest => "malformed request",
            Self::ServerBusy => "server busy",
            Self::UsernameTaken => "username already exists",
            Self::InvalidPassword => "invalid username or password",
            Self::FileNotExist => "file does not exist",
            Self::UploadFailed => "file upload failed",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

// Centralized timeout defaults shared by server and client configs
pub mod timeouts {
    // Bound on each read once a packet or body has started (ms)
    pub const READ_MS: u64 = 30_000;

    // Client wait for a response packet (ms)
    pub const RESPONSE_MS: u64 = 30_000;

    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_ids_are_stable() {
        for v in 1u8..=10 {
            let t = PacketType::from_u8(v).unwrap();
            assert_eq!(t as u8, v);
        }
        assert!(PacketType::from_u8(0).is_none());
        assert!(PacketType::from_u8(11).is_none());
    }

    #[test]
    fn unknown_error_codes_degrade() {
        assert_eq!(ErrorCode::from_u8(6), ErrorCode::FileNotExist);
        assert_eq!(ErrorCode::from_u8(0), ErrorCode::Unknown);
        assert_eq!(ErrorCode::from_u8(200), ErrorCode::Unknown);
    }

    #[test]
    fn transfer_limits_fit_u16() {
        assert_eq!(TRANSFER_PREFIX_LEN + MAX_TRANSFER_BODY, u16::MAX as usize);
        assert!(MIN_BUFFER_SIZE >= TRANSFER_PREFIX_LEN + LIST_ENTRY_LEN - NAME_FIELD_LEN);
        assert_eq!(MAX_LIST_ENTRIES, 963);
        assert!(HEADER_LEN + MAX_LIST_ENTRIES * LIST_ENTRY_LEN <= MAX_PACKET_LEN);
    }
}
