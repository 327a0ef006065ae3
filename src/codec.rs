//! Packet framing over a byte stream
//!
//! Every packet starts with the fixed 8-byte header from `crate::protocol`;
//! `packet_len` covers the header itself. Encoding always targets a caller
//! buffer and fails instead of writing past it. Receiving accumulates partial
//! reads until the declared length is buffered, never reading past the end of
//! the current packet.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{ProtocolError, Result};
use crate::inventory::{FileEntry, FileInventory};
use crate::protocol::{
    ErrorCode, PacketType, HEADER_LEN, LIST_ENTRY_LEN, MAX_NAME_LEN, MAX_PACKET_LEN,
    MAX_PASSWORD_LEN, MAX_TRANSFER_BODY, NAME_FIELD_LEN, TRANSFER_PREFIX_LEN, VERSION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub kind: PacketType,
    pub packet_len: u16,
    pub session_token: u32,
}

impl PacketHeader {
    pub fn payload_len(&self) -> usize {
        (self.packet_len as usize).saturating_sub(HEADER_LEN)
    }
}

/// Build packet header (8 bytes)
/// Format: VERSION (1) | TYPE (1) | PACKET_LEN (2, BE) | SESSION_TOKEN (4, BE)
pub fn build_header(kind: PacketType, packet_len: u16, session_token: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = VERSION;
    header[1] = kind as u8;
    header[2..4].copy_from_slice(&packet_len.to_be_bytes());
    header[4..8].copy_from_slice(&session_token.to_be_bytes());
    header
}

/// Parse and validate a packet header
pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<PacketHeader> {
    let version = header[0];
    if version != VERSION {
        return Err(ProtocolError::VersionMismatch {
            got: version,
            expected: VERSION,
        });
    }
    let kind = PacketType::from_u8(header[1]).ok_or(ProtocolError::UnknownPacketType(header[1]))?;
    let packet_len = u16::from_be_bytes([header[2], header[3]]);
    if (packet_len as usize) < HEADER_LEN {
        return Err(ProtocolError::Malformed("packet_len shorter than header"));
    }
    let session_token = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    Ok(PacketHeader {
        version,
        kind,
        packet_len,
        session_token,
    })
}

/// Username and password of a logon or signup request
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Every packet the protocol knows. The session token travels in the header
/// and is passed alongside, not stored here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Signup(Credentials),
    Logon(Credentials),
    Token,
    Leave,
    ListRequest,
    ListResponse(FileInventory),
    FileRequest { name: String },
    /// Header of a streamed transfer; `body_len` bytes follow the name field
    FileTransfer { name: String, body_len: usize },
    FileReceived,
    Error(ErrorCode),
}

impl Packet {
    pub fn kind(&self) -> PacketType {
        match self {
            Self::Signup(_) => PacketType::SignupRequest,
            Self::Logon(_) => PacketType::LogonRequest,
            Self::Token => PacketType::TokenResponse,
            Self::Leave => PacketType::LeaveRequest,
            Self::ListRequest => PacketType::ListRequest,
            Self::ListResponse(_) => PacketType::ListResponse,
            Self::FileRequest { .. } => PacketType::FileRequest,
            Self::FileTransfer { .. } => PacketType::FileTransfer,
            Self::FileReceived => PacketType::FileReceived,
            Self::Error(_) => PacketType::Error,
        }
    }

    pub fn label(&self) -> &'static str {
        kind_label(self.kind())
    }

    /// Value written into `packet_len`
    pub fn packet_len(&self) -> usize {
        match self {
            Self::FileTransfer { body_len, .. } => TRANSFER_PREFIX_LEN + body_len,
            _ => self.encoded_len(),
        }
    }

    /// Bytes `encode` writes. A transfer header stops after the name field.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + match self {
                Self::Signup(c) | Self::Logon(c) => c.username.len() + 1 + c.password.len() + 1,
                Self::ListResponse(files) => files.len() * LIST_ENTRY_LEN,
                Self::FileRequest { name } => name.len() + 1,
                Self::FileTransfer { .. } => NAME_FIELD_LEN,
                Self::Error(_) => 1,
                Self::Token | Self::Leave | Self::ListRequest | Self::FileReceived => 0,
            }
    }

    /// Encode into `buf`, returning the number of bytes written
    pub fn encode(&self, session_token: u32, buf: &mut [u8]) -> Result<usize> {
        self.validate()?;
        let packet_len = self.packet_len();
        if packet_len > MAX_PACKET_LEN {
            return Err(ProtocolError::PacketTooLarge {
                len: packet_len,
                limit: MAX_PACKET_LEN,
            });
        }
        let len = self.encoded_len();
        if buf.len() < len {
            return Err(ProtocolError::BufferTooSmall {
                needed: len,
                capacity: buf.len(),
            });
        }

        buf[..HEADER_LEN].copy_from_slice(&build_header(
            self.kind(),
            packet_len as u16,
            session_token,
        ));
        let out = &mut buf[HEADER_LEN..len];
        match self {
            Self::Signup(c) | Self::Logon(c) => {
                let (user, rest) = out.split_at_mut(c.username.len() + 1);
                write_cstr(user, &c.username);
                write_cstr(rest, &c.password);
            }
            Self::ListResponse(files) => {
                for (slot, entry) in out.chunks_exact_mut(LIST_ENTRY_LEN).zip(files.iter()) {
                    write_name_field(&mut slot[..NAME_FIELD_LEN], &entry.name);
                    slot[NAME_FIELD_LEN..].copy_from_slice(&entry.checksum.to_be_bytes());
                }
            }
            Self::FileRequest { name } => write_cstr(out, name),
            Self::FileTransfer { name, .. } => write_name_field(out, name),
            Self::Error(code) => out[0] = *code as u8,
            Self::Token | Self::Leave | Self::ListRequest | Self::FileReceived => {}
        }
        Ok(len)
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Signup(c) | Self::Logon(c) => {
                validate_name(&c.username)?;
                if c.password.is_empty() || c.password.len() > MAX_PASSWORD_LEN || c.password.contains('\0') {
                    return Err(ProtocolError::Malformed("password empty, too long or contains NUL"));
                }
            }
            Self::ListResponse(files) => {
                for entry in files {
                    validate_name(&entry.name)?;
                }
            }
            Self::FileRequest { name } => validate_name(name)?,
            Self::FileTransfer { name, body_len } => {
                validate_name(name)?;
                if *body_len > MAX_TRANSFER_BODY {
                    return Err(ProtocolError::FileTooLarge {
                        name: name.clone(),
                        size: *body_len as u64,
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Decode the payload that followed `header`. For a FileTransfer the
    /// payload may be a prefix of the packet; only the name field is consumed.
    pub fn decode(header: &PacketHeader, payload: &[u8]) -> Result<Packet> {
        let packet = match header.kind {
            PacketType::SignupRequest => Self::Signup(parse_credentials(payload)?),
            PacketType::LogonRequest => Self::Logon(parse_credentials(payload)?),
            PacketType::TokenResponse => header_only(payload, Self::Token)?,
            PacketType::LeaveRequest => header_only(payload, Self::Leave)?,
            PacketType::ListRequest => header_only(payload, Self::ListRequest)?,
            PacketType::FileReceived => header_only(payload, Self::FileReceived)?,
            PacketType::ListResponse => {
                if payload.len() % LIST_ENTRY_LEN != 0 {
                    return Err(ProtocolError::Malformed("list payload is not whole entries"));
                }
                let mut files = FileInventory::new();
                for slot in payload.chunks_exact(LIST_ENTRY_LEN) {
                    let name = read_name_field(&slot[..NAME_FIELD_LEN])?;
                    let checksum = u32::from_be_bytes([
                        slot[NAME_FIELD_LEN],
                        slot[NAME_FIELD_LEN + 1],
                        slot[NAME_FIELD_LEN + 2],
                        slot[NAME_FIELD_LEN + 3],
                    ]);
                    files.push(FileEntry::new(name, checksum));
                }
                Self::ListResponse(files)
            }
            PacketType::FileRequest => {
                let (name, rest) =
                    split_cstr(payload).ok_or(ProtocolError::Malformed("file name not terminated"))?;
                if !rest.is_empty() {
                    return Err(ProtocolError::Malformed("trailing bytes after file name"));
                }
                Self::FileRequest {
                    name: decode_name(name)?,
                }
            }
            PacketType::FileTransfer => {
                if (header.packet_len as usize) < TRANSFER_PREFIX_LEN || payload.len() < NAME_FIELD_LEN {
                    return Err(ProtocolError::Malformed("transfer shorter than its name field"));
                }
                Self::FileTransfer {
                    name: read_name_field(&payload[..NAME_FIELD_LEN])?,
                    body_len: header.packet_len as usize - TRANSFER_PREFIX_LEN,
                }
            }
            PacketType::Error => match payload {
                [code] => Self::Error(ErrorCode::from_u8(*code)),
                _ => return Err(ProtocolError::Malformed("error packet must carry one code byte")),
            },
        };
        Ok(packet)
    }
}

pub fn kind_label(kind: PacketType) -> &'static str {
    match kind {
        PacketType::SignupRequest => "SignupRequest",
        PacketType::LogonRequest => "LogonRequest",
        PacketType::TokenResponse => "TokenResponse",
        PacketType::LeaveRequest => "LeaveRequest",
        PacketType::ListRequest => "ListRequest",
        PacketType::ListResponse => "ListResponse",
        PacketType::FileRequest => "FileRequest",
        PacketType::FileTransfer => "FileTransfer",
        PacketType::FileReceived => "FileReceived",
        PacketType::Error => "Error",
    }
}

/// Names double as path components on both ends, so they must be a single
/// plain component that fits a name field.
pub fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if ok {
        Ok(())
    } else {
        Err(ProtocolError::InvalidName(name.to_string()))
    }
}

fn header_only(payload: &[u8], packet: Packet) -> Result<Packet> {
    if payload.is_empty() {
        Ok(packet)
    } else {
        Err(ProtocolError::Malformed("unexpected payload on header-only packet"))
    }
}

fn parse_credentials(payload: &[u8]) -> Result<Credentials> {
    let (user, rest) =
        split_cstr(payload).ok_or(ProtocolError::Malformed("username not terminated"))?;
    if rest.is_empty() {
        return Err(ProtocolError::Malformed("missing password"));
    }
    let (pass, trailing) =
        split_cstr(rest).ok_or(ProtocolError::Malformed("password not terminated"))?;
    if !trailing.is_empty() {
        return Err(ProtocolError::Malformed("trailing bytes after password"));
    }
    if pass.is_empty() {
        return Err(ProtocolError::Malformed("empty password"));
    }
    if pass.len() > MAX_PASSWORD_LEN {
        return Err(ProtocolError::Malformed("password too long"));
    }
    let password = std::str::from_utf8(pass)
        .map_err(|_| ProtocolError::Malformed("password is not UTF-8"))?
        .to_string();
    Ok(Credentials {
        username: decode_name(user)?,
        password,
    })
}

/// Split at the first NUL: (bytes before, bytes after)
fn split_cstr(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let nul = bytes.iter().position(|&b| b == 0)?;
    Some((&bytes[..nul], &bytes[nul + 1..]))
}

fn decode_name(bytes: &[u8]) -> Result<String> {
    let name = std::str::from_utf8(bytes).map_err(|_| ProtocolError::Malformed("name is not UTF-8"))?;
    validate_name(name)?;
    Ok(name.to_string())
}

fn read_name_field(field: &[u8]) -> Result<String> {
    let (name, _padding) =
        split_cstr(field).ok_or(ProtocolError::Malformed("name field not terminated"))?;
    decode_name(name)
}

fn write_name_field(field: &mut [u8], name: &str) {
    field.fill(0);
    field[..name.len()].copy_from_slice(name.as_bytes());
}

fn write_cstr(out: &mut [u8], s: &str) {
    out[..s.len()].copy_from_slice(s.as_bytes());
    out[s.len()] = 0;
}

/// Result of `receive_packet`: the header and how many bytes sit in the buffer.
/// Only a FileTransfer can be incomplete; the handler streams the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub header: PacketHeader,
    pub len: usize,
}

impl Received {
    pub fn is_complete(&self) -> bool {
        self.len == self.header.packet_len as usize
    }

    pub fn payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[HEADER_LEN..self.len]
    }

    pub fn decode(&self, buf: &[u8]) -> Result<Packet> {
        Packet::decode(&self.header, self.payload(buf))
    }
}

/// Read one packet into `buf`.
///
/// Waiting for the first byte is unbounded; every later read is bounded by
/// `read_timeout` when one is given. A zero-byte read is `PeerClosed`. A
/// non-transfer packet larger than `buf` is rejected, not truncated.
pub async fn receive_packet<R>(
    reader: &mut R,
    buf: &mut [u8],
    read_timeout: Option<Duration>,
) -> Result<Received>
where
    R: AsyncRead + Unpin,
{
    if buf.len() < HEADER_LEN {
        return Err(ProtocolError::BufferTooSmall {
            needed: HEADER_LEN,
            capacity: buf.len(),
        });
    }
    let filled = fill_until(reader, buf, 0, HEADER_LEN, read_timeout).await?;

    let mut raw = [0u8; HEADER_LEN];
    raw.copy_from_slice(&buf[..HEADER_LEN]);
    let header = parse_header(&raw)?;

    let declared = header.packet_len as usize;
    let target = if declared <= buf.len() {
        declared
    } else if header.kind.is_streamed() {
        buf.len()
    } else {
        return Err(ProtocolError::PacketTooLarge {
            len: declared,
            limit: buf.len(),
        });
    };
    let len = fill_until(reader, buf, filled, target, read_timeout).await?;
    Ok(Received { header, len })
}

/// Keep reading into `buf[filled..target]` until it is full
async fn fill_until<R>(
    reader: &mut R,
    buf: &mut [u8],
    mut filled: usize,
    target: usize,
    read_timeout: Option<Duration>,
) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    while filled < target {
        let limit = if filled == 0 { None } else { read_timeout };
        filled += read_some(reader, &mut buf[filled..target], limit).await?;
    }
    Ok(filled)
}

async fn read_some<R>(reader: &mut R, dst: &mut [u8], limit: Option<Duration>) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let n = match limit {
        Some(d) => match timeout(d, reader.read(dst)).await {
            Ok(res) => res?,
            Err(_) => return Err(ProtocolError::Timeout(d.as_millis() as u64)),
        },
        None => reader.read(dst).await?,
    };
    if n == 0 {
        return Err(ProtocolError::PeerClosed);
    }
    Ok(n)
}

/// Encode `packet` into `buf` and write it out
pub async fn send_packet<W>(writer: &mut W, packet: &Packet, session_token: u32, buf: &mut [u8]) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let len = packet.encode(session_token, buf)?;
    writer.write_all(&buf[..len]).await?;
    writer.flush().await?;
    Ok(len)
}

/// Stream a transfer body in chunks of at most `chunk` bytes
pub async fn send_body<W>(writer: &mut W, body: &[u8], chunk: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    for piece in body.chunks(chunk.max(1)) {
        writer.write_all(piece).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read exactly `remaining` body bytes, handing each piece to `sink`. Every
/// read is bounded by `read_timeout`: the body is already in flight.
pub async fn receive_body<R, F>(
    reader: &mut R,
    buf: &mut [u8],
    mut remaining: usize,
    read_timeout: Option<Duration>,
    mut sink: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]) -> Result<()>,
{
    while remaining > 0 {
        let want = remaining.min(buf.len());
        let n = read_some(reader, &mut buf[..want], read_timeout).await?;
        sink(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}
