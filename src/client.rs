//! Client side of the protocol: one request, one response, over a single
//! connection. Every response wait is bounded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::checksum::Checksum;
use crate::codec::{receive_body, receive_packet, send_body, send_packet, validate_name, Credentials, Packet, Received};
use crate::config::ClientConfig;
use crate::error::{ProtocolError, Result};
use crate::inventory::FileInventory;
use crate::protocol::{ErrorCode, MAX_PACKET_LEN, MAX_TRANSFER_BODY, TRANSFER_PREFIX_LEN};
use crate::storage::PendingFile;

/// A completed download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub path: PathBuf,
    pub bytes: u64,
    pub checksum: u32,
}

pub struct Client<S> {
    stream: S,
    token: u32,
    buf: Vec<u8>,
    response_timeout: Duration,
}

impl Client<TcpStream> {
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let addr = config.address();
        let limit = config.connect_timeout();
        let stream = match timeout(limit, TcpStream::connect(&addr)).await {
            Ok(stream) => stream?,
            Err(_) => return Err(ProtocolError::Timeout(limit.as_millis() as u64)),
        };
        let _ = stream.set_nodelay(true);
        debug!(addr = %addr, "connected");
        Ok(Self::new(stream, config.buffer_size, config.response_timeout()))
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, buffer_size: usize, response_timeout: Duration) -> Self {
        Self {
            stream,
            token: 0,
            buf: vec![0u8; buffer_size],
            response_timeout,
        }
    }

    /// Current session token; 0 before logon
    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn is_logged_on(&self) -> bool {
        self.token != 0
    }

    pub async fn signup(&mut self, username: &str, password: &str) -> Result<u32> {
        self.authenticate(Packet::Signup(Credentials::new(username, password))).await
    }

    pub async fn logon(&mut self, username: &str, password: &str) -> Result<u32> {
        self.authenticate(Packet::Logon(Credentials::new(username, password))).await
    }

    async fn authenticate(&mut self, request: Packet) -> Result<u32> {
        self.send(&request).await?;
        let rx = self.recv().await?;
        match rx.decode(&self.buf)? {
            Packet::Token => {
                self.token = rx.header.session_token;
                info!(token = self.token, "logged on");
                Ok(self.token)
            }
            other => Err(unexpected(other)),
        }
    }

    /// The server's inventory for this user
    pub async fn list(&mut self) -> Result<FileInventory> {
        self.send(&Packet::ListRequest).await?;
        // A full listing can outgrow the session buffer
        let mut scratch = vec![0u8; MAX_PACKET_LEN];
        let rx = timed_receive(&mut self.stream, &mut scratch, self.response_timeout).await?;
        match rx.decode(&scratch)? {
            Packet::ListResponse(files) => Ok(files),
            other => Err(unexpected(other)),
        }
    }

    /// Send `dir/name` to the server. Local failures are reported before
    /// anything is written to the connection.
    pub async fn upload(&mut self, dir: &Path, name: &str) -> Result<u64> {
        validate_name(name)?;
        let path = dir.join(name);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| ProtocolError::local(&path, e))?;
        if meta.len() > MAX_TRANSFER_BODY as u64 {
            return Err(ProtocolError::FileTooLarge {
                name: name.to_string(),
                size: meta.len(),
            });
        }
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| ProtocolError::local(&path, e))?;
        if data.len() > MAX_TRANSFER_BODY {
            return Err(ProtocolError::FileTooLarge {
                name: name.to_string(),
                size: data.len() as u64,
            });
        }

        let header = Packet::FileTransfer {
            name: name.to_string(),
            body_len: data.len(),
        };
        self.send(&header).await?;
        let chunk = self.buf.len();
        send_body(&mut self.stream, &data, chunk).await?;

        let rx = self.recv().await?;
        match rx.decode(&self.buf)? {
            Packet::FileReceived => Ok(data.len() as u64),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch `name` into `dir`. The file appears only once the whole body has
    /// arrived; a local write failure still drains the body so the connection
    /// stays usable.
    pub async fn download(&mut self, dir: &Path, name: &str) -> Result<Downloaded> {
        validate_name(name)?;
        let dest = dir.join(name);
        let mut pending = PendingFile::create(dir, dest.clone()).map_err(|e| ProtocolError::local(dir, e))?;

        self.send(&Packet::FileRequest { name: name.to_string() }).await?;
        let rx = self.recv().await?;
        let body_len = match rx.decode(&self.buf)? {
            Packet::FileTransfer { name: got, body_len } if got == name => body_len,
            Packet::FileTransfer { .. } => {
                return Err(ProtocolError::Malformed("transfer names a different file"));
            }
            Packet::Error(ErrorCode::Unknown) => return Err(ProtocolError::Refused(name.to_string())),
            other => return Err(unexpected(other)),
        };

        let mut checksum = Checksum::new();
        let mut local_error: Option<std::io::Error> = None;
        let mut sink = |piece: &[u8]| -> Result<()> {
            checksum.update(piece);
            if local_error.is_none() {
                if let Err(e) = pending.write(piece) {
                    local_error = Some(e);
                }
            }
            Ok(())
        };

        let buffered = rx.len - TRANSFER_PREFIX_LEN;
        sink(&self.buf[TRANSFER_PREFIX_LEN..rx.len])?;
        let limit = self.response_timeout;
        receive_body(&mut self.stream, &mut self.buf, body_len - buffered, Some(limit), &mut sink).await?;

        if let Some(e) = local_error {
            let _ = pending.discard();
            return Err(ProtocolError::local(&dest, e));
        }
        let path = pending.commit().map_err(|e| ProtocolError::local(&dest, e))?;
        Ok(Downloaded {
            path,
            bytes: body_len as u64,
            checksum: checksum.value(),
        })
    }

    /// Announce the end of the session; the server closes without replying
    pub async fn leave(&mut self) -> Result<()> {
        self.send(&Packet::Leave).await?;
        self.token = 0;
        Ok(())
    }

    async fn send(&mut self, packet: &Packet) -> Result<()> {
        send_packet(&mut self.stream, packet, self.token, &mut self.buf).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Received> {
        timed_receive(&mut self.stream, &mut self.buf, self.response_timeout).await
    }
}

/// One response packet, the whole wait bounded by `limit`
async fn timed_receive<S>(stream: &mut S, buf: &mut [u8], limit: Duration) -> Result<Received>
where
    S: AsyncRead + Unpin,
{
    match timeout(limit, receive_packet(stream, buf, Some(limit))).await {
        Ok(received) => received,
        Err(_) => Err(ProtocolError::Timeout(limit.as_millis() as u64)),
    }
}

/// A response the request did not ask for. Error packets become `Remote`.
fn unexpected(packet: Packet) -> ProtocolError {
    match packet {
        Packet::Error(code) => ProtocolError::Remote(code),
        other => ProtocolError::UnexpectedPacket(other.label()),
    }
}
