//! Server-side session state machine
//!
//! One `Session` per accepted connection. Every inbound packet is checked
//! against the session token, decoded, and dispatched to a handler; the
//! handler's outcome decides whether to reply, stay quiet, or send one error
//! and close. `Unauthenticated -> Authenticated -> Closed`.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::Result as AnyResult;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::auth::{Authenticator, PasswordFile};
use crate::codec::{receive_body, receive_packet, send_body, send_packet, Credentials, Packet, Received};
use crate::error::ProtocolError;
use crate::protocol::{ErrorCode, MAX_PACKET_LEN, MAX_TRANSFER_BODY, TRANSFER_PREFIX_LEN};
use crate::storage::UserStore;

/// The oracles a session consults. Held behind one lock so requests from
/// different connections never interleave.
pub struct Services {
    pub auth: Box<dyn Authenticator>,
    pub store: UserStore,
}

impl Services {
    pub fn new(auth: Box<dyn Authenticator>, store: UserStore) -> Self {
        Self { auth, store }
    }

    /// Password file and user areas under one data directory
    pub fn open(data_dir: &Path) -> AnyResult<Self> {
        let store = UserStore::open(data_dir.join("users"))?;
        let auth = PasswordFile::new(data_dir.join("password.dat"));
        Ok(Self::new(Box::new(auth), store))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated { username: String },
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent LeaveRequest
    Leave,
    /// Header token did not match the session token
    TokenMismatch,
    /// An Error packet with this code was sent before closing
    Fatal(ErrorCode),
    /// Peer went away, timed out, or a write failed
    Transport(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leave => f.write_str("client left"),
            Self::TokenMismatch => f.write_str("wrong session token"),
            Self::Fatal(code) => write!(f, "fatal: {code}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Continue,
    Closed(CloseReason),
}

/// Successful handler outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    /// Send the first n bytes of the session buffer
    Send(usize),
    /// The handler already wrote its reply
    Streamed,
    /// End the session without a response
    Close,
}

/// Failed handler outcome
#[derive(Debug)]
enum Fault {
    /// Send one Error packet, then close
    Fatal(ErrorCode),
    /// The connection is unusable; close without a response
    Transport(ProtocolError),
}

impl From<ErrorCode> for Fault {
    fn from(code: ErrorCode) -> Self {
        Fault::Fatal(code)
    }
}

type HandlerResult = std::result::Result<Reply, Fault>;

pub struct Session<S> {
    stream: S,
    state: SessionState,
    token: u32,
    buf: Vec<u8>,
    read_timeout: Option<Duration>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, buffer_size: usize, read_timeout: Option<Duration>) -> Self {
        Self {
            stream,
            state: SessionState::Unauthenticated,
            token: 0,
            buf: vec![0u8; buffer_size],
            read_timeout,
        }
    }

    /// Serve requests until the session closes
    pub async fn run(mut self, services: &Mutex<Services>) -> CloseReason {
        loop {
            if let Step::Closed(reason) = self.serve_next(services).await {
                return reason;
            }
        }
    }

    /// Receive, validate and answer one request
    pub async fn serve_next(&mut self, services: &Mutex<Services>) -> Step {
        let received = match receive_packet(&mut self.stream, &mut self.buf, self.read_timeout).await {
            Ok(r) => r,
            Err(e) => return self.receive_failed(e).await,
        };
        if received.header.session_token != self.token {
            warn!(
                got = received.header.session_token,
                expected = self.token,
                "wrong session token"
            );
            return self.close(CloseReason::TokenMismatch).await;
        }

        let outcome = {
            let mut services = services.lock().await;
            self.dispatch(received, &mut services).await
        };

        match outcome {
            Ok(Reply::Send(len)) => match self.write_reply(len).await {
                Ok(()) => Step::Continue,
                Err(e) => self.close(CloseReason::Transport(e.to_string())).await,
            },
            Ok(Reply::Streamed) => Step::Continue,
            Ok(Reply::Close) => self.close(CloseReason::Leave).await,
            Err(Fault::Fatal(code)) => self.fail(code).await,
            Err(Fault::Transport(e)) => self.close(CloseReason::Transport(e.to_string())).await,
        }
    }

    async fn write_reply(&mut self, len: usize) -> std::io::Result<()> {
        self.stream.write_all(&self.buf[..len]).await?;
        self.stream.flush().await
    }

    async fn receive_failed(&mut self, e: ProtocolError) -> Step {
        match e {
            ProtocolError::PeerClosed | ProtocolError::Io(_) | ProtocolError::Timeout(_) => {
                debug!(error = %e, "receive failed");
                self.close(CloseReason::Transport(e.to_string())).await
            }
            _ => {
                warn!(error = %e, "rejecting packet");
                self.fail(e.wire_code()).await
            }
        }
    }

    async fn dispatch(&mut self, received: Received, services: &mut Services) -> HandlerResult {
        let packet = received.decode(&self.buf).map_err(|e| {
            warn!(error = %e, "malformed {}", crate::codec::kind_label(received.header.kind));
            Fault::Fatal(e.wire_code())
        })?;

        let label = packet.label();
        match packet {
            Packet::Signup(credentials) => self.handle_logon(credentials, true, services),
            Packet::Logon(credentials) => self.handle_logon(credentials, false, services),
            Packet::Leave => {
                info!(user = self.username_for_log(), "client leaving");
                Ok(Reply::Close)
            }
            Packet::ListRequest => self.handle_list(services).await,
            Packet::FileRequest { name } => self.handle_file_request(&name, services).await,
            Packet::FileTransfer { name, body_len } => {
                self.handle_file_transfer(received, &name, body_len, services).await
            }
            Packet::Token | Packet::ListResponse(_) | Packet::FileReceived | Packet::Error(_) => {
                warn!("client sent a {label} packet");
                Err(ErrorCode::MalformedRequest.into())
            }
        }
    }

    fn handle_logon(&mut self, credentials: Credentials, is_signup: bool, services: &mut Services) -> HandlerResult {
        let Credentials { username, password } = credentials;
        let accepted = if is_signup {
            info!(user = %username, "signup");
            services.auth.create(&username, &password)
        } else {
            info!(user = %username, "logon");
            services.auth.check(&username, &password)
        };
        match accepted {
            Ok(true) => {}
            Ok(false) if is_signup => {
                info!(user = %username, "username already exists");
                return Err(ErrorCode::UsernameTaken.into());
            }
            Ok(false) => {
                info!(user = %username, "invalid password");
                return Err(ErrorCode::InvalidPassword.into());
            }
            Err(e) => {
                error!(error = %e, "authentication backend failed");
                return Err(ErrorCode::Unknown.into());
            }
        }

        if let Err(e) = services.store.create_user_area(&username) {
            error!(user = %username, error = %e, "cannot create user area");
            return Err(ErrorCode::Unknown.into());
        }

        self.token = mint_token();
        self.state = SessionState::Authenticated { username };
        self.reply(&Packet::Token)
    }

    async fn handle_list(&mut self, services: &mut Services) -> HandlerResult {
        let username = self.username()?;
        let files = services.store.list(&username).map_err(|e| {
            error!(user = %username, error = %e, "listing failed");
            Fault::Fatal(ErrorCode::Unknown)
        })?;
        info!(user = %username, files = files.len(), "list");

        // A full listing can outgrow the session buffer
        let packet = Packet::ListResponse(files);
        let mut scratch = vec![0u8; packet.encoded_len().min(MAX_PACKET_LEN)];
        let len = packet.encode(self.token, &mut scratch).map_err(|e| {
            error!(user = %username, error = %e, "cannot encode listing");
            Fault::Fatal(ErrorCode::Unknown)
        })?;
        self.stream
            .write_all(&scratch[..len])
            .await
            .map_err(|e| Fault::Transport(e.into()))?;
        self.stream.flush().await.map_err(|e| Fault::Transport(e.into()))?;
        Ok(Reply::Streamed)
    }

    async fn handle_file_request(&mut self, name: &str, services: &mut Services) -> HandlerResult {
        let username = self.username()?;
        let path = services
            .store
            .file_path(&username, name)
            .map_err(|_| Fault::Fatal(ErrorCode::MalformedRequest))?;

        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                info!(user = %username, file = name, "requested path is not a file");
                return self.reply(&Packet::Error(ErrorCode::FileNotExist));
            }
            Err(e) => {
                info!(user = %username, file = name, error = %e, "requested file does not exist");
                return self.reply(&Packet::Error(ErrorCode::FileNotExist));
            }
        };
        if size > MAX_TRANSFER_BODY as u64 {
            warn!(file = name, bytes = size, "file too large for a single transfer");
            return self.reply(&Packet::Error(ErrorCode::Unknown));
        }
        let data = match tokio::fs::read(&path).await {
            Ok(data) if data.len() <= MAX_TRANSFER_BODY => data,
            Ok(data) => {
                warn!(file = name, bytes = data.len(), "file grew past the transfer limit");
                return self.reply(&Packet::Error(ErrorCode::Unknown));
            }
            Err(e) => {
                info!(user = %username, file = name, error = %e, "requested file does not exist");
                return self.reply(&Packet::Error(ErrorCode::FileNotExist));
            }
        };

        let header = Packet::FileTransfer {
            name: name.to_string(),
            body_len: data.len(),
        };
        let chunk = self.buf.len();
        send_packet(&mut self.stream, &header, self.token, &mut self.buf)
            .await
            .map_err(Fault::Transport)?;
        send_body(&mut self.stream, &data, chunk)
            .await
            .map_err(Fault::Transport)?;
        info!(user = %username, file = name, bytes = data.len(), "file sent");
        Ok(Reply::Streamed)
    }

    async fn handle_file_transfer(
        &mut self,
        received: Received,
        name: &str,
        body_len: usize,
        services: &mut Services,
    ) -> HandlerResult {
        let username = self.username()?;
        info!(user = %username, file = name, bytes = body_len, "receiving upload");

        let mut pending = services.store.begin_upload(&username, name).map_err(|e| {
            error!(file = name, error = %e, "cannot open upload target");
            Fault::Fatal(ErrorCode::UploadFailed)
        })?;
        let dest = pending.dest().to_path_buf();

        // Body bytes that arrived with the header
        let buffered = &self.buf[TRANSFER_PREFIX_LEN..received.len];
        let remaining = body_len - buffered.len();
        let mut result = pending
            .write(buffered)
            .map_err(|e| ProtocolError::local(&dest, e));
        if result.is_ok() {
            result = receive_body(&mut self.stream, &mut self.buf, remaining, self.read_timeout, |piece| {
                pending.write(piece).map_err(|e| ProtocolError::local(&dest, e))
            })
            .await;
        }

        if let Err(e) = result {
            warn!(file = name, received = pending.written(), expected = body_len, error = %e, "upload interrupted, discarding partial file");
            if let Err(e) = pending.discard() {
                error!(file = name, error = %e, "failed to delete partial upload");
            }
            return Err(ErrorCode::UploadFailed.into());
        }

        pending.commit().map_err(|e| {
            error!(file = name, error = %e, "cannot move upload into place");
            Fault::Fatal(ErrorCode::UploadFailed)
        })?;
        info!(user = %username, file = name, bytes = body_len, "file received");
        self.reply(&Packet::FileReceived)
    }

    /// Encode a response into the session buffer
    fn reply(&mut self, packet: &Packet) -> HandlerResult {
        let len = packet.encode(self.token, &mut self.buf).map_err(|e| {
            error!(error = %e, "cannot encode {}", packet.label());
            Fault::Fatal(ErrorCode::Unknown)
        })?;
        Ok(Reply::Send(len))
    }

    fn username(&self) -> std::result::Result<String, Fault> {
        match &self.state {
            SessionState::Authenticated { username } => Ok(username.clone()),
            _ => {
                warn!("request before logon");
                Err(ErrorCode::MalformedRequest.into())
            }
        }
    }

    fn username_for_log(&self) -> &str {
        match &self.state {
            SessionState::Authenticated { username } => username,
            _ => "-",
        }
    }

    /// Send one Error packet, then close
    async fn fail(&mut self, code: ErrorCode) -> Step {
        if let Err(e) = send_packet(&mut self.stream, &Packet::Error(code), self.token, &mut self.buf).await {
            debug!(error = %e, "could not deliver error packet");
        }
        self.close(CloseReason::Fatal(code)).await
    }

    async fn close(&mut self, reason: CloseReason) -> Step {
        let _ = self.stream.shutdown().await;
        self.state = SessionState::Closed;
        self.token = 0;
        Step::Closed(reason)
    }
}

/// Non-zero random token; 0 is reserved for "not logged on". Not
/// cryptographically meaningful.
fn mint_token() -> u32 {
    loop {
        let token: u32 = rand::random();
        if token != 0 {
            return token;
        }
    }
}
