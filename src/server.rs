//! Accept loop and connection-slot bookkeeping for the daemon

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::codec::{send_packet, Packet};
use crate::config::ServerConfig;
use crate::protocol::{ErrorCode, HEADER_LEN};
use crate::session::{Services, Session};

/// Fixed number of concurrent sessions. A slot is held by a `SlotGuard` and
/// freed when the guard drops.
pub struct ConnectionTable {
    slots: Mutex<Vec<Option<SocketAddr>>>,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; capacity]),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn active(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    /// Take the first free slot, or `None` when all are in use
    pub fn claim(self: &Arc<Self>, peer: SocketAddr) -> Option<SlotGuard> {
        let mut slots = self.slots.lock();
        let index = slots.iter().position(Option::is_none)?;
        slots[index] = Some(peer);
        Some(SlotGuard {
            table: Arc::clone(self),
            index,
        })
    }
}

pub struct SlotGuard {
    table: Arc<ConnectionTable>,
    index: usize,
}

impl SlotGuard {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.table.slots.lock()[self.index] = None;
    }
}

/// Bind on all interfaces and serve until the process stops
pub async fn serve(config: ServerConfig) -> Result<()> {
    config.validate()?;
    let services = Services::open(&config.data_dir)
        .with_context(|| format!("open data directory {}", config.data_dir.display()))?;
    let bind = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {}", bind))?;
    info!(
        addr = %bind,
        data_dir = %config.data_dir.display(),
        max_connections = config.max_connections,
        "syncbox daemon listening"
    );
    serve_listener(listener, config, services).await
}

/// Accept loop over an already bound listener
pub async fn serve_listener(listener: TcpListener, config: ServerConfig, services: Services) -> Result<()> {
    let services = Arc::new(tokio::sync::Mutex::new(services));
    let table = Arc::new(ConnectionTable::new(config.max_connections));
    let read_timeout = config.read_timeout();

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);

        let Some(slot) = table.claim(peer) else {
            warn!(peer = %peer, active = table.active(), "connection table full, rejecting");
            tokio::spawn(reject_busy(stream));
            continue;
        };
        info!(peer = %peer, slot = slot.index(), "connection accepted");

        let services = Arc::clone(&services);
        let buffer_size = config.buffer_size;
        let span = info_span!("session", peer = %peer, slot = slot.index());
        tokio::spawn(
            async move {
                let session = Session::new(stream, buffer_size, Some(read_timeout));
                let reason = session.run(&services).await;
                info!(%reason, "session closed");
                drop(slot);
            }
            .instrument(span),
        );
    }
}

/// Tell a client there is no free slot, then hang up
async fn reject_busy(mut stream: TcpStream) {
    let mut buf = [0u8; HEADER_LEN + 1];
    if let Err(e) = send_packet(&mut stream, &Packet::Error(ErrorCode::ServerBusy), 0, &mut buf).await {
        debug!(error = %e, "could not deliver busy error");
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{receive_packet, Credentials};
    use crate::protocol::{PacketType, DEFAULT_BUFFER_SIZE};
    use std::time::Duration;
    use tempfile::TempDir;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_slots_are_reused_after_drop() {
        let table = Arc::new(ConnectionTable::new(2));
        let a = table.claim(addr(1)).unwrap();
        let b = table.claim(addr(2)).unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));
        assert!(table.claim(addr(3)).is_none());
        assert_eq!(table.active(), 2);

        drop(a);
        let c = table.claim(addr(3)).unwrap();
        assert_eq!(c.index(), 0);
        assert_eq!(table.capacity(), 2);
    }

    async fn start_server(max_connections: usize) -> (TempDir, SocketAddr) {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            port: 0,
            data_dir: dir.path().to_path_buf(),
            max_connections,
            ..ServerConfig::default()
        };
        let services = Services::open(dir.path()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        tokio::spawn(serve_listener(listener, config, services));
        (dir, local)
    }

    #[tokio::test]
    async fn test_full_table_answers_server_busy() {
        let (_dir, server) = start_server(1).await;
        let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];

        // First client holds the only slot once it has been answered
        let mut first = TcpStream::connect(server).await.unwrap();
        send_packet(&mut first, &Packet::Signup(Credentials::new("alice", "pw")), 0, &mut buf)
            .await
            .unwrap();
        let rx = receive_packet(&mut first, &mut buf, None).await.unwrap();
        assert_eq!(rx.header.kind, PacketType::TokenResponse);

        let mut second = TcpStream::connect(server).await.unwrap();
        let rx = receive_packet(&mut second, &mut buf, None).await.unwrap();
        assert_eq!(rx.header.session_token, 0);
        assert_eq!(rx.decode(&buf).unwrap(), Packet::Error(ErrorCode::ServerBusy));

        // Closing the first session frees the slot
        drop(first);
        let mut admitted = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let Ok(mut third) = TcpStream::connect(server).await else {
                continue;
            };
            let logon = Packet::Logon(Credentials::new("alice", "pw"));
            if send_packet(&mut third, &logon, 0, &mut buf).await.is_err() {
                continue;
            }
            if let Ok(rx) = receive_packet(&mut third, &mut buf, None).await {
                if rx.header.kind == PacketType::TokenResponse {
                    admitted = true;
                    break;
                }
            }
        }
        assert!(admitted);
    }
}
