//! One sync pass: compare inventories, upload what the server lacks, then
//! download what the client lacks.
//!
//! A failure that leaves the connection in step (local file gone, file too
//! large, server has no such file) skips that file. Anything else aborts the
//! rest of the queue; finished transfers stay where they are.
//!
//! The server answers a listing in one packet, so uploads stop once the
//! account holds `MAX_LIST_ENTRIES` files.

use anyhow::{Context, Result};
use std::fmt;
use std::path::Path;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::client::Client;
use crate::error::ProtocolError;
use crate::fs_enum::list_files;
use crate::inventory::{compute_both_diffs, FileInventory, InventoryDiff};
use crate::logger::Logger;
use crate::progress::SyncProgress;
use crate::protocol::MAX_LIST_ENTRIES;
use crate::storage::ensure_dir_exists;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub name: String,
    pub direction: Direction,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub uploaded: Vec<String>,
    pub downloaded: Vec<String>,
    pub skipped: Vec<Skipped>,
    /// Downloads whose content no longer matched the listed checksum
    pub changed_on_server: Vec<String>,
    pub bytes: u64,
}

impl SyncReport {
    pub fn transferred(&self) -> usize {
        self.uploaded.len() + self.downloaded.len()
    }

    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.changed_on_server.is_empty()
    }
}

/// Both directions of difference between the server and `dir`
pub async fn diff<S>(client: &mut Client<S>, dir: &Path) -> Result<InventoryDiff>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (local, remote) = inventories(client, dir).await?;
    Ok(compute_both_diffs(&local, &remote))
}

async fn inventories<S>(client: &mut Client<S>, dir: &Path) -> Result<(FileInventory, FileInventory)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote = client.list().await.context("list server files")?;
    let local = list_files(dir)?;
    Ok((local, remote))
}

pub async fn sync<S>(
    client: &mut Client<S>,
    dir: &Path,
    logger: &dyn Logger,
    progress: &SyncProgress,
) -> Result<SyncReport>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    ensure_dir_exists(dir)?;
    let (local, remote) = inventories(client, dir).await?;
    let plan = compute_both_diffs(&local, &remote);
    let mut room = MAX_LIST_ENTRIES.saturating_sub(remote.len());
    let queued = plan.missing_from_server.len() + plan.missing_from_client.len();
    info!(
        uploads = plan.missing_from_server.len(),
        downloads = plan.missing_from_client.len(),
        "sync plan"
    );
    progress.set_total(queued as u64);

    let mut report = SyncReport::default();

    for entry in &plan.missing_from_server {
        let replaces = remote.iter().any(|e| e.name == entry.name);
        if !replaces && room == 0 {
            let reason = format!("server listing is full ({MAX_LIST_ENTRIES} files)");
            logger.error(&Direction::Upload.to_string(), &entry.name, &reason);
            record_skip(Direction::Upload, &entry.name, reason, &mut report, progress);
            continue;
        }
        match client.upload(dir, &entry.name).await {
            Ok(bytes) => {
                if !replaces {
                    room -= 1;
                }
                info!(file = %entry.name, bytes, "uploaded");
                logger.upload_done(&entry.name, bytes);
                progress.file_done("Uploaded", &entry.name, bytes);
                report.uploaded.push(entry.name.clone());
                report.bytes += bytes;
            }
            Err(e) => skip_or_abort(e, Direction::Upload, &entry.name, &mut report, logger, progress)?,
        }
    }

    for entry in &plan.missing_from_client {
        match client.download(dir, &entry.name).await {
            Ok(got) => {
                if got.checksum != entry.checksum {
                    warn!(
                        file = %entry.name,
                        listed = format_args!("{:08x}", entry.checksum),
                        received = format_args!("{:08x}", got.checksum),
                        "file changed on the server during sync"
                    );
                    report.changed_on_server.push(entry.name.clone());
                }
                info!(file = %entry.name, bytes = got.bytes, "downloaded");
                logger.download_done(&entry.name, got.bytes);
                progress.file_done("Downloaded", &entry.name, got.bytes);
                report.downloaded.push(entry.name.clone());
                report.bytes += got.bytes;
            }
            Err(e) => skip_or_abort(e, Direction::Download, &entry.name, &mut report, logger, progress)?,
        }
    }

    let seconds = started.elapsed().as_secs_f64();
    logger.done(
        report.uploaded.len() as u64,
        report.downloaded.len() as u64,
        report.skipped.len() as u64,
        seconds,
    );
    progress.finish_success(report.transferred() as u64);
    Ok(report)
}

fn skip_or_abort(
    e: ProtocolError,
    direction: Direction,
    name: &str,
    report: &mut SyncReport,
    logger: &dyn Logger,
    progress: &SyncProgress,
) -> Result<()> {
    let msg = e.to_string();
    logger.error(&direction.to_string(), name, &msg);
    if e.is_connection_fatal() {
        progress.finish_error(&msg);
        return Err(anyhow::Error::new(e).context(format!("{direction} {name}")));
    }
    record_skip(direction, name, msg, report, progress);
    Ok(())
}

fn record_skip(direction: Direction, name: &str, reason: String, report: &mut SyncReport, progress: &SyncProgress) {
    warn!(file = name, %direction, error = %reason, "skipping file");
    progress.file_skipped(name, &reason);
    report.skipped.push(Skipped {
        name: name.to_string(),
        direction,
        reason,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{receive_packet, send_packet, Packet};
    use crate::inventory::FileInventory;
    use crate::logger::NoopLogger;
    use crate::protocol::{DEFAULT_BUFFER_SIZE, MAX_TRANSFER_BODY};
    use crate::session::{Services, Session};
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::DuplexStream;
    use tokio::sync::Mutex;

    async fn logged_on(server_dir: &TempDir) -> Client<DuplexStream> {
        let services = Arc::new(Mutex::new(Services::open(server_dir.path()).unwrap()));
        let (near, far) = tokio::io::duplex(64 * 1024);
        let session = Session::new(far, DEFAULT_BUFFER_SIZE, Some(Duration::from_secs(5)));
        tokio::spawn(async move { session.run(&services).await });
        let mut client = Client::new(near, DEFAULT_BUFFER_SIZE, Duration::from_secs(5));
        client.signup("alice", "pw").await.unwrap();
        client
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = list_files(dir).unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_sync_converges_both_sides() {
        let server_dir = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let mut client = logged_on(&server_dir).await;
        let remote = server_dir.path().join("users/alice");

        fs::write(local.path().join("a.txt"), b"alpha").unwrap();
        fs::write(local.path().join("b.txt"), b"beta").unwrap();
        fs::write(remote.join("b.txt"), b"beta").unwrap();
        fs::write(remote.join("c.txt"), b"gamma").unwrap();

        let plan = diff(&mut client, local.path()).await.unwrap();
        assert_eq!(plan.missing_from_server.len(), 1);
        assert_eq!(plan.missing_from_client.len(), 1);

        let report = sync(&mut client, local.path(), &NoopLogger, &SyncProgress::hidden())
            .await
            .unwrap();
        assert_eq!(report.uploaded, vec!["a.txt"]);
        assert_eq!(report.downloaded, vec!["c.txt"]);
        assert!(report.is_clean());
        assert_eq!(report.bytes, 10);

        assert_eq!(names(local.path()), vec!["a.txt", "b.txt", "c.txt"]);
        assert_eq!(names(&remote), vec!["a.txt", "b.txt", "c.txt"]);
        assert_eq!(fs::read(local.path().join("c.txt")).unwrap(), b"gamma");

        // Nothing left to do
        let again = sync(&mut client, local.path(), &NoopLogger, &SyncProgress::hidden())
            .await
            .unwrap();
        assert_eq!(again.transferred(), 0);
        assert!(diff(&mut client, local.path()).await.unwrap().is_in_sync());
    }

    #[tokio::test]
    async fn test_renamed_copy_is_not_transferred() {
        let server_dir = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let mut client = logged_on(&server_dir).await;

        fs::write(local.path().join("mine.txt"), b"same bytes").unwrap();
        fs::write(server_dir.path().join("users/alice/theirs.txt"), b"same bytes").unwrap();

        let report = sync(&mut client, local.path(), &NoopLogger, &SyncProgress::hidden())
            .await
            .unwrap();
        assert_eq!(report.transferred(), 0);
    }

    #[tokio::test]
    async fn test_oversized_files_are_skipped() {
        let server_dir = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let mut client = logged_on(&server_dir).await;

        fs::write(local.path().join("big-local.bin"), vec![1u8; MAX_TRANSFER_BODY + 1]).unwrap();
        fs::write(local.path().join("small.txt"), b"fits").unwrap();
        fs::write(server_dir.path().join("users/alice/big-remote.bin"), vec![2u8; MAX_TRANSFER_BODY + 1]).unwrap();

        let report = sync(&mut client, local.path(), &NoopLogger, &SyncProgress::hidden())
            .await
            .unwrap();
        assert_eq!(report.uploaded, vec!["small.txt"]);
        assert!(report.downloaded.is_empty());
        let mut skipped: Vec<_> = report.skipped.iter().map(|s| (s.name.as_str(), s.direction)).collect();
        skipped.sort();
        assert_eq!(
            skipped,
            vec![("big-local.bin", Direction::Upload), ("big-remote.bin", Direction::Download)]
        );
        assert!(!local.path().join("big-remote.bin").exists());
    }

    #[tokio::test]
    async fn test_listing_survives_many_uploads() {
        let server_dir = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let mut client = logged_on(&server_dir).await;

        // More entries than one session buffer holds
        for i in 0..130 {
            fs::write(local.path().join(format!("file{i:03}.txt")), format!("content {i}")).unwrap();
        }
        let report = sync(&mut client, local.path(), &NoopLogger, &SyncProgress::hidden())
            .await
            .unwrap();
        assert_eq!(report.uploaded.len(), 130);
        assert!(report.is_clean());

        assert_eq!(client.list().await.unwrap().len(), 130);
        assert!(diff(&mut client, local.path()).await.unwrap().is_in_sync());
    }

    #[tokio::test]
    async fn test_uploads_stop_at_listing_capacity() {
        let server_dir = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let mut client = logged_on(&server_dir).await;

        let remote = server_dir.path().join("users/alice");
        for i in 0..MAX_LIST_ENTRIES - 1 {
            fs::write(remote.join(format!("s{i:04}")), format!("server {i}")).unwrap();
        }
        fs::write(local.path().join("x1.txt"), b"one").unwrap();
        fs::write(local.path().join("x2.txt"), b"two").unwrap();
        fs::write(local.path().join("x3.txt"), b"three").unwrap();

        let report = sync(&mut client, local.path(), &NoopLogger, &SyncProgress::hidden())
            .await
            .unwrap();
        assert_eq!(report.uploaded.len(), 1);
        assert_eq!(report.skipped.len(), 2);
        assert!(report.skipped.iter().all(|s| s.direction == Direction::Upload));
        assert!(report.skipped.iter().all(|s| s.reason.contains("listing is full")));
        assert_eq!(report.downloaded.len(), MAX_LIST_ENTRIES - 1);

        assert_eq!(client.list().await.unwrap().len(), MAX_LIST_ENTRIES);
    }

    #[tokio::test]
    async fn test_lost_connection_aborts_queue() {
        let local = TempDir::new().unwrap();
        fs::write(local.path().join("one.txt"), b"1").unwrap();
        fs::write(local.path().join("two.txt"), b"22").unwrap();

        // Answers the listing, then hangs up
        let (near, mut far) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
            receive_packet(&mut far, &mut buf, None).await.unwrap();
            send_packet(&mut far, &Packet::ListResponse(FileInventory::new()), 0, &mut buf)
                .await
                .unwrap();
        });

        let mut client = Client::new(near, DEFAULT_BUFFER_SIZE, Duration::from_secs(5));
        let err = sync(&mut client, local.path(), &NoopLogger, &SyncProgress::hidden())
            .await
            .unwrap_err();
        let cause = err.downcast_ref::<ProtocolError>().unwrap();
        assert!(cause.is_connection_fatal());
    }
}
