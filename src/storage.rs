//! Server-side storage: one flat directory per user under the data root

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::codec::validate_name;
use crate::fs_enum::list_files;
use crate::inventory::FileInventory;
use crate::protocol::PARTIAL_PREFIX;

#[derive(Debug, Clone)]
pub struct UserStore {
    root: PathBuf,
}

impl UserStore {
    /// Open (creating if needed) the data root
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        ensure_dir_exists(&root)?;
        Ok(Self { root })
    }

    /// Directory of `username`; the name must be a single plain component
    pub fn user_dir(&self, username: &str) -> Result<PathBuf> {
        validate_name(username).with_context(|| format!("bad user name {username:?}"))?;
        Ok(self.root.join(username))
    }

    /// Create the user's area. Succeeds if it already exists.
    pub fn create_user_area(&self, username: &str) -> Result<()> {
        let dir = self.user_dir(username)?;
        ensure_dir_exists(&dir)
    }

    pub fn list(&self, username: &str) -> Result<FileInventory> {
        list_files(&self.user_dir(username)?)
    }

    /// Path of `name` inside the user's area
    pub fn file_path(&self, username: &str, name: &str) -> Result<PathBuf> {
        validate_name(name).with_context(|| format!("bad file name {name:?}"))?;
        Ok(self.user_dir(username)?.join(name))
    }

    /// Start receiving `name` into the user's area
    pub fn begin_upload(&self, username: &str, name: &str) -> Result<PendingFile> {
        let dest = self.file_path(username, name)?;
        let dir = self.user_dir(username)?;
        ensure_dir_exists(&dir)?;
        PendingFile::create(&dir, dest).with_context(|| format!("create temporary file in {}", dir.display()))
    }
}

/// A file being received. Bytes go to a hidden temporary file next to the
/// destination; `commit` renames it into place, dropping it deletes it.
pub struct PendingFile {
    tmp: NamedTempFile,
    dest: PathBuf,
    written: u64,
}

impl PendingFile {
    pub fn create(dir: &Path, dest: PathBuf) -> std::io::Result<Self> {
        let tmp = tempfile::Builder::new().prefix(PARTIAL_PREFIX).tempfile_in(dir)?;
        Ok(Self {
            tmp,
            dest,
            written: 0,
        })
    }

    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.tmp.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Flush and move into place, replacing any existing file
    pub fn commit(mut self) -> std::io::Result<PathBuf> {
        self.tmp.flush()?;
        self.tmp.persist(&self.dest).map_err(|e| e.error)?;
        Ok(self.dest)
    }

    /// Delete the partial file now instead of at drop
    pub fn discard(self) -> std::io::Result<()> {
        self.tmp.close()
    }
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))?;
    }
    Ok(())
}
