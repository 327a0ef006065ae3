//! Credential checks for logon and signup
//!
//! `PasswordFile` keeps fixed-size records: the user name NUL-padded to 64
//! bytes followed by the 16-byte MD5 of the password. MD5 is not a password
//! hash worth the name; the transport is unauthenticated anyway.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::protocol::{MAX_NAME_LEN, MAX_PASSWORD_LEN, NAME_FIELD_LEN};

const HASH_LEN: usize = 16;
const RECORD_LEN: usize = NAME_FIELD_LEN + HASH_LEN;

pub trait Authenticator: Send + Sync {
    /// True iff `username` exists and `password` matches
    fn check(&self, username: &str, password: &str) -> Result<bool>;
    /// Register a new user. False if the name is taken or the credentials are out of bounds.
    fn create(&self, username: &str, password: &str) -> Result<bool>;
}

pub struct PasswordFile {
    path: PathBuf,
}

impl PasswordFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Vec<u8>> {
        match fs::read(&self.path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("read {}", self.path.display())),
        }
    }

    fn find(&self, username: &str) -> Result<Option<[u8; HASH_LEN]>> {
        let data = self.load()?;
        // A torn trailing record is ignored
        for record in data.chunks_exact(RECORD_LEN) {
            let field = &record[..NAME_FIELD_LEN];
            let end = field.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD_LEN);
            if &field[..end] == username.as_bytes() {
                let mut hash = [0u8; HASH_LEN];
                hash.copy_from_slice(&record[NAME_FIELD_LEN..]);
                return Ok(Some(hash));
            }
        }
        Ok(None)
    }
}

fn in_bounds(username: &str, password: &str) -> bool {
    (1..=MAX_NAME_LEN).contains(&username.len()) && (1..=MAX_PASSWORD_LEN).contains(&password.len())
}

fn hash_password(password: &str) -> [u8; HASH_LEN] {
    md5::compute(password.as_bytes()).0
}

impl Authenticator for PasswordFile {
    fn check(&self, username: &str, password: &str) -> Result<bool> {
        if !in_bounds(username, password) {
            return Ok(false);
        }
        Ok(self.find(username)? == Some(hash_password(password)))
    }

    fn create(&self, username: &str, password: &str) -> Result<bool> {
        if !in_bounds(username, password) || self.find(username)?.is_some() {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let mut record = [0u8; RECORD_LEN];
        record[..username.len()].copy_from_slice(username.as_bytes());
        record[NAME_FIELD_LEN..].copy_from_slice(&hash_password(password));

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        f.write_all(&record)?;
        f.flush()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn db() -> (TempDir, PasswordFile) {
        let dir = TempDir::new().unwrap();
        let file = PasswordFile::new(dir.path().join("password.dat"));
        (dir, file)
    }

    #[test]
    fn test_signup_then_logon() {
        let (_dir, auth) = db();
        assert!(!auth.check("alice", "pw").unwrap());
        assert!(auth.create("alice", "pw").unwrap());
        assert!(auth.check("alice", "pw").unwrap());
        assert!(!auth.check("alice", "wrong").unwrap());
        assert!(!auth.check("alic", "pw").unwrap());
    }

    #[test]
    fn test_duplicate_username_is_taken() {
        let (_dir, auth) = db();
        assert!(auth.create("bob", "one").unwrap());
        assert!(!auth.create("bob", "two").unwrap());
        assert!(auth.check("bob", "one").unwrap());
        assert!(auth.create("bobby", "two").unwrap());
        assert_eq!(fs::metadata(auth.path()).unwrap().len(), 2 * RECORD_LEN as u64);
    }

    #[test]
    fn test_bounds() {
        let (_dir, auth) = db();
        assert!(!auth.create("", "pw").unwrap());
        assert!(!auth.create("carol", "").unwrap());
        assert!(!auth.create(&"u".repeat(64), "pw").unwrap());
        assert!(!auth.create("carol", &"p".repeat(64)).unwrap());
        assert!(auth.create(&"u".repeat(63), &"p".repeat(63)).unwrap());
        assert!(auth.check(&"u".repeat(63), &"p".repeat(63)).unwrap());
    }

    #[test]
    fn test_parent_directory_is_created_or_reported() {
        let dir = TempDir::new().unwrap();
        let nested = PasswordFile::new(dir.path().join("a/b/password.dat"));
        assert!(nested.create("dana", "pw").unwrap());
        assert!(nested.check("dana", "pw").unwrap());

        // A plain file where the parent directory should be
        fs::write(dir.path().join("blocker"), b"x").unwrap();
        let blocked = PasswordFile::new(dir.path().join("blocker/password.dat"));
        assert!(blocked.create("dana", "pw").is_err());
    }
}
