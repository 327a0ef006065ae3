//! Checksum utilities
//!
//! Files are identified by the CRC-32 (IEEE) of their full contents. This is a
//! change detector, not a cryptographic digest.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Read size used when hashing files
const CHUNK_SIZE: usize = 64 * 1024;

/// Incremental checksum for data that arrives in pieces (e.g. a download body)
#[derive(Default, Clone)]
pub struct Checksum {
    hasher: crc32fast::Hasher,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

/// Checksum of an in-memory buffer
pub fn checksum_bytes(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Checksum of everything a reader yields
pub fn checksum_reader<R: Read>(mut reader: R) -> std::io::Result<u32> {
    let mut sum = Checksum::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        sum.update(&buffer[..n]);
    }
    Ok(sum.value())
}

/// Checksum of a file's full contents, recomputed on every call
pub fn checksum_file(path: &Path) -> Result<u32> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    checksum_reader(file).with_context(|| format!("read {}", path.display()))
}
