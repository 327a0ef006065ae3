use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::checksum::checksum_file;
use crate::codec::validate_name;
use crate::inventory::{FileEntry, FileInventory};
use crate::protocol::PARTIAL_PREFIX;
// Directory enumeration: flat listing of regular files with content checksums

/// List the regular files directly inside `dir`.
///
/// Subdirectories, symlinks and in-flight transfer files are skipped, as are
/// names that cannot travel in a name field. Checksums are recomputed on every
/// call. A missing directory is an empty inventory.
pub fn list_files(dir: &Path) -> Result<FileInventory> {
    let mut inventory = FileInventory::new();
    if !dir.exists() {
        return Ok(inventory);
    }

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false) {
        let entry = entry.with_context(|| format!("read directory {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            warn!(path = %entry.path().display(), "skipping file with non UTF-8 name");
            continue;
        };
        if name.starts_with(PARTIAL_PREFIX) {
            continue;
        }
        if validate_name(name).is_err() {
            warn!(file = name, "skipping file whose name cannot be transferred");
            continue;
        }
        // A file that disappears or cannot be read between readdir and hashing
        // is simply left out of this snapshot
        match checksum_file(entry.path()) {
            Ok(checksum) => inventory.push(FileEntry::new(name, checksum)),
            Err(e) => warn!(file = name, error = %e, "skipping unreadable file"),
        }
    }
    debug!(dir = %dir.display(), files = inventory.len(), "listed directory");
    Ok(inventory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum_bytes;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lists_regular_files_only() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.txt"), b"alpha").unwrap();
        fs::write(root.join("b.txt"), b"beta").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub").join("nested.txt"), b"deep").unwrap();
        fs::write(root.join(format!("{PARTIAL_PREFIX}123")), b"half").unwrap();

        let inv = list_files(root).unwrap();
        let mut names: Vec<_> = inv.iter().map(|e| e.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "b.txt"]);

        let a = inv.iter().find(|e| e.name == "a.txt").unwrap();
        assert_eq!(a.checksum, checksum_bytes(b"alpha"));
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let inv = list_files(&temp_dir.path().join("nope")).unwrap();
        assert!(inv.is_empty());
    }

    #[test]
    fn test_overlong_names_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("x".repeat(80)), b"long").unwrap();
        fs::write(temp_dir.path().join("ok"), b"short").unwrap();
        let inv = list_files(temp_dir.path()).unwrap();
        assert_eq!(inv.len(), 1);
    }
}
