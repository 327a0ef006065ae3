//! File inventories and checksum-keyed set differences
//!
//! An inventory is an unordered set of `(name, checksum)` pairs captured at one
//! point in time. Two entries describe the same file iff their checksums match;
//! names play no part in the comparison.

/// One file in an inventory
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileEntry {
    pub name: String,
    pub checksum: u32,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, checksum: u32) -> Self {
        Self {
            name: name.into(),
            checksum,
        }
    }
}

/// Owned listing of a directory (local) or a user area (remote)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInventory {
    entries: Vec<FileEntry>,
}

impl FileInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: FileEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FileEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn contains_checksum(&self, checksum: u32) -> bool {
        self.entries.iter().any(|e| e.checksum == checksum)
    }
}

impl From<Vec<FileEntry>> for FileInventory {
    fn from(entries: Vec<FileEntry>) -> Self {
        Self { entries }
    }
}

impl FromIterator<FileEntry> for FileInventory {
    fn from_iter<I: IntoIterator<Item = FileEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for FileInventory {
    type Item = FileEntry;
    type IntoIter = std::vec::IntoIter<FileEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a FileInventory {
    type Item = &'a FileEntry;
    type IntoIter = std::slice::Iter<'a, FileEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Every entry of `src` whose checksum does not appear in `dst`.
///
/// O(|src|·|dst|) with no index; inventories are expected to hold at most a few
/// thousand files. Both inputs are left untouched and the result owns copies.
pub fn diff(src: &FileInventory, dst: &FileInventory) -> FileInventory {
    src.iter()
        .filter(|entry| !dst.contains_checksum(entry.checksum))
        .cloned()
        .collect()
}

/// Both one-directional differences between a client and a server inventory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryDiff {
    /// On the server, not on the client: to download
    pub missing_from_client: FileInventory,
    /// On the client, not on the server: to upload
    pub missing_from_server: FileInventory,
}

impl InventoryDiff {
    pub fn is_in_sync(&self) -> bool {
        self.missing_from_client.is_empty() && self.missing_from_server.is_empty()
    }
}

pub fn compute_both_diffs(local: &FileInventory, remote: &FileInventory) -> InventoryDiff {
    InventoryDiff {
        missing_from_client: diff(remote, local),
        missing_from_server: diff(local, remote),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inv(entries: &[(&str, u32)]) -> FileInventory {
        entries.iter().map(|(n, c)| FileEntry::new(*n, *c)).collect()
    }

    #[test]
    fn test_diff_is_asymmetric() {
        let a = inv(&[("n1", 1), ("n2", 2)]);
        let b = inv(&[("n1", 1)]);
        assert_eq!(diff(&a, &b), inv(&[("n2", 2)]));
        assert!(diff(&b, &a).is_empty());
    }

    #[test]
    fn test_diff_ignores_names() {
        let renamed = inv(&[("n3", 1)]);
        let b = inv(&[("n1", 1)]);
        assert!(diff(&renamed, &b).is_empty());

        // Same name, different content is a different file
        let changed = inv(&[("n1", 9)]);
        assert_eq!(diff(&changed, &b), changed);
    }

    #[test]
    fn test_diff_is_repeatable_and_pure() {
        let a = inv(&[("x", 10), ("y", 20), ("z", 30)]);
        let b = inv(&[("y", 20)]);
        let (a0, b0) = (a.clone(), b.clone());

        let first = diff(&a, &b);
        let second = diff(&a, &b);
        assert_eq!(first, second);
        assert_eq!(a, a0);
        assert_eq!(b, b0);
    }

    #[test]
    fn test_diff_against_empty() {
        let a = inv(&[("x", 10), ("y", 20)]);
        let empty = FileInventory::new();
        assert_eq!(diff(&a, &empty), a);
        assert!(diff(&empty, &a).is_empty());
    }

    #[test]
    fn test_duplicate_checksums_are_all_reported() {
        // Two copies of the same content under different names both go missing
        let a = inv(&[("copy1", 5), ("copy2", 5)]);
        let b = inv(&[("other", 6)]);
        assert_eq!(diff(&a, &b).len(), 2);
    }

    #[test]
    fn test_compute_both_diffs_scenario() {
        let client = inv(&[("A", 0x1), ("B", 0x2)]);
        let server = inv(&[("A", 0x1), ("C", 0x3)]);
        let d = compute_both_diffs(&client, &server);
        assert_eq!(d.missing_from_client, inv(&[("C", 0x3)]));
        assert_eq!(d.missing_from_server, inv(&[("B", 0x2)]));
        assert!(!d.is_in_sync());

        let same = compute_both_diffs(&client, &client);
        assert!(same.is_in_sync());
    }
}
