//! Per-backup file index for directory-set captures.
//!
//! The index records every file seen at capture time (not only the ones that
//! were archived) so the next incremental or differential run can diff
//! against it. Stored locally as `{filename}.index.json` beside the manifest.

use crate::fs::walker::FileInfo;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub const INDEX_SUFFIX: &str = ".index.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndex {
    pub version: u32,
    pub files: HashMap<String, IndexEntry>,
    pub total_files: usize,
    pub total_bytes: u64,
}

/// Metadata for a single file in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub size: u64,
    pub mtime: i64,
}

impl FileIndex {
    pub fn from_files(files: &[FileInfo]) -> Self {
        let entries: HashMap<String, IndexEntry> = files
            .iter()
            .map(|f| {
                (
                    f.key(),
                    IndexEntry {
                        size: f.size,
                        mtime: f.mtime,
                    },
                )
            })
            .collect();

        Self {
            version: 1,
            total_files: entries.len(),
            total_bytes: files.iter().map(|f| f.size).sum(),
            files: entries,
        }
    }
}

/// What a new capture is compared against.
#[derive(Debug, Clone, Copy)]
pub enum ChangeBaseline<'a> {
    /// No base backup: everything is new
    Nothing,
    /// Base has an index: compare size and mtime per path
    Index(&'a FileIndex),
    /// Base has no index (disk image): anything modified after this instant
    ModifiedAfter(i64),
}

/// Result of diffing scanned files against a baseline
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Files to archive (new or modified)
    pub changed: Vec<FileInfo>,
    pub changed_bytes: u64,
    pub unchanged_files: usize,
    pub unchanged_bytes: u64,
    /// Paths present in the baseline index but gone from disk
    pub deleted_files: usize,
}

/// Size + mtime change detection, the same heuristic rsync uses by default.
pub fn diff_against(files: Vec<FileInfo>, baseline: ChangeBaseline<'_>) -> DiffResult {
    let mut result = DiffResult::default();
    let mut seen = HashSet::new();

    for file in files {
        let unchanged = match baseline {
            ChangeBaseline::Nothing => false,
            ChangeBaseline::Index(index) => {
                let key = file.key();
                let same = index
                    .files
                    .get(&key)
                    .is_some_and(|e| e.size == file.size && e.mtime == file.mtime);
                seen.insert(key);
                same
            }
            ChangeBaseline::ModifiedAfter(cutoff) => file.mtime <= cutoff,
        };

        if unchanged {
            result.unchanged_files += 1;
            result.unchanged_bytes += file.size;
        } else {
            result.changed_bytes += file.size;
            result.changed.push(file);
        }
    }

    if let ChangeBaseline::Index(index) = baseline {
        result.deleted_files = index.files.keys().filter(|k| !seen.contains(*k)).count();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file(path: &str, size: u64, mtime: i64) -> FileInfo {
        FileInfo {
            path: PathBuf::from(path),
            size,
            mtime,
        }
    }

    #[test]
    fn test_index_totals() {
        let index = FileIndex::from_files(&[file("/etc/a", 10, 1), file("/etc/b", 5, 2)]);
        assert_eq!(index.total_files, 2);
        assert_eq!(index.total_bytes, 15);
        assert_eq!(index.files["/etc/a"], IndexEntry { size: 10, mtime: 1 });
    }

    #[test]
    fn test_diff_against_index() {
        let base = FileIndex::from_files(&[
            file("/data/file1.txt", 100, 1000),
            file("/data/file2.txt", 200, 2000),
            file("/data/deleted.txt", 50, 500),
        ]);

        let current = vec![
            file("/data/file1.txt", 100, 1000),
            file("/data/file2.txt", 250, 2000),
            file("/data/new_file.txt", 300, 3000),
        ];

        let result = diff_against(current, ChangeBaseline::Index(&base));

        let changed: Vec<_> = result.changed.iter().map(|f| f.key()).collect();
        assert_eq!(changed, vec!["/data/file2.txt", "/data/new_file.txt"]);
        assert_eq!(result.changed_bytes, 550);
        assert_eq!(result.unchanged_files, 1);
        assert_eq!(result.unchanged_bytes, 100);
        assert_eq!(result.deleted_files, 1);
    }

    #[test]
    fn test_diff_against_mtime_cutoff() {
        let current = vec![file("/a", 1, 100), file("/b", 1, 200), file("/c", 1, 201)];
        let result = diff_against(current, ChangeBaseline::ModifiedAfter(200));
        let changed: Vec<_> = result.changed.iter().map(|f| f.key()).collect();
        assert_eq!(changed, vec!["/c"]);
        assert_eq!(result.unchanged_files, 2);
        assert_eq!(result.deleted_files, 0);
    }

    #[test]
    fn test_diff_against_nothing_takes_everything() {
        let current = vec![file("/a", 1, 100), file("/b", 2, 200)];
        let result = diff_against(current, ChangeBaseline::Nothing);
        assert_eq!(result.changed.len(), 2);
        assert_eq!(result.changed_bytes, 3);
    }
}
