use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted metadata snapshot of one indexed file.
///
/// A record exists if and only if the file existed in the most recent
/// completed scan: created on first observation, updated when mtime or hash
/// changes, removed when a scan no longer observes the path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the project root, with `/` separators. Unique key.
    pub path: String,
    /// File size in bytes at index time.
    pub size: u64,
    /// Last-modified timestamp observed at index time.
    pub mtime: DateTime<Utc>,
    /// SHA-256 of the file bytes, hex encoded, computed in 4 MiB chunks.
    pub content_hash: String,
    /// Lowercased extension without the dot, empty if none.
    pub extension: String,
    /// When this record was last written by a scan.
    pub last_indexed: DateTime<Utc>,
}

impl FileRecord {
    pub fn extension_of(path: &str) -> String {
        std::path::Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default()
    }
}

/// A per-file problem encountered during a scan. Warnings never abort the
/// scan; the file is skipped and reported here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanWarning {
    pub path: String,
    pub reason: String,
}

/// Outcome of one incremental scan: which paths changed relative to the
/// persisted records, plus per-file warnings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanReport {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub errors: Vec<ScanWarning>,
    pub duration_ms: u64,
}

impl ScanReport {
    /// True when the tree matches the persisted records exactly.
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn total_changed(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

/// Summary statistics over the persisted record set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_records: usize,
    pub hashed_records: usize,
    pub newest_index_time: Option<DateTime<Utc>>,
}
