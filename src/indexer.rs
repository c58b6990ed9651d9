use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::content::ChunkedFileReader;
use crate::scanner::{TreeWalker, WalkedFile};
use crate::storage::StorageBackend;
use crate::types::error::{CoreError, Result};
use crate::types::file::{FileRecord, IndexStats, ScanReport, ScanWarning};

/// A file the diff pass decided needs work.
enum Unit {
    /// No record exists for the path.
    Added(WalkedFile),
    /// Mtime or size differs from the record; the hash decides.
    MaybeModified(WalkedFile, FileRecord),
}

impl Unit {
    fn path(&self) -> &str {
        match self {
            Unit::Added(walked) => &walked.rel_path,
            Unit::MaybeModified(walked, _) => &walked.rel_path,
        }
    }
}

enum UnitOutcome {
    Added(FileRecord),
    Modified(FileRecord),
    /// Hash matched despite an mtime difference: reclassified unchanged,
    /// record carries the refreshed mtime.
    Refreshed(FileRecord),
    Failed(ScanWarning),
    /// Cancelled before this unit started; nothing was lost.
    Skipped,
}

/// Drives incremental scans: diffs one consistent directory walk against the
/// persisted FileRecords and (re)indexes only the changed subset through a
/// bounded worker pool. Readers are never blocked by an in-progress scan;
/// they may observe partially updated records until the scan completes.
pub struct IncrementalIndexer {
    root: PathBuf,
    walker: Arc<TreeWalker>,
    metadata: Arc<dyn StorageBackend>,
    workers: usize,
}

impl IncrementalIndexer {
    pub fn new(root: impl Into<PathBuf>, walker: TreeWalker, metadata: Arc<dyn StorageBackend>) -> Self {
        Self {
            root: root.into(),
            walker: Arc::new(walker),
            metadata,
            workers: num_cpus::get().max(1),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Loads all persisted records. A record that fails to deserialize is
    /// dropped from the store and rebuilt by the next scan instead of being
    /// surfaced as a fault.
    fn load_records(&self) -> HashMap<String, FileRecord> {
        let items = match self.metadata.items() {
            Ok(items) => items,
            Err(err) => {
                warn!(error = %err, "metadata store unreadable, treating as empty");
                return HashMap::new();
            }
        };

        let mut records = HashMap::with_capacity(items.len());
        for (key, raw) in items {
            match decode_record(&key, &raw) {
                Ok(record) => {
                    records.insert(key, record);
                }
                Err(err) => {
                    warn!(error = %err, "dropping unreadable file record");
                    let _ = self.metadata.delete(&key);
                }
            }
        }
        records
    }

    /// Fetches one record by path. Corrupt entries read as missing.
    pub fn record(&self, path: &str) -> Result<Option<FileRecord>> {
        let Some(raw) = self.metadata.get(path)? else {
            return Ok(None);
        };
        match decode_record(path, &raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(error = %err, "dropping unreadable file record");
                let _ = self.metadata.delete(path);
                Ok(None)
            }
        }
    }

    /// Runs one incremental scan. Cancellation is cooperative and checked
    /// between file units: at most one file's processing is lost, and
    /// records persisted by completed units remain valid.
    pub async fn scan(&self, token: &CancellationToken) -> Result<ScanReport> {
        let start = Instant::now();

        let walker = self.walker.clone();
        let root = self.root.clone();
        let outcome = tokio::task::spawn_blocking(move || walker.walk(&root))
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        let mut warnings = outcome.warnings;

        let stored = self.load_records();
        let current: HashSet<&str> = outcome.files.iter().map(|f| f.rel_path.as_str()).collect();

        let mut deleted: Vec<String> = stored
            .keys()
            .filter(|path| !current.contains(path.as_str()))
            .cloned()
            .collect();
        deleted.sort();

        let mut units = Vec::new();
        for walked in outcome.files {
            match stored.get(&walked.rel_path) {
                None => units.push(Unit::Added(walked)),
                Some(record)
                    if record.mtime != walked.mtime || record.size != walked.size =>
                {
                    units.push(Unit::MaybeModified(walked, record.clone()));
                }
                Some(_) => {}
            }
        }
        debug!(
            candidates = units.len(),
            deleted = deleted.len(),
            "scan classified directory snapshot"
        );

        // Workers hash and build records concurrently; the aggregation loop
        // below is the single serialized writer.
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(units.len());
        for unit in units {
            if token.is_cancelled() {
                break;
            }
            let semaphore = semaphore.clone();
            let token = token.clone();
            let root = self.root.clone();
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return UnitOutcome::Skipped;
                };
                if token.is_cancelled() {
                    return UnitOutcome::Skipped;
                }
                let path = unit.path().to_string();
                tokio::task::spawn_blocking(move || process_unit(&root, unit))
                    .await
                    .unwrap_or_else(|e| {
                        UnitOutcome::Failed(ScanWarning {
                            path,
                            reason: format!("worker panicked: {e}"),
                        })
                    })
            }));
        }

        let mut added = Vec::new();
        let mut modified = Vec::new();
        for joined in futures::future::join_all(handles).await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    warnings.push(ScanWarning {
                        path: "(worker)".to_string(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            match outcome {
                UnitOutcome::Added(record) => {
                    let path = record.path.clone();
                    if let Some(warning) = self.persist(&record) {
                        warnings.push(warning);
                    } else {
                        added.push(path);
                    }
                }
                UnitOutcome::Modified(record) => {
                    let path = record.path.clone();
                    if let Some(warning) = self.persist(&record) {
                        warnings.push(warning);
                    } else {
                        modified.push(path);
                    }
                }
                UnitOutcome::Refreshed(record) => {
                    // Not a real change; write through the refreshed mtime so
                    // the next scan skips the rehash.
                    if let Some(warning) = self.persist(&record) {
                        warnings.push(warning);
                    }
                }
                UnitOutcome::Failed(warning) => {
                    warn!(path = %warning.path, reason = %warning.reason, "file skipped");
                    warnings.push(warning);
                }
                UnitOutcome::Skipped => {}
            }
        }

        if token.is_cancelled() {
            info!(
                persisted = added.len() + modified.len(),
                "scan cancelled, completed units kept"
            );
            return Err(CoreError::Cancelled);
        }

        // Deletions apply only when the scan ran to completion, so that the
        // persisted set reflects exactly this walk.
        for path in &deleted {
            if let Err(err) = self.metadata.delete(path) {
                warnings.push(ScanWarning {
                    path: path.clone(),
                    reason: err.to_string(),
                });
            }
        }

        added.sort();
        modified.sort();

        let report = ScanReport {
            added,
            modified,
            deleted,
            errors: warnings,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            added = report.added.len(),
            modified = report.modified.len(),
            deleted = report.deleted.len(),
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "scan complete"
        );
        Ok(report)
    }

    /// Scan with a deadline. A timeout cancels the shared token, taking the
    /// same cooperative-abort path as an explicit cancellation.
    pub async fn scan_with_timeout(
        &self,
        token: &CancellationToken,
        timeout: Duration,
    ) -> Result<ScanReport> {
        let watchdog = token.clone();
        let guard = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            watchdog.cancel();
        });
        let result = self.scan(token).await;
        guard.abort();
        result
    }

    pub fn stats(&self) -> IndexStats {
        let records = self.load_records();
        IndexStats {
            total_records: records.len(),
            hashed_records: records
                .values()
                .filter(|r| !r.content_hash.is_empty())
                .count(),
            newest_index_time: records.values().map(|r| r.last_indexed).max(),
        }
    }

    fn persist(&self, record: &FileRecord) -> Option<ScanWarning> {
        let raw = match serde_json::to_vec(record) {
            Ok(raw) => raw,
            Err(err) => {
                return Some(ScanWarning {
                    path: record.path.clone(),
                    reason: err.to_string(),
                })
            }
        };
        match self.metadata.put(&record.path, &raw) {
            Ok(()) => None,
            Err(err) => Some(ScanWarning {
                path: record.path.clone(),
                reason: err.to_string(),
            }),
        }
    }
}

/// Hashes one candidate file and decides its classification. Runs on the
/// blocking pool; any I/O failure turns into a per-file warning.
fn process_unit(root: &Path, unit: Unit) -> UnitOutcome {
    match unit {
        Unit::Added(walked) => {
            match ChunkedFileReader::new(root.join(&walked.rel_path)).compute_hash() {
                Ok(hash) => UnitOutcome::Added(build_record(&walked, hash)),
                Err(err) => UnitOutcome::Failed(ScanWarning {
                    path: walked.rel_path,
                    reason: err.to_string(),
                }),
            }
        }
        Unit::MaybeModified(walked, stored) => {
            match ChunkedFileReader::new(root.join(&walked.rel_path)).compute_hash() {
                Ok(hash) if hash == stored.content_hash => {
                    UnitOutcome::Refreshed(FileRecord {
                        mtime: walked.mtime,
                        size: walked.size,
                        ..stored
                    })
                }
                Ok(hash) => UnitOutcome::Modified(build_record(&walked, hash)),
                Err(err) => UnitOutcome::Failed(ScanWarning {
                    path: walked.rel_path,
                    reason: err.to_string(),
                }),
            }
        }
    }
}

fn decode_record(path: &str, raw: &[u8]) -> Result<FileRecord> {
    serde_json::from_slice(raw).map_err(|_| CoreError::Corrupt(path.to_string()))
}

fn build_record(walked: &WalkedFile, hash: String) -> FileRecord {
    FileRecord {
        path: walked.rel_path.clone(),
        size: walked.size,
        mtime: walked.mtime,
        content_hash: hash,
        extension: FileRecord::extension_of(&walked.rel_path),
        last_indexed: Utc::now(),
    }
}
