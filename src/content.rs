use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cache::{CacheStatsSnapshot, LruCache};
use crate::config::{CHUNK_SIZE, WHOLE_READ_LIMIT};
use crate::types::error::{CoreError, Result};

/// One substring match inside a file.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LineMatch {
    pub line_number: usize,
    pub line: String,
}

/// SHA-256 of a byte slice, hex encoded. The chunked reader produces the
/// same digest for the same content.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Reads a file in fixed-size chunks so peak memory for hashing and
/// searching stays bounded regardless of file size.
pub struct ChunkedFileReader {
    path: PathBuf,
    chunk_size: usize,
}

impl ChunkedFileReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            chunk_size: CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(path: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            path: path.into(),
            chunk_size,
        }
    }

    /// Streams the file through `visit` chunk by chunk. Returns the number
    /// of chunks read.
    fn for_each_chunk(&self, mut visit: impl FnMut(&[u8])) -> Result<usize> {
        let mut file =
            std::fs::File::open(&self.path).map_err(|e| CoreError::io(&self.path, e))?;
        let mut buffer = vec![0u8; self.chunk_size];
        let mut chunks = 0;
        loop {
            let read = file
                .read(&mut buffer)
                .map_err(|e| CoreError::io(&self.path, e))?;
            if read == 0 {
                break;
            }
            visit(&buffer[..read]);
            chunks += 1;
        }
        Ok(chunks)
    }

    /// Hashes the file without ever holding more than one chunk in memory.
    pub fn compute_hash(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        self.for_each_chunk(|chunk| hasher.update(chunk))?;
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Reads the whole file via chunked reads. Returns the bytes and the
    /// number of chunk reads performed.
    pub fn read_all(&self) -> Result<(Vec<u8>, usize)> {
        let mut data = Vec::new();
        let chunks = self.for_each_chunk(|chunk| data.extend_from_slice(chunk))?;
        Ok((data, chunks))
    }

    /// Substring scan over the file, chunk by chunk, carrying the partial
    /// trailing line between chunks so the file is never materialized.
    pub fn search(&self, pattern: &str, case_sensitive: bool) -> Result<Vec<LineMatch>> {
        let needle = if case_sensitive {
            pattern.to_string()
        } else {
            pattern.to_lowercase()
        };

        let mut matches = Vec::new();
        let mut carry: Vec<u8> = Vec::new();
        let mut line_number = 0usize;

        self.for_each_chunk(|chunk| {
            carry.extend_from_slice(chunk);
            while let Some(pos) = carry.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = carry.drain(..=pos).collect();
                line_number += 1;
                scan_line(&line[..line.len() - 1], &needle, case_sensitive, line_number, &mut matches);
            }
        })?;

        if !carry.is_empty() {
            line_number += 1;
            scan_line(&carry, &needle, case_sensitive, line_number, &mut matches);
        }

        Ok(matches)
    }

    /// Number of lines, without retaining any content.
    pub fn line_count(&self) -> Result<usize> {
        let mut newlines = 0usize;
        let mut trailing = false;
        self.for_each_chunk(|chunk| {
            newlines += chunk.iter().filter(|&&b| b == b'\n').count();
            if let Some(&last) = chunk.last() {
                trailing = last != b'\n';
            }
        })?;
        Ok(newlines + usize::from(trailing))
    }
}

fn scan_line(
    raw: &[u8],
    needle: &str,
    case_sensitive: bool,
    line_number: usize,
    matches: &mut Vec<LineMatch>,
) {
    let line = String::from_utf8_lossy(raw);
    let haystack = if case_sensitive {
        line.to_string()
    } else {
        line.to_lowercase()
    };
    if haystack.contains(needle) {
        matches.push(LineMatch {
            line_number,
            line: line.trim_end_matches('\r').to_string(),
        });
    }
}

struct LazyEntry {
    data: Option<Arc<Vec<u8>>>,
    last_access: Instant,
}

/// On-demand per-file content loader with recency-based unloading.
///
/// The registry is the sole owner of residency state: eviction drops the
/// in-memory buffer only and never touches persisted FileRecords. Small
/// files load in one read; files at or above the 10 MiB threshold load via
/// chunked reads so peak memory per load stays bounded. While the
/// profiler reports hard-limit pressure, new loads are rejected with a
/// backpressure error; already-resident content stays served.
pub struct LazyContentManager {
    root: PathBuf,
    registry: DashMap<String, LazyEntry>,
    max_loaded: AtomicUsize,
    disk_reads: AtomicU64,
    backpressure: Arc<AtomicBool>,
    query_cache: LruCache<String, serde_json::Value>,
}

impl LazyContentManager {
    pub fn new(
        root: impl Into<PathBuf>,
        max_loaded: usize,
        max_cached_queries: usize,
        query_spill_dir: Option<PathBuf>,
        backpressure: Arc<AtomicBool>,
    ) -> Self {
        let mut query_cache: LruCache<String, serde_json::Value> =
            LruCache::new().with_max_entries(max_cached_queries);
        if let Some(dir) = query_spill_dir {
            query_cache = query_cache.with_spill_dir(dir);
        }
        Self {
            root: root.into(),
            registry: DashMap::new(),
            max_loaded: AtomicUsize::new(max_loaded),
            disk_reads: AtomicU64::new(0),
            backpressure,
            query_cache,
        }
    }

    /// Returns the file's bytes, loading from disk on first access. Repeat
    /// calls before eviction serve the resident buffer without re-reading.
    pub async fn get_content(&self, rel_path: &str) -> Result<Arc<Vec<u8>>> {
        if let Some(mut entry) = self.registry.get_mut(rel_path) {
            if let Some(data) = &entry.data {
                let data = data.clone();
                entry.last_access = Instant::now();
                return Ok(data);
            }
        }

        if self.backpressure.load(Ordering::SeqCst) {
            return Err(CoreError::Backpressure);
        }

        let abs = self.root.join(rel_path);
        let metadata = tokio::fs::metadata(&abs)
            .await
            .map_err(|e| CoreError::io(&abs, e))?;

        let data = if metadata.len() >= WHOLE_READ_LIMIT {
            let reader = ChunkedFileReader::new(abs.clone());
            let (data, chunks) = tokio::task::spawn_blocking(move || reader.read_all())
                .await
                .map_err(|e| CoreError::Storage(e.to_string()))??;
            debug!(path = rel_path, chunks, "loaded large file in chunks");
            data
        } else {
            tokio::fs::read(&abs)
                .await
                .map_err(|e| CoreError::io(&abs, e))?
        };
        self.disk_reads.fetch_add(1, Ordering::Relaxed);

        let data = Arc::new(data);
        self.registry.insert(
            rel_path.to_string(),
            LazyEntry {
                data: Some(data.clone()),
                last_access: Instant::now(),
            },
        );
        self.enforce_loaded_limit();
        Ok(data)
    }

    /// Residency check; never triggers a load or updates recency.
    pub fn is_loaded(&self, rel_path: &str) -> bool {
        self.registry
            .get(rel_path)
            .map(|entry| entry.data.is_some())
            .unwrap_or(false)
    }

    /// Substring search. Resident files are scanned in memory; others are
    /// scanned chunk-by-chunk without becoming resident.
    pub async fn search_file(
        &self,
        rel_path: &str,
        pattern: &str,
        case_sensitive: bool,
    ) -> Result<Vec<LineMatch>> {
        if let Some(entry) = self.registry.get(rel_path) {
            if let Some(data) = &entry.data {
                return Ok(scan_resident(data, pattern, case_sensitive));
            }
        }

        let reader = ChunkedFileReader::new(self.root.join(rel_path));
        let pattern = pattern.to_string();
        tokio::task::spawn_blocking(move || reader.search(&pattern, case_sensitive))
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?
    }

    pub fn loaded_count(&self) -> usize {
        self.registry
            .iter()
            .filter(|entry| entry.data.is_some())
            .count()
    }

    /// Entries tracked, resident or not.
    pub fn tracked_count(&self) -> usize {
        self.registry.len()
    }

    pub fn disk_reads(&self) -> u64 {
        self.disk_reads.load(Ordering::Relaxed)
    }

    pub fn set_max_loaded(&self, max_loaded: usize) {
        self.max_loaded.store(max_loaded, Ordering::SeqCst);
        self.enforce_loaded_limit();
    }

    /// Drops every resident buffer. FileRecords and registry entries
    /// survive; only memory is released.
    pub fn unload_all(&self) {
        for mut entry in self.registry.iter_mut() {
            entry.data = None;
        }
    }

    /// Unloads the `count` least-recently-accessed resident buffers.
    pub fn unload_lru(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut loaded: Vec<(String, Instant)> = self
            .registry
            .iter()
            .filter(|entry| entry.data.is_some())
            .map(|entry| (entry.key().clone(), entry.last_access))
            .collect();
        loaded.sort_by_key(|(_, at)| *at);

        for (path, _) in loaded.into_iter().take(count) {
            if let Some(mut entry) = self.registry.get_mut(&path) {
                entry.data = None;
            }
        }
    }

    /// Cooperative cleanup: unload the colder half of resident content and
    /// drop cached query results.
    pub fn soft_cleanup(&self) {
        let loaded = self.loaded_count();
        self.unload_lru(loaded / 2);
        self.query_cache.clear();
    }

    /// Reclaim pass: forget bookkeeping for entries with no resident buffer.
    pub fn shrink_registry(&self) {
        self.registry.retain(|_, entry| entry.data.is_some());
    }

    fn enforce_loaded_limit(&self) {
        let max = self.max_loaded.load(Ordering::SeqCst);
        let loaded = self.loaded_count();
        if loaded > max {
            self.unload_lru(loaded - max);
        }
    }

    // Query-result cache, bounded by max_cached_queries and spilled under
    // memory pressure.

    pub fn cached_result(&self, key: &str) -> Option<serde_json::Value> {
        self.query_cache.get(&key.to_string())
    }

    pub fn cache_result(&self, key: &str, result: serde_json::Value) {
        self.query_cache.put(key.to_string(), result);
    }

    pub fn cached_query_count(&self) -> usize {
        self.query_cache.len()
    }

    pub fn query_cache_stats(&self) -> CacheStatsSnapshot {
        self.query_cache.stats()
    }

    pub fn spill_queries(&self, count: usize) -> usize {
        self.query_cache.spill_colder(count)
    }

    pub fn clear_queries(&self) {
        self.query_cache.clear();
    }

    pub fn set_query_cache_bound(&self, max_entries: usize) {
        self.query_cache.set_max_entries(Some(max_entries));
    }

    /// Drops all resident content, registry entries and cached queries.
    pub fn clear(&self) {
        self.registry.clear();
        self.query_cache.clear();
    }
}

fn scan_resident(data: &[u8], pattern: &str, case_sensitive: bool) -> Vec<LineMatch> {
    let needle = if case_sensitive {
        pattern.to_string()
    } else {
        pattern.to_lowercase()
    };
    let mut matches = Vec::new();
    let lines: Vec<&[u8]> = data.split(|&b| b == b'\n').collect();
    // split() yields one empty trailing slice for newline-terminated data;
    // drop it rather than reporting a phantom line.
    let line_total = if data.ends_with(b"\n") {
        lines.len().saturating_sub(1)
    } else {
        lines.len()
    };
    for (index, raw) in lines.into_iter().take(line_total).enumerate() {
        scan_line(raw, &needle, case_sensitive, index + 1, &mut matches);
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::Path;

    fn write(root: &Path, rel: &str, contents: &[u8]) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    fn manager(root: &Path, max_loaded: usize) -> LazyContentManager {
        LazyContentManager::new(
            root,
            max_loaded,
            50,
            None,
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn chunked_hash_matches_whole_file_hash() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        write(dir.path(), "blob.bin", &data);

        let chunked = ChunkedFileReader::with_chunk_size(dir.path().join("blob.bin"), 4096)
            .compute_hash()
            .unwrap();
        assert_eq!(chunked, hash_bytes(&data));
    }

    proptest! {
        #[test]
        fn chunked_hash_agrees_for_any_content(data in proptest::collection::vec(any::<u8>(), 0..20_000)) {
            let dir = tempfile::tempdir().unwrap();
            write(dir.path(), "f", &data);

            let chunked = ChunkedFileReader::with_chunk_size(dir.path().join("f"), 1024)
                .compute_hash()
                .unwrap();
            prop_assert_eq!(chunked, hash_bytes(&data));
        }
    }

    #[test]
    fn search_finds_matches_across_chunk_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        // With an 8-byte chunk, the matching line straddles chunks.
        write(dir.path(), "log.txt", b"alpha\nneedle here\nomega\n");

        let reader = ChunkedFileReader::with_chunk_size(dir.path().join("log.txt"), 8);
        let matches = reader.search("needle", true).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].line_number, 2);
        assert_eq!(matches[0].line, "needle here");
    }

    #[test]
    fn search_is_case_insensitive_on_request() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "f.txt", b"Foo Bar\nbaz\n");

        let reader = ChunkedFileReader::new(dir.path().join("f.txt"));
        assert!(reader.search("foo bar", true).unwrap().is_empty());
        assert_eq!(reader.search("foo bar", false).unwrap().len(), 1);
    }

    #[test]
    fn line_count_handles_missing_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a", b"one\ntwo\nthree\n");
        write(dir.path(), "b", b"one\ntwo\nthree");
        write(dir.path(), "c", b"");

        assert_eq!(ChunkedFileReader::new(dir.path().join("a")).line_count().unwrap(), 3);
        assert_eq!(ChunkedFileReader::new(dir.path().join("b")).line_count().unwrap(), 3);
        assert_eq!(ChunkedFileReader::new(dir.path().join("c")).line_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn get_content_reads_disk_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.rs", b"fn a() {}");
        let manager = manager(dir.path(), 10);

        let first = manager.get_content("src/a.rs").await.unwrap();
        let second = manager.get_content("src/a.rs").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(manager.disk_reads(), 1);
    }

    #[tokio::test]
    async fn is_loaded_never_triggers_a_load() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "x.txt", b"data");
        let manager = manager(dir.path(), 10);

        assert!(!manager.is_loaded("x.txt"));
        assert_eq!(manager.disk_reads(), 0);

        manager.get_content("x.txt").await.unwrap();
        assert!(manager.is_loaded("x.txt"));
        assert_eq!(manager.disk_reads(), 1);
    }

    #[tokio::test]
    async fn exceeding_max_loaded_unloads_least_recently_used_first() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            write(dir.path(), &format!("f{i}.txt"), b"content");
        }
        let manager = manager(dir.path(), 2);

        manager.get_content("f0.txt").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager.get_content("f1.txt").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager.get_content("f2.txt").await.unwrap();

        assert!(!manager.is_loaded("f0.txt"));
        assert!(manager.is_loaded("f1.txt"));
        assert!(manager.is_loaded("f2.txt"));
        assert_eq!(manager.loaded_count(), 2);
    }

    #[tokio::test]
    async fn unload_all_releases_buffers_but_keeps_tracking() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", b"a");
        write(dir.path(), "b.txt", b"b");
        let manager = manager(dir.path(), 10);

        manager.get_content("a.txt").await.unwrap();
        manager.get_content("b.txt").await.unwrap();

        manager.unload_all();
        assert_eq!(manager.loaded_count(), 0);
        assert_eq!(manager.tracked_count(), 2);

        // Reload works and reads disk again.
        manager.get_content("a.txt").await.unwrap();
        assert_eq!(manager.disk_reads(), 3);
    }

    #[tokio::test]
    async fn backpressure_rejects_new_loads_but_serves_resident_content() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "hot.txt", b"hot");
        write(dir.path(), "cold.txt", b"cold");

        let flag = Arc::new(AtomicBool::new(false));
        let manager =
            LazyContentManager::new(dir.path(), 10, 50, None, flag.clone());

        manager.get_content("hot.txt").await.unwrap();

        flag.store(true, Ordering::SeqCst);
        assert!(matches!(
            manager.get_content("cold.txt").await,
            Err(CoreError::Backpressure)
        ));
        // Resident content is not penalized.
        assert!(manager.get_content("hot.txt").await.is_ok());

        flag.store(false, Ordering::SeqCst);
        assert!(manager.get_content("cold.txt").await.is_ok());
    }

    #[tokio::test]
    async fn soft_cleanup_halves_resident_content_and_drops_queries() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            write(dir.path(), &format!("f{i}.txt"), b"x");
        }
        let manager = manager(dir.path(), 10);
        for i in 0..4 {
            manager.get_content(&format!("f{i}.txt")).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        manager.cache_result("q", serde_json::json!({"hits": 3}));

        manager.soft_cleanup();

        assert_eq!(manager.loaded_count(), 2);
        assert_eq!(manager.cached_query_count(), 0);
        // The oldest two were the ones dropped.
        assert!(!manager.is_loaded("f0.txt"));
        assert!(!manager.is_loaded("f1.txt"));
    }

    #[test]
    fn search_does_not_make_the_file_resident() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "big.txt", b"one\ntwo needle\nthree\n");
        let manager = manager(dir.path(), 10);

        let matches =
            tokio_test::block_on(manager.search_file("big.txt", "needle", true)).unwrap();
        assert_eq!(matches.len(), 1);
        assert!(!manager.is_loaded("big.txt"));
    }

    #[test]
    fn query_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 10);

        assert!(manager.cached_result("q1").is_none());
        manager.cache_result("q1", serde_json::json!({"total": 2}));
        assert_eq!(
            manager.cached_result("q1"),
            Some(serde_json::json!({"total": 2}))
        );
    }
}
