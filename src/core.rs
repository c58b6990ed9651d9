use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use xxhash_rust::xxh64::xxh64;

use crate::config::CoreConfig;
use crate::content::{LazyContentManager, LineMatch};
use crate::indexer::IncrementalIndexer;
use crate::profiler::{MemoryMonitor, MemoryProfiler, UsageProbe};
use crate::scanner::TreeWalker;
use crate::storage::{open_backend, BackendKind, StorageBackend};
use crate::types::error::{CoreError, Result};
use crate::types::file::{FileRecord, IndexStats, ScanReport};
use crate::types::memory::{
    CleanupLevel, CleanupOutcome, LimitsPatch, MemoryLimits, MemoryProfile,
};

/// Per-project indexing core: one instance per project root, each with its
/// own storage, content manager, profiler and limits. There is no implicit
/// process-wide state, so multiple isolated cores can coexist in one
/// process.
///
/// Persisted state lives under `<state_root>/<hash-of-root>/`: a metadata
/// store for FileRecords, and a spill directory for evicted cache entries.
pub struct CodeScope {
    root: PathBuf,
    state_dir: PathBuf,
    spill_dir: PathBuf,
    metadata: Arc<dyn StorageBackend>,
    cache_store: Arc<dyn StorageBackend>,
    content: Arc<LazyContentManager>,
    profiler: Arc<MemoryProfiler>,
    indexer: IncrementalIndexer,
    monitor: Mutex<Option<MemoryMonitor>>,
}

/// Builder for [`CodeScope`], in the usual pattern:
///
/// ```no_run
/// # use codescope::core::CodeScope;
/// let core = CodeScope::builder("/path/to/project").build().unwrap();
/// ```
pub struct CodeScopeBuilder {
    root: PathBuf,
    config: CoreConfig,
    probe: Option<Box<dyn UsageProbe>>,
    start_monitor: bool,
}

impl CodeScope {
    pub fn builder(root: impl Into<PathBuf>) -> CodeScopeBuilder {
        CodeScopeBuilder {
            root: root.into(),
            config: CoreConfig::default(),
            probe: None,
            start_monitor: true,
        }
    }

    /// The state directory that `root` maps to under this config, without
    /// creating anything.
    pub fn state_dir_for(config: &CoreConfig, root: &Path) -> PathBuf {
        let canonical = root
            .canonicalize()
            .unwrap_or_else(|_| root.to_path_buf());
        let key = canonical.to_string_lossy();
        config
            .state_root()
            .join(format!("{:016x}", xxh64(key.as_bytes(), 0)))
    }

    /// Runs one incremental scan with an internal cancellation token.
    pub async fn scan(&self) -> Result<ScanReport> {
        self.indexer.scan(&CancellationToken::new()).await
    }

    /// Scan that honors an external cancellation signal.
    pub async fn scan_cancellable(&self, token: &CancellationToken) -> Result<ScanReport> {
        self.indexer.scan(token).await
    }

    /// Scan with a deadline; timing out takes the cancellation path.
    pub async fn scan_with_timeout(&self, timeout: Duration) -> Result<ScanReport> {
        self.indexer
            .scan_with_timeout(&CancellationToken::new(), timeout)
            .await
    }

    /// Bytes of an indexed file, loaded lazily and cached. Paths without a
    /// FileRecord report `NotFound`; a hard memory limit reports
    /// backpressure.
    pub async fn get_content(&self, path: &str) -> Result<Arc<Vec<u8>>> {
        if self.indexer.record(path)?.is_none() {
            return Err(CoreError::NotFound(path.to_string()));
        }
        self.content.get_content(path).await
    }

    pub fn get_file_record(&self, path: &str) -> Result<FileRecord> {
        self.indexer
            .record(path)?
            .ok_or_else(|| CoreError::NotFound(path.to_string()))
    }

    /// Substring search within one indexed file. Non-resident files are
    /// scanned chunk-by-chunk and stay non-resident.
    pub async fn search_content(
        &self,
        path: &str,
        pattern: &str,
        case_sensitive: bool,
    ) -> Result<Vec<LineMatch>> {
        if self.indexer.record(path)?.is_none() {
            return Err(CoreError::NotFound(path.to_string()));
        }
        self.content.search_file(path, pattern, case_sensitive).await
    }

    pub fn is_loaded(&self, path: &str) -> bool {
        self.content.is_loaded(path)
    }

    pub fn memory_profile(&self) -> MemoryProfile {
        self.profiler.profile()
    }

    /// Manual cleanup trigger; without a level the full escalation runs.
    pub fn trigger_cleanup(&self, level: Option<CleanupLevel>) -> CleanupOutcome {
        self.profiler.trigger_cleanup(level)
    }

    /// Validates and applies a partial limits update atomically, then
    /// re-bounds the content manager and query cache.
    pub fn configure_limits(&self, patch: LimitsPatch) -> Result<MemoryLimits> {
        let merged = self.profiler.reconfigure(&patch)?;
        self.content.set_max_loaded(merged.max_loaded_files);
        self.content.set_query_cache_bound(merged.max_cached_queries);
        Ok(merged)
    }

    /// Drops all FileRecords, cached content and spill files. The core is
    /// immediately reusable; the next scan reclassifies every file as added.
    pub fn clear_all(&self) -> Result<()> {
        self.metadata.clear()?;
        self.cache_store.clear()?;
        self.content.clear();

        if let Ok(entries) = std::fs::read_dir(&self.spill_dir) {
            for entry in entries.flatten() {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        info!(root = %self.root.display(), "cleared all persisted state");
        Ok(())
    }

    pub fn index_stats(&self) -> IndexStats {
        self.indexer.stats()
    }

    pub fn query_cache_stats(&self) -> crate::cache::CacheStatsSnapshot {
        self.content.query_cache_stats()
    }

    /// Cached result for a search-layer query key. Checks the in-memory
    /// cache (reloading spilled entries transparently), then falls back to
    /// the durable cache store, promoting anything found. A durable entry
    /// that fails to deserialize reads as missing.
    pub fn cached_query(&self, key: &str) -> Option<serde_json::Value> {
        if let Some(value) = self.content.cached_result(key) {
            return Some(value);
        }
        let raw = self.cache_store.get(key).ok().flatten()?;
        match serde_json::from_slice::<serde_json::Value>(&raw) {
            Ok(value) => {
                self.content.cache_result(key, value.clone());
                Some(value)
            }
            Err(_) => {
                let _ = self.cache_store.delete(key);
                None
            }
        }
    }

    /// Caches a query result in memory and writes it through to the durable
    /// cache store so it survives a core restart.
    pub fn cache_query(&self, key: &str, result: serde_json::Value) {
        if let Ok(raw) = serde_json::to_vec(&result) {
            let _ = self.cache_store.put(key, &raw);
        }
        self.content.cache_result(key, result);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Stops the background memory monitor. Idempotent.
    pub fn shutdown(&self) {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.shutdown();
        }
    }
}

impl Drop for CodeScope {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl CodeScopeBuilder {
    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.config.storage.backend = kind;
        self
    }

    pub fn limits(mut self, limits: MemoryLimits) -> Self {
        self.config.memory = limits;
        self
    }

    pub fn state_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage.state_root = Some(path.into());
        self
    }

    pub fn monitor_interval_secs(mut self, secs: u64) -> Self {
        self.config.monitor.interval_secs = secs;
        self
    }

    /// Replaces the process-RSS probe, letting callers (and tests) drive
    /// limit enforcement with simulated usage.
    pub fn usage_probe(mut self, probe: Box<dyn UsageProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Disables the background monitor; evaluation then only happens via
    /// explicit cleanup triggers.
    pub fn without_monitor(mut self) -> Self {
        self.start_monitor = false;
        self
    }

    pub fn build(self) -> Result<CodeScope> {
        self.config.validate()?;
        let limits = self.config.memory;

        let state_dir = CodeScope::state_dir_for(&self.config, &self.root);
        std::fs::create_dir_all(&state_dir).map_err(|e| CoreError::io(&state_dir, e))?;
        let spill_dir = state_dir.join("spill");

        let metadata = open_backend(self.config.storage.backend, &state_dir, "metadata")?;
        let cache_store = open_backend(self.config.storage.backend, &state_dir, "cache")?;

        let profiler = Arc::new(match self.probe {
            Some(probe) => {
                MemoryProfiler::new(limits, self.config.monitor.history_len, probe)
            }
            None => MemoryProfiler::with_system_probe(limits, self.config.monitor.history_len),
        });

        let content = Arc::new(LazyContentManager::new(
            self.root.clone(),
            limits.max_loaded_files,
            limits.max_cached_queries,
            Some(spill_dir.clone()),
            profiler.backpressure_flag(),
        ));

        // Wire the content manager into the escalation tiers. Each callback
        // runs under the manager's own synchronization.
        let c = content.clone();
        profiler.register_gc(move || c.shrink_registry());
        let c = content.clone();
        profiler.register_soft(move || c.soft_cleanup());
        let c = content.clone();
        profiler.register_spill(move || {
            let colder = (c.cached_query_count() / 2).max(1);
            c.spill_queries(colder);
        });
        let c = content.clone();
        profiler.register_aggressive(move || {
            c.unload_all();
            c.clear_queries();
        });

        let c = content.clone();
        let loaded = content.clone();
        let queries = content.clone();
        profiler.set_gauges(
            move || c.tracked_count(),
            move || loaded.loaded_count(),
            move || queries.cached_query_count(),
        );

        let walker = TreeWalker::new(&self.config.scan)?;
        let indexer = IncrementalIndexer::new(self.root.clone(), walker, metadata.clone());

        // The monitor needs a runtime; outside one (plain sync callers) the
        // profiler still works through manual triggers.
        let monitor = if self.start_monitor && tokio::runtime::Handle::try_current().is_ok() {
            Some(MemoryMonitor::spawn(
                profiler.clone(),
                Duration::from_secs(self.config.monitor.interval_secs),
            ))
        } else {
            None
        };

        debug!(
            root = %self.root.display(),
            state_dir = %state_dir.display(),
            "project core initialized"
        );

        Ok(CodeScope {
            root: self.root,
            state_dir,
            spill_dir,
            metadata,
            cache_store,
            content,
            profiler,
            indexer,
            monitor: Mutex::new(monitor),
        })
    }
}
