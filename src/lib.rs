pub mod cache;
pub mod config;
pub mod content;
pub mod core;
pub mod indexer;
pub mod profiler;
pub mod scanner;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use cache::{CacheStatsSnapshot, EstimateBytes, LruCache};
pub use config::{CoreConfig, MonitorSettings, ScanSettings, StorageSettings};
pub use content::{ChunkedFileReader, LazyContentManager, LineMatch};
pub use self::core::{CodeScope, CodeScopeBuilder};
pub use indexer::IncrementalIndexer;
pub use profiler::{MemoryMonitor, MemoryProfiler, SysinfoProbe, UsageProbe};
pub use scanner::{TreeWalker, WalkedFile};
pub use storage::{BackendKind, SqliteBackend, StorageBackend, TrieBackend};
pub use types::{
    CleanupLevel, CleanupOutcome, CoreError, FileRecord, IndexStats, LimitViolations,
    LimitsPatch, MemoryLimits, MemoryProfile, MemorySnapshot, Result, ScanReport, ScanWarning,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Installs a tracing subscriber honoring `RUST_LOG`. Intended for binaries
/// and tests embedding the core; calling it twice is a no-op.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
