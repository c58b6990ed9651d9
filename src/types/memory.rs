use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{CoreError, Result};

/// Point-in-time record of process memory state. Immutable once taken;
/// snapshots form an append-only ring buffer inside the profiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub timestamp: DateTime<Utc>,
    /// Process resident set size in bytes.
    pub resident_bytes: u64,
    /// Entries tracked by the content registry, resident or not.
    pub tracked_objects: usize,
    /// Reclaim passes run so far (gc-threshold escalations).
    pub reclaim_cycles: u64,
    /// File contents currently resident in memory.
    pub loaded_files: usize,
    /// Query results currently cached.
    pub cached_queries: usize,
}

/// Tiered memory limits. Immutable once loaded; replaced wholesale through
/// [`LimitsPatch`] so in-flight evaluations keep the set they started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimits {
    pub soft_limit_bytes: u64,
    pub hard_limit_bytes: u64,
    pub gc_threshold_bytes: u64,
    pub spill_threshold_bytes: u64,
    pub max_loaded_files: usize,
    pub max_cached_queries: usize,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            soft_limit_bytes: 512 * 1024 * 1024,
            hard_limit_bytes: 1024 * 1024 * 1024,
            gc_threshold_bytes: 256 * 1024 * 1024,
            spill_threshold_bytes: 768 * 1024 * 1024,
            max_loaded_files: 100,
            max_cached_queries: 50,
        }
    }
}

impl MemoryLimits {
    /// Checks ordering invariants. Soft must not exceed hard and the hard
    /// limit must be set; a gc threshold above the soft limit is legal but
    /// pointless, so it is left to the operator.
    pub fn validate(&self) -> Result<()> {
        if self.hard_limit_bytes == 0 {
            return Err(CoreError::Config("hard_limit_bytes must be non-zero".into()));
        }
        if self.soft_limit_bytes > self.hard_limit_bytes {
            return Err(CoreError::Config(format!(
                "soft limit ({}) exceeds hard limit ({})",
                self.soft_limit_bytes, self.hard_limit_bytes
            )));
        }
        Ok(())
    }

    /// Merges a partial update and validates the result. Either the whole
    /// patch applies or none of it does.
    pub fn apply(&self, patch: &LimitsPatch) -> Result<MemoryLimits> {
        let merged = MemoryLimits {
            soft_limit_bytes: patch.soft_limit_bytes.unwrap_or(self.soft_limit_bytes),
            hard_limit_bytes: patch.hard_limit_bytes.unwrap_or(self.hard_limit_bytes),
            gc_threshold_bytes: patch.gc_threshold_bytes.unwrap_or(self.gc_threshold_bytes),
            spill_threshold_bytes: patch
                .spill_threshold_bytes
                .unwrap_or(self.spill_threshold_bytes),
            max_loaded_files: patch.max_loaded_files.unwrap_or(self.max_loaded_files),
            max_cached_queries: patch.max_cached_queries.unwrap_or(self.max_cached_queries),
        };
        merged.validate()?;
        Ok(merged)
    }
}

/// Partial limit update. `None` fields keep their current value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LimitsPatch {
    pub soft_limit_bytes: Option<u64>,
    pub hard_limit_bytes: Option<u64>,
    pub gc_threshold_bytes: Option<u64>,
    pub spill_threshold_bytes: Option<u64>,
    pub max_loaded_files: Option<usize>,
    pub max_cached_queries: Option<usize>,
}

/// Escalation tiers, in the order the profiler evaluates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupLevel {
    /// Request a reclaim pass: drop disposable bookkeeping.
    Gc,
    /// Cooperative cleanup: unload cold content, trim caches.
    Soft,
    /// Move colder cache entries to disk.
    Spill,
    /// Unconditionally unload all non-pinned resident content.
    Aggressive,
}

/// How many times each limit has been observed violated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitViolations {
    pub gc_threshold: u64,
    pub soft_limit: u64,
    pub spill_threshold: u64,
    pub hard_limit: u64,
}

/// Read model returned by the profiler accessor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryProfile {
    pub current: MemorySnapshot,
    pub peak_resident_bytes: u64,
    pub limits: MemoryLimits,
    pub violations: LimitViolations,
    pub history: Vec<MemorySnapshot>,
}

/// Resident usage before and after a cleanup trigger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CleanupOutcome {
    pub before_bytes: u64,
    pub after_bytes: u64,
}
