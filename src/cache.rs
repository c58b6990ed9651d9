use std::collections::HashMap;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use xxhash_rust::xxh64::xxh64;

/// Rough per-value memory estimate used for byte-bounded caches.
pub trait EstimateBytes {
    fn estimate_bytes(&self) -> usize;
}

impl EstimateBytes for String {
    fn estimate_bytes(&self) -> usize {
        self.len() + std::mem::size_of::<String>()
    }
}

impl EstimateBytes for Vec<u8> {
    fn estimate_bytes(&self) -> usize {
        self.len() + std::mem::size_of::<Vec<u8>>()
    }
}

impl EstimateBytes for serde_json::Value {
    fn estimate_bytes(&self) -> usize {
        match self {
            serde_json::Value::Null | serde_json::Value::Bool(_) => 8,
            serde_json::Value::Number(_) => 16,
            serde_json::Value::String(s) => s.len() + 16,
            serde_json::Value::Array(items) => {
                16 + items.iter().map(EstimateBytes::estimate_bytes).sum::<usize>()
            }
            serde_json::Value::Object(map) => {
                32 + map
                    .iter()
                    .map(|(k, v)| k.len() + 16 + v.estimate_bytes())
                    .sum::<usize>()
            }
        }
    }
}

/// Hit/miss/eviction counters, exposed for observability.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    spills: AtomicU64,
    reloads: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub spills: u64,
    pub reloads: u64,
}

impl CacheStats {
    fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            spills: self.spills.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
        }
    }
}

enum SlotState<V> {
    Resident(V),
    Spilled(PathBuf),
}

struct Slot<V> {
    state: SlotState<V>,
    bytes: usize,
    touch: u64,
}

struct Inner<K, V> {
    map: HashMap<K, Slot<V>>,
    tick: u64,
    resident_count: usize,
    resident_bytes: u64,
    max_entries: Option<usize>,
    max_bytes: Option<u64>,
}

/// Bounded, thread-safe LRU cache with optional spill-to-disk.
///
/// Bounded by resident entry count and/or aggregate estimated bytes
/// (whichever is configured). When spill is enabled, evicted values are
/// serialized to `<spill_dir>/<xxh64(key)>.spill` and replaced in memory by
/// a marker; a later `get` transparently reloads the value, promotes it to
/// most-recently-used and deletes the on-disk copy. A spilled entry that
/// fails to deserialize is dropped as a miss and rebuilt by the caller.
pub struct LruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    spill_dir: Option<PathBuf>,
    stats: CacheStats,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone + AsRef<[u8]>,
    V: Clone + EstimateBytes + Serialize + DeserializeOwned,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                tick: 0,
                resident_count: 0,
                resident_bytes: 0,
                max_entries: None,
                max_bytes: None,
            }),
            spill_dir: None,
            stats: CacheStats::default(),
        }
    }

    pub fn with_max_entries(self, max_entries: usize) -> Self {
        self.inner.lock().max_entries = Some(max_entries);
        self
    }

    pub fn with_max_bytes(self, max_bytes: u64) -> Self {
        self.inner.lock().max_bytes = Some(max_bytes);
        self
    }

    /// Enables spill-to-disk for evicted entries. The directory is created
    /// on first spill.
    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        enum Action<V> {
            Miss,
            Hit(V),
            Reload { path: PathBuf, bytes: usize },
        }

        let action = match inner.map.get_mut(key) {
            None => Action::Miss,
            Some(slot) => match &slot.state {
                SlotState::Resident(value) => {
                    slot.touch = tick;
                    Action::Hit(value.clone())
                }
                SlotState::Spilled(path) => Action::Reload {
                    path: path.clone(),
                    bytes: slot.bytes,
                },
            },
        };

        match action {
            Action::Miss => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Action::Hit(value) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Action::Reload { path, bytes } => {
                let loaded: Option<V> = std::fs::read(&path)
                    .ok()
                    .and_then(|raw| serde_json::from_slice(&raw).ok());
                let _ = std::fs::remove_file(&path);

                match loaded {
                    Some(value) => {
                        if let Some(slot) = inner.map.get_mut(key) {
                            slot.state = SlotState::Resident(value.clone());
                            slot.touch = tick;
                        }
                        inner.resident_count += 1;
                        inner.resident_bytes += bytes as u64;
                        self.enforce(&mut inner);
                        self.stats.hits.fetch_add(1, Ordering::Relaxed);
                        self.stats.reloads.fetch_add(1, Ordering::Relaxed);
                        Some(value)
                    }
                    None => {
                        warn!(spill = %path.display(), "spilled entry unreadable, dropping");
                        inner.map.remove(key);
                        self.stats.misses.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                }
            }
        }
    }

    pub fn put(&self, key: K, value: V) {
        let bytes = value.estimate_bytes();
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        let slot = Slot {
            state: SlotState::Resident(value),
            bytes,
            touch: tick,
        };
        if let Some(old) = inner.map.insert(key, slot) {
            match old.state {
                SlotState::Resident(_) => {
                    inner.resident_count -= 1;
                    inner.resident_bytes -= old.bytes as u64;
                }
                SlotState::Spilled(path) => {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
        inner.resident_count += 1;
        inner.resident_bytes += bytes as u64;

        self.enforce(&mut inner);
    }

    /// Moves the `count` least-recently-used resident entries to disk (or
    /// evicts them outright when spill is disabled). Invoked by memory
    /// pressure callbacks.
    pub fn spill_colder(&self, count: usize) -> usize {
        let mut inner = self.inner.lock();
        let mut spilled = 0;
        for _ in 0..count {
            if inner.resident_count == 0 || !self.evict_lru(&mut inner) {
                break;
            }
            spilled += 1;
        }
        spilled
    }

    /// Resident entries only; spilled markers are not counted.
    pub fn len(&self) -> usize {
        self.inner.lock().resident_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resident plus spilled entries.
    pub fn total_len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.inner.lock().resident_bytes
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Re-bounds the cache, evicting immediately if the new bound is lower.
    pub fn set_max_entries(&self, max_entries: Option<usize>) {
        let mut inner = self.inner.lock();
        inner.max_entries = max_entries;
        self.enforce(&mut inner);
    }

    /// Drops every entry and removes this cache's spill files.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for slot in inner.map.values() {
            if let SlotState::Spilled(path) = &slot.state {
                let _ = std::fs::remove_file(path);
            }
        }
        inner.map.clear();
        inner.resident_count = 0;
        inner.resident_bytes = 0;
    }

    fn over_capacity(&self, inner: &Inner<K, V>) -> bool {
        if let Some(max) = inner.max_entries {
            if inner.resident_count > max {
                return true;
            }
        }
        if let Some(max) = inner.max_bytes {
            if inner.resident_bytes > max {
                return true;
            }
        }
        false
    }

    fn enforce(&self, inner: &mut Inner<K, V>) {
        while self.over_capacity(inner) {
            if !self.evict_lru(inner) {
                break;
            }
        }
    }

    /// Evicts (or spills) the least-recently-used resident entry. Returns
    /// false when nothing is resident.
    fn evict_lru(&self, inner: &mut Inner<K, V>) -> bool {
        let victim = inner
            .map
            .iter()
            .filter(|(_, slot)| matches!(slot.state, SlotState::Resident(_)))
            .min_by_key(|(_, slot)| slot.touch)
            .map(|(key, _)| key.clone());
        let Some(key) = victim else {
            return false;
        };

        if let Some(dir) = &self.spill_dir {
            let Some(slot) = inner.map.get_mut(&key) else {
                return false;
            };
            let SlotState::Resident(value) = &slot.state else {
                return false;
            };
            match write_spill(dir, key.as_ref(), value) {
                Ok(path) => {
                    debug!(spill = %path.display(), "spilled cache entry");
                    inner.resident_count -= 1;
                    inner.resident_bytes -= slot.bytes as u64;
                    slot.state = SlotState::Spilled(path);
                    self.stats.spills.fetch_add(1, Ordering::Relaxed);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(err) => {
                    warn!(error = %err, "spill write failed, evicting entry instead");
                }
            }
        }

        if let Some(slot) = inner.map.remove(&key) {
            if matches!(slot.state, SlotState::Resident(_)) {
                inner.resident_count -= 1;
                inner.resident_bytes -= slot.bytes as u64;
            }
        }
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        true
    }
}

impl<K, V> Default for LruCache<K, V>
where
    K: Eq + Hash + Clone + AsRef<[u8]>,
    V: Clone + EstimateBytes + Serialize + DeserializeOwned,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Stable on-disk location for a spilled value, keyed by a hash of the cache
/// key rather than the key text so arbitrary keys stay filesystem-safe.
pub fn spill_path(dir: &std::path::Path, key: &[u8]) -> PathBuf {
    dir.join(format!("{:016x}.spill", xxh64(key, 0)))
}

fn write_spill<V: Serialize>(
    dir: &std::path::Path,
    key: &[u8],
    value: &V,
) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = spill_path(dir, key);
    let raw = serde_json::to_vec(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(&path, raw)?;
    Ok(path)
}
