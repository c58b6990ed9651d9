use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::error::Result;
use crate::types::memory::{
    CleanupLevel, CleanupOutcome, LimitViolations, LimitsPatch, MemoryLimits, MemoryProfile,
    MemorySnapshot,
};

/// Source of the process resident-memory reading. Abstracted so tests can
/// drive the escalation logic with simulated usage.
pub trait UsageProbe: Send {
    fn resident_bytes(&mut self) -> u64;
}

/// Default probe reading the current process RSS.
pub struct SysinfoProbe {
    system: System,
    pid: Pid,
}

impl SysinfoProbe {
    pub fn new() -> Option<Self> {
        let pid = sysinfo::get_current_pid().ok()?;
        Some(Self {
            system: System::new(),
            pid,
        })
    }
}

impl UsageProbe for SysinfoProbe {
    fn resident_bytes(&mut self) -> u64 {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        self.system
            .process(self.pid)
            .map(|process| process.memory())
            .unwrap_or(0)
    }
}

type Cleanup = Arc<dyn Fn() + Send + Sync>;
type Gauge = Arc<dyn Fn() -> usize + Send + Sync>;

#[derive(Default)]
struct Registry {
    gc: Vec<Cleanup>,
    soft: Vec<Cleanup>,
    spill: Vec<Cleanup>,
    aggressive: Vec<Cleanup>,
}

#[derive(Default)]
struct Gauges {
    tracked_objects: Option<Gauge>,
    loaded_files: Option<Gauge>,
    cached_queries: Option<Gauge>,
}

/// What one evaluation pass observed and did.
#[derive(Debug, Clone)]
pub struct EnforcementReport {
    pub snapshot: MemorySnapshot,
    pub fired: Vec<CleanupLevel>,
}

/// Tracks process memory against tiered limits and drives cleanup.
///
/// One instance per project core — there is no process-wide singleton, so
/// multiple projects can run independently-limited cores in one process.
/// Components register plain callback values at wiring time; callbacks are
/// invoked synchronously from the evaluating context and must do their own
/// locking.
pub struct MemoryProfiler {
    limits: RwLock<Arc<MemoryLimits>>,
    probe: Mutex<Box<dyn UsageProbe>>,
    history: Mutex<VecDeque<MemorySnapshot>>,
    history_len: usize,
    peak_resident: AtomicU64,
    reclaim_cycles: AtomicU64,
    viol_gc: AtomicU64,
    viol_soft: AtomicU64,
    viol_spill: AtomicU64,
    viol_hard: AtomicU64,
    over_hard: Arc<AtomicBool>,
    gauges: RwLock<Gauges>,
    callbacks: RwLock<Registry>,
}

impl MemoryProfiler {
    pub fn new(limits: MemoryLimits, history_len: usize, probe: Box<dyn UsageProbe>) -> Self {
        Self {
            limits: RwLock::new(Arc::new(limits)),
            probe: Mutex::new(probe),
            history: Mutex::new(VecDeque::with_capacity(history_len)),
            history_len,
            peak_resident: AtomicU64::new(0),
            reclaim_cycles: AtomicU64::new(0),
            viol_gc: AtomicU64::new(0),
            viol_soft: AtomicU64::new(0),
            viol_spill: AtomicU64::new(0),
            viol_hard: AtomicU64::new(0),
            over_hard: Arc::new(AtomicBool::new(false)),
            gauges: RwLock::new(Gauges::default()),
            callbacks: RwLock::new(Registry::default()),
        }
    }

    /// Builds a profiler with the real process-RSS probe.
    pub fn with_system_probe(limits: MemoryLimits, history_len: usize) -> Self {
        let probe: Box<dyn UsageProbe> = match SysinfoProbe::new() {
            Some(probe) => Box::new(probe),
            None => {
                warn!("process probe unavailable, memory limits will not trigger");
                Box::new(NullProbe)
            }
        };
        Self::new(limits, history_len, probe)
    }

    pub fn register_gc(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks.write().gc.push(Arc::new(callback));
    }

    pub fn register_soft(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks.write().soft.push(Arc::new(callback));
    }

    pub fn register_spill(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks.write().spill.push(Arc::new(callback));
    }

    pub fn register_aggressive(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks.write().aggressive.push(Arc::new(callback));
    }

    /// Wires the gauges sampled into every snapshot.
    pub fn set_gauges(
        &self,
        tracked_objects: impl Fn() -> usize + Send + Sync + 'static,
        loaded_files: impl Fn() -> usize + Send + Sync + 'static,
        cached_queries: impl Fn() -> usize + Send + Sync + 'static,
    ) {
        let mut gauges = self.gauges.write();
        gauges.tracked_objects = Some(Arc::new(tracked_objects));
        gauges.loaded_files = Some(Arc::new(loaded_files));
        gauges.cached_queries = Some(Arc::new(cached_queries));
    }

    /// Shared flag the content manager consults to reject new loads while
    /// usage sits above the hard limit.
    pub fn backpressure_flag(&self) -> Arc<AtomicBool> {
        self.over_hard.clone()
    }

    /// The active limit set. Holders of the returned `Arc` keep evaluating
    /// against it even if limits are swapped mid-flight.
    pub fn limits(&self) -> Arc<MemoryLimits> {
        self.limits.read().clone()
    }

    /// Validates and atomically swaps in a merged limit set.
    pub fn reconfigure(&self, patch: &LimitsPatch) -> Result<MemoryLimits> {
        let merged = self.limits.read().apply(patch)?;
        *self.limits.write() = Arc::new(merged);
        info!(?merged, "memory limits reconfigured");
        Ok(merged)
    }

    fn probe_resident(&self) -> u64 {
        self.probe.lock().resident_bytes()
    }

    fn read_gauge(gauge: &Option<Gauge>) -> usize {
        gauge.as_ref().map(|g| g()).unwrap_or(0)
    }

    /// Captures a snapshot, updates the peak and appends to history (ring
    /// semantics: the oldest snapshot is dropped first).
    pub fn take_snapshot(&self) -> MemorySnapshot {
        let resident = self.probe_resident();
        self.peak_resident.fetch_max(resident, Ordering::Relaxed);

        let gauges = self.gauges.read();
        let snapshot = MemorySnapshot {
            timestamp: Utc::now(),
            resident_bytes: resident,
            tracked_objects: Self::read_gauge(&gauges.tracked_objects),
            reclaim_cycles: self.reclaim_cycles.load(Ordering::Relaxed),
            loaded_files: Self::read_gauge(&gauges.loaded_files),
            cached_queries: Self::read_gauge(&gauges.cached_queries),
        };
        drop(gauges);

        let mut history = self.history.lock();
        if history.len() == self.history_len {
            history.pop_front();
        }
        history.push_back(snapshot.clone());
        snapshot
    }

    fn run_level(&self, level: CleanupLevel) {
        let callbacks = {
            let registry = self.callbacks.read();
            match level {
                CleanupLevel::Gc => registry.gc.clone(),
                CleanupLevel::Soft => registry.soft.clone(),
                CleanupLevel::Spill => registry.spill.clone(),
                CleanupLevel::Aggressive => registry.aggressive.clone(),
            }
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Evaluates current usage against the active limits in escalating
    /// order: reclaim request, soft cleanup, spill, aggressive cleanup.
    /// The limit set is captured once at entry.
    pub fn evaluate(&self) -> EnforcementReport {
        let limits = self.limits();
        let snapshot = self.take_snapshot();
        let usage = snapshot.resident_bytes;
        let mut fired = Vec::new();

        if usage >= limits.gc_threshold_bytes {
            debug!(usage, "reclaim threshold crossed");
            self.viol_gc.fetch_add(1, Ordering::Relaxed);
            self.reclaim_cycles.fetch_add(1, Ordering::Relaxed);
            self.run_level(CleanupLevel::Gc);
            fired.push(CleanupLevel::Gc);
        }

        let count_pressure = snapshot.loaded_files > limits.max_loaded_files
            || snapshot.cached_queries > limits.max_cached_queries;
        if usage >= limits.soft_limit_bytes || count_pressure {
            info!(usage, "soft limit crossed, running cooperative cleanup");
            self.viol_soft.fetch_add(1, Ordering::Relaxed);
            self.run_level(CleanupLevel::Soft);
            fired.push(CleanupLevel::Soft);
        }

        if usage >= limits.spill_threshold_bytes {
            info!(usage, "spill threshold crossed");
            self.viol_spill.fetch_add(1, Ordering::Relaxed);
            self.run_level(CleanupLevel::Spill);
            fired.push(CleanupLevel::Spill);
        }

        if usage >= limits.hard_limit_bytes {
            warn!(usage, "hard limit exceeded, running aggressive cleanup");
            self.viol_hard.fetch_add(1, Ordering::Relaxed);
            self.run_level(CleanupLevel::Aggressive);
            fired.push(CleanupLevel::Aggressive);

            // Backpressure stays on until usage actually drops below the
            // hard limit; resident content already loaded is not penalized
            // further.
            let after = self.probe_resident();
            self.over_hard
                .store(after >= limits.hard_limit_bytes, Ordering::SeqCst);
        } else {
            self.over_hard.store(false, Ordering::SeqCst);
        }

        EnforcementReport { snapshot, fired }
    }

    /// Manual cleanup entry point. Without a level this re-runs the full
    /// escalation; with a level it runs that tier's callbacks directly.
    pub fn trigger_cleanup(&self, level: Option<CleanupLevel>) -> CleanupOutcome {
        let before_bytes = self.probe_resident();
        match level {
            None => {
                self.evaluate();
            }
            Some(level) => {
                if level == CleanupLevel::Gc {
                    self.reclaim_cycles.fetch_add(1, Ordering::Relaxed);
                }
                self.run_level(level);
            }
        }
        let after_bytes = self.probe_resident();
        CleanupOutcome {
            before_bytes,
            after_bytes,
        }
    }

    pub fn violations(&self) -> LimitViolations {
        LimitViolations {
            gc_threshold: self.viol_gc.load(Ordering::Relaxed),
            soft_limit: self.viol_soft.load(Ordering::Relaxed),
            spill_threshold: self.viol_spill.load(Ordering::Relaxed),
            hard_limit: self.viol_hard.load(Ordering::Relaxed),
        }
    }

    /// Full read model: current snapshot, peak, limits, violation counts and
    /// the retained history.
    pub fn profile(&self) -> MemoryProfile {
        let current = self.take_snapshot();
        MemoryProfile {
            current,
            peak_resident_bytes: self.peak_resident.load(Ordering::Relaxed),
            limits: **self.limits.read(),
            violations: self.violations(),
            history: self.history.lock().iter().cloned().collect(),
        }
    }
}

struct NullProbe;

impl UsageProbe for NullProbe {
    fn resident_bytes(&mut self) -> u64 {
        0
    }
}

/// Periodic background monitor. Fully decoupled from scan and search
/// lifecycles: the tick may fire cleanup at any time, including mid-scan.
pub struct MemoryMonitor {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryMonitor {
    pub fn spawn(profiler: Arc<MemoryProfiler>, interval: Duration) -> Self {
        let token = CancellationToken::new();
        let child = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the interval
            // measures from spawn.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        profiler.evaluate();
                    }
                }
            }
            debug!("memory monitor stopped");
        });
        Self {
            token,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn shutdown(&self) {
        self.token.cancel();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
