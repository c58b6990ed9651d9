// Integration tests for the public API
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use codescope::{
    BackendKind, ChunkedFileReader, CodeScope, CoreError, LimitsPatch, MemoryLimits, UsageProbe,
    VERSION,
};

fn write(root: &Path, rel: &str, contents: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

/// Probe with externally scripted usage so tests can walk the limit tiers.
struct ScriptedProbe {
    usage: Arc<AtomicU64>,
}

impl UsageProbe for ScriptedProbe {
    fn resident_bytes(&mut self) -> u64 {
        self.usage.load(Ordering::SeqCst)
    }
}

#[test]
fn test_version_constant() {
    assert!(!VERSION.is_empty());
    assert!(VERSION.starts_with("0."));
}

#[test]
fn test_builder_configuration() {
    let state = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();

    let core = CodeScope::builder(project.path())
        .backend(BackendKind::Trie)
        .state_root(state.path())
        .limits(MemoryLimits::default())
        .monitor_interval_secs(60)
        .without_monitor()
        .build();

    assert!(core.is_ok());
}

#[tokio::test]
async fn test_full_workflow() -> anyhow::Result<()> {
    let state = tempfile::tempdir()?;
    let project = tempfile::tempdir()?;
    write(project.path(), "src/lib.rs", b"pub fn hello() {}");
    write(project.path(), "src/util.rs", b"pub fn util() {}");

    let core = CodeScope::builder(project.path())
        .backend(BackendKind::Trie)
        .state_root(state.path())
        .without_monitor()
        .build()?;

    // First scan discovers everything.
    let report = core.scan().await?;
    assert_eq!(report.added, vec!["src/lib.rs", "src/util.rs"]);
    assert!(report.errors.is_empty());

    // Unchanged files appear in no change set on rescan.
    let rescan = core.scan().await?;
    assert!(rescan.is_unchanged());

    // Records and content are reachable through the facade.
    let record = core.get_file_record("src/lib.rs")?;
    assert_eq!(record.extension, "rs");
    assert_eq!(record.size, 17);

    let content = core.get_content("src/lib.rs").await?;
    assert_eq!(content.as_slice(), b"pub fn hello() {}");

    // Search without loading.
    let matches = core.search_content("src/util.rs", "util", true).await?;
    assert_eq!(matches.len(), 1);

    let stats = core.index_stats();
    assert_eq!(stats.total_records, 2);
    Ok(())
}

#[tokio::test]
async fn test_three_file_scenario_with_large_chunked_file() {
    let state = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();

    // A(1KB), B(2KB), C(12MB).
    write(project.path(), "a.txt", &vec![b'a'; 1024]);
    write(project.path(), "b.txt", &vec![b'b'; 2048]);
    let big: Vec<u8> = (0..12 * 1024 * 1024u32).map(|i| (i % 241) as u8).collect();
    write(project.path(), "c.bin", &big);

    let core = CodeScope::builder(project.path())
        .backend(BackendKind::Trie)
        .state_root(state.path())
        .without_monitor()
        .build()
        .unwrap();

    let report = core.scan().await.unwrap();
    assert_eq!(report.added, vec!["a.txt", "b.txt", "c.bin"]);

    // C is above the whole-read threshold: chunked loading, >= 2 chunks.
    let (bytes, chunks) = ChunkedFileReader::new(project.path().join("c.bin"))
        .read_all()
        .unwrap();
    assert_eq!(bytes.len(), big.len());
    assert!(chunks >= 2, "12 MiB file should take multiple 4 MiB chunks");

    let loaded = core.get_content("c.bin").await.unwrap();
    assert_eq!(loaded.len(), big.len());

    // Touch A's mtime without changing content: the rescan rehashes once,
    // confirms the content and reports no modification.
    std::thread::sleep(std::time::Duration::from_millis(50));
    write(project.path(), "a.txt", &vec![b'a'; 1024]);

    let rescan = core.scan().await.unwrap();
    assert!(rescan.modified.is_empty());
    assert!(rescan.added.is_empty());
    assert!(rescan.deleted.is_empty());
}

#[tokio::test]
async fn test_rename_is_delete_plus_add() {
    let state = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    write(project.path(), "before.rs", b"fn same() {}");

    let core = CodeScope::builder(project.path())
        .backend(BackendKind::Trie)
        .state_root(state.path())
        .without_monitor()
        .build()
        .unwrap();
    core.scan().await.unwrap();

    std::fs::rename(
        project.path().join("before.rs"),
        project.path().join("after.rs"),
    )
    .unwrap();

    let report = core.scan().await.unwrap();
    assert_eq!(report.added, vec!["after.rs"]);
    assert_eq!(report.deleted, vec!["before.rs"]);
    assert!(report.modified.is_empty());

    // Hash equality is keyed by path, not content alone.
    let record = core.get_file_record("after.rs").unwrap();
    assert!(matches!(
        core.get_file_record("before.rs"),
        Err(CoreError::NotFound(_))
    ));
    assert!(!record.content_hash.is_empty());
}

#[tokio::test]
async fn test_sqlite_state_survives_a_core_restart() {
    let state = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    write(project.path(), "persist.rs", b"fn keep() {}");

    {
        let core = CodeScope::builder(project.path())
            .backend(BackendKind::Sqlite)
            .state_root(state.path())
            .without_monitor()
            .build()
            .unwrap();
        let report = core.scan().await.unwrap();
        assert_eq!(report.added, vec!["persist.rs"]);
    }

    // A fresh core over the same root sees the persisted records.
    let core = CodeScope::builder(project.path())
        .backend(BackendKind::Sqlite)
        .state_root(state.path())
        .without_monitor()
        .build()
        .unwrap();
    let report = core.scan().await.unwrap();
    assert!(report.is_unchanged());
    assert!(core.get_file_record("persist.rs").is_ok());
}

#[tokio::test]
async fn test_clear_all_reclassifies_everything_as_added() {
    let state = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    write(project.path(), "x.rs", b"1");
    write(project.path(), "y.rs", b"2");

    let core = CodeScope::builder(project.path())
        .backend(BackendKind::Sqlite)
        .state_root(state.path())
        .without_monitor()
        .build()
        .unwrap();
    core.scan().await.unwrap();
    core.get_content("x.rs").await.unwrap();

    core.clear_all().unwrap();

    let rescan = core.scan().await.unwrap();
    assert_eq!(rescan.added, vec!["x.rs", "y.rs"]);
    assert!(rescan.modified.is_empty());
    assert!(rescan.deleted.is_empty());
}

#[tokio::test]
async fn test_escalation_order_and_shrinking_loaded_set() {
    let state = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    for i in 0..8 {
        write(project.path(), &format!("f{i}.rs"), b"some file body");
    }

    let usage = Arc::new(AtomicU64::new(0));
    let limits = MemoryLimits {
        gc_threshold_bytes: 1_000,
        soft_limit_bytes: 2_000,
        spill_threshold_bytes: 3_000,
        hard_limit_bytes: 4_000,
        max_loaded_files: 100,
        max_cached_queries: 100,
    };
    let core = CodeScope::builder(project.path())
        .backend(BackendKind::Trie)
        .state_root(state.path())
        .limits(limits)
        .usage_probe(Box::new(ScriptedProbe {
            usage: usage.clone(),
        }))
        .without_monitor()
        .build()
        .unwrap();

    core.scan().await.unwrap();
    for i in 0..8 {
        core.get_content(&format!("f{i}.rs")).await.unwrap();
    }
    core.cache_query("q", serde_json::json!({"n": 1}));
    let loaded_at = |core: &CodeScope| {
        (0..8)
            .filter(|i| core.is_loaded(&format!("f{i}.rs")))
            .count()
    };
    assert_eq!(loaded_at(&core), 8);

    // Soft: cooperative cleanup halves the resident set.
    usage.store(2_500, Ordering::SeqCst);
    core.trigger_cleanup(None);
    let after_soft = loaded_at(&core);
    assert!(after_soft < 8);

    // Spill: colder query results move to disk; soft fires again, so the
    // loaded count keeps shrinking.
    usage.store(3_500, Ordering::SeqCst);
    core.trigger_cleanup(None);
    let after_spill = loaded_at(&core);
    assert!(after_spill < after_soft);

    // Hard: aggressive cleanup unloads everything.
    usage.store(4_500, Ordering::SeqCst);
    core.trigger_cleanup(None);
    assert_eq!(loaded_at(&core), 0);

    let violations = core.memory_profile().violations;
    assert!(violations.soft_limit >= 3);
    assert!(violations.spill_threshold >= 2);
    assert_eq!(violations.hard_limit, 1);
}

#[tokio::test]
async fn test_hard_limit_backpressure_rejects_new_loads() {
    let state = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    write(project.path(), "cold.rs", b"never loaded yet");

    let usage = Arc::new(AtomicU64::new(10_000));
    let limits = MemoryLimits {
        gc_threshold_bytes: 1_000,
        soft_limit_bytes: 2_000,
        spill_threshold_bytes: 3_000,
        hard_limit_bytes: 4_000,
        max_loaded_files: 100,
        max_cached_queries: 100,
    };
    let core = CodeScope::builder(project.path())
        .backend(BackendKind::Trie)
        .state_root(state.path())
        .limits(limits)
        .usage_probe(Box::new(ScriptedProbe {
            usage: usage.clone(),
        }))
        .without_monitor()
        .build()
        .unwrap();
    core.scan().await.unwrap();

    // Usage stays above the hard limit even after aggressive cleanup.
    core.trigger_cleanup(None);
    assert!(matches!(
        core.get_content("cold.rs").await,
        Err(CoreError::Backpressure)
    ));

    // Once usage drops, the next evaluation clears the backpressure.
    usage.store(100, Ordering::SeqCst);
    core.trigger_cleanup(None);
    assert!(core.get_content("cold.rs").await.is_ok());
}

#[tokio::test]
async fn test_limits_reconfiguration_is_atomic_and_applied() {
    let state = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    write(project.path(), "a.rs", b"a");

    let core = CodeScope::builder(project.path())
        .backend(BackendKind::Trie)
        .state_root(state.path())
        .without_monitor()
        .build()
        .unwrap();
    core.scan().await.unwrap();

    let merged = core
        .configure_limits(LimitsPatch {
            max_loaded_files: Some(5),
            soft_limit_bytes: Some(128 * 1024 * 1024),
            ..LimitsPatch::default()
        })
        .unwrap();
    assert_eq!(merged.max_loaded_files, 5);
    assert_eq!(core.memory_profile().limits.max_loaded_files, 5);

    // Bad ordering: rejected, previous limits intact.
    let err = core.configure_limits(LimitsPatch {
        soft_limit_bytes: Some(u64::MAX),
        ..LimitsPatch::default()
    });
    assert!(matches!(err, Err(CoreError::Config(_))));
    assert_eq!(core.memory_profile().limits.max_loaded_files, 5);
}

#[tokio::test]
async fn test_memory_profile_exposes_history_and_peak() {
    let state = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();

    let usage = Arc::new(AtomicU64::new(500));
    let core = CodeScope::builder(project.path())
        .backend(BackendKind::Trie)
        .state_root(state.path())
        .usage_probe(Box::new(ScriptedProbe {
            usage: usage.clone(),
        }))
        .without_monitor()
        .build()
        .unwrap();

    usage.store(9_999, Ordering::SeqCst);
    core.trigger_cleanup(None);
    usage.store(100, Ordering::SeqCst);

    let profile = core.memory_profile();
    assert_eq!(profile.peak_resident_bytes, 9_999);
    assert!(!profile.history.is_empty());
    assert_eq!(profile.current.resident_bytes, 100);
}

#[tokio::test]
async fn test_query_cache_round_trips_through_the_facade() {
    let state = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();

    let core = CodeScope::builder(project.path())
        .backend(BackendKind::Trie)
        .state_root(state.path())
        .without_monitor()
        .build()
        .unwrap();

    assert!(core.cached_query("pattern:main").is_none());
    core.cache_query("pattern:main", serde_json::json!({"matches": 3}));
    assert_eq!(
        core.cached_query("pattern:main"),
        Some(serde_json::json!({"matches": 3}))
    );

    let stats = core.query_cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn test_durable_query_cache_survives_restart() {
    let state = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();

    {
        let core = CodeScope::builder(project.path())
            .backend(BackendKind::Sqlite)
            .state_root(state.path())
            .without_monitor()
            .build()
            .unwrap();
        core.cache_query("pattern:foo", serde_json::json!({"matches": 7}));
    }

    let core = CodeScope::builder(project.path())
        .backend(BackendKind::Sqlite)
        .state_root(state.path())
        .without_monitor()
        .build()
        .unwrap();

    // The in-memory cache is empty; the durable store backfills it.
    assert_eq!(
        core.cached_query("pattern:foo"),
        Some(serde_json::json!({"matches": 7}))
    );

    core.clear_all().unwrap();
    assert!(core.cached_query("pattern:foo").is_none());
}
