use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::storage::BackendKind;
use crate::types::error::{CoreError, Result};
use crate::types::memory::MemoryLimits;

static DEFAULT_STATE_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    directories::ProjectDirs::from("", "", "codescope")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("codescope"))
});

/// Default chunk size for chunked reads and hashing: 4 MiB.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Files at or above this size are read and hashed chunk-by-chunk instead of
/// in one operation: 10 MiB.
pub const WHOLE_READ_LIMIT: u64 = 10 * 1024 * 1024;

/// Top-level configuration for one project core.
///
/// Loaded in layers, later layers winning: built-in defaults, an optional
/// `codescope.toml`, then `CODESCOPE_*` environment overrides. Validation is
/// all-or-nothing; a config that fails validation is never partially applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub scan: ScanSettings,
    pub memory: MemoryLimits,
    pub monitor: MonitorSettings,
    pub storage: StorageSettings,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            scan: ScanSettings::default(),
            memory: MemoryLimits::default(),
            monitor: MonitorSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

/// Directory-walk settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Glob patterns a path must match to be indexed. Empty means all files.
    pub include_patterns: Vec<String>,
    /// Glob patterns that exclude a path even when included.
    pub exclude_patterns: Vec<String>,
    pub follow_symlinks: bool,
    pub max_depth: Option<usize>,
    /// Files larger than this are skipped entirely (bytes).
    pub max_file_size: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            include_patterns: Vec::new(),
            exclude_patterns: vec![
                "**/.git/**".to_string(),
                "**/node_modules/**".to_string(),
                "**/target/**".to_string(),
                "**/__pycache__/**".to_string(),
                "**/.venv/**".to_string(),
            ],
            follow_symlinks: false,
            max_depth: None,
            max_file_size: 100 * 1024 * 1024,
        }
    }
}

/// Background memory-monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Seconds between monitoring ticks.
    pub interval_secs: u64,
    /// Snapshots retained in the ring buffer.
    pub history_len: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            history_len: 100,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: BackendKind,
    /// Root under which per-project state directories are created. Defaults
    /// to the OS cache directory.
    pub state_root: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sqlite,
            state_root: None,
        }
    }
}

impl CoreConfig {
    /// Loads configuration from defaults, an optional TOML file, and
    /// environment overrides (`CODESCOPE_MEMORY__SOFT_LIMIT_BYTES=...`).
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&CoreConfig::default())
            .map_err(|e| CoreError::Config(e.to_string()))?;

        let mut builder = Config::builder().add_source(defaults);
        builder = match explicit {
            Some(path) => builder.add_source(File::from(path.to_path_buf())),
            None => builder.add_source(File::with_name("codescope").required(false)),
        };
        builder = builder.add_source(
            Environment::with_prefix("CODESCOPE")
                .separator("__")
                .try_parsing(true),
        );

        let merged: CoreConfig = builder
            .build()
            .map_err(|e| CoreError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        merged.validate()?;
        Ok(merged)
    }

    /// Synchronous, total validation of the merged configuration.
    pub fn validate(&self) -> Result<()> {
        self.memory.validate()?;

        if self.monitor.interval_secs == 0 {
            return Err(CoreError::Config("monitor.interval_secs must be non-zero".into()));
        }
        if self.monitor.history_len == 0 {
            return Err(CoreError::Config("monitor.history_len must be non-zero".into()));
        }

        for pattern in self
            .scan
            .include_patterns
            .iter()
            .chain(self.scan.exclude_patterns.iter())
        {
            globset::Glob::new(pattern)
                .map_err(|e| CoreError::Config(format!("bad glob '{pattern}': {e}")))?;
        }
        Ok(())
    }

    /// Root directory for all per-project state.
    pub fn state_root(&self) -> PathBuf {
        match &self.storage.state_root {
            Some(root) => root.clone(),
            None => DEFAULT_STATE_ROOT.clone(),
        }
    }

    /// Renders the configuration as TOML, e.g. for seeding a
    /// `codescope.toml`.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.monitor.interval_secs, 30);
        assert_eq!(config.memory.max_loaded_files, 100);
    }

    #[test]
    fn bad_glob_is_rejected() {
        let mut config = CoreConfig::default();
        config.scan.include_patterns.push("[".into());
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut config = CoreConfig::default();
        config.monitor.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codescope.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[memory]\nmax_loaded_files = 7\n\n[monitor]\ninterval_secs = 5"
        )
        .unwrap();

        let config = CoreConfig::load(Some(&path)).unwrap();
        assert_eq!(config.memory.max_loaded_files, 7);
        assert_eq!(config.monitor.interval_secs, 5);
        // Untouched sections keep their defaults.
        assert_eq!(config.monitor.history_len, 100);
    }

    #[test]
    fn to_toml_round_trips() {
        let mut config = CoreConfig::default();
        config.memory.max_loaded_files = 42;

        let rendered = config.to_toml().unwrap();
        let back: CoreConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(back.memory.max_loaded_files, 42);
        assert_eq!(back.monitor.interval_secs, config.monitor.interval_secs);
    }

    #[test]
    fn invalid_file_ordering_is_rejected_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codescope.toml");
        std::fs::write(
            &path,
            "[memory]\nsoft_limit_bytes = 99\nhard_limit_bytes = 10\n",
        )
        .unwrap();

        assert!(CoreConfig::load(Some(&path)).is_err());
    }
}
