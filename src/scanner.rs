use std::path::Path;

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use tracing::debug;

use crate::config::ScanSettings;
use crate::types::error::{CoreError, Result};
use crate::types::file::ScanWarning;

/// One entry from a directory walk: everything change detection needs
/// without opening the file.
#[derive(Debug, Clone, PartialEq)]
pub struct WalkedFile {
    /// Path relative to the walk root, `/`-separated.
    pub rel_path: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

/// Result of one walk: the consistent file snapshot plus per-entry warnings.
#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub files: Vec<WalkedFile>,
    pub warnings: Vec<ScanWarning>,
}

/// Directory walker honoring include/exclude globs, symlink policy, depth
/// and size limits. One `walk` call produces the single consistent snapshot
/// a scan classifies against.
pub struct TreeWalker {
    include: Option<GlobSet>,
    exclude: GlobSet,
    follow_symlinks: bool,
    max_depth: Option<usize>,
    max_file_size: u64,
}

impl TreeWalker {
    pub fn new(settings: &ScanSettings) -> Result<Self> {
        let include = if settings.include_patterns.is_empty() {
            None
        } else {
            Some(build_globset(&settings.include_patterns)?)
        };
        let exclude = build_globset(&settings.exclude_patterns)?;

        Ok(Self {
            include,
            exclude,
            follow_symlinks: settings.follow_symlinks,
            max_depth: settings.max_depth,
            max_file_size: settings.max_file_size,
        })
    }

    /// Walks `root`, returning matching files with their size and mtime.
    /// Entries that cannot be stat'd become warnings, not failures.
    pub fn walk(&self, root: &Path) -> WalkOutcome {
        let mut outcome = WalkOutcome::default();

        let mut builder = WalkBuilder::new(root);
        builder
            .follow_links(self.follow_symlinks)
            .standard_filters(true);
        if let Some(depth) = self.max_depth {
            builder.max_depth(Some(depth));
        }

        for entry in builder.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    outcome.warnings.push(ScanWarning {
                        path: "(walk)".to_string(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            if !entry.file_type().map_or(false, |ft| ft.is_file()) {
                continue;
            }

            let rel_path = match entry.path().strip_prefix(root) {
                Ok(rel) => to_slash(rel),
                Err(_) => continue,
            };

            if !self.matches(&rel_path) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    outcome.warnings.push(ScanWarning {
                        path: rel_path,
                        reason: format!("stat failed: {err}"),
                    });
                    continue;
                }
            };

            if metadata.len() > self.max_file_size {
                debug!(path = %rel_path, size = metadata.len(), "skipping oversized file");
                continue;
            }

            let mtime = match metadata.modified() {
                Ok(mtime) => DateTime::<Utc>::from(mtime),
                Err(err) => {
                    outcome.warnings.push(ScanWarning {
                        path: rel_path,
                        reason: format!("mtime unavailable: {err}"),
                    });
                    continue;
                }
            };

            outcome.files.push(WalkedFile {
                rel_path,
                size: metadata.len(),
                mtime,
            });
        }

        outcome.files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        outcome
    }

    fn matches(&self, rel_path: &str) -> bool {
        if self.exclude.is_match(rel_path) {
            return false;
        }
        match &self.include {
            Some(include) => include.is_match(rel_path),
            None => true,
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| CoreError::Config(format!("bad glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| CoreError::Config(e.to_string()))
}

fn to_slash(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}
