pub mod sqlite;
pub mod trie;

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::error::Result;

pub use sqlite::SqliteBackend;
pub use trie::TrieBackend;

/// Key-value persistence used for FileRecord metadata and durable caches.
///
/// Implementations are internally synchronized for concurrent access and are
/// interchangeable: callers never depend on a specific backend's internals.
/// `clear` is a single atomic contract — it drops all data *and* leaves the
/// backend immediately usable for the next operation; a backend that deletes
/// data without guaranteeing the structure's availability is non-conformant.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Returns true when the key existed.
    fn delete(&self, key: &str) -> Result<bool>;
    /// Drops all entries and re-establishes the backing structure.
    fn clear(&self) -> Result<()>;
    fn len(&self) -> Result<usize>;
    fn keys(&self) -> Result<Vec<String>>;
    fn items(&self) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Which backend implementation to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    Trie,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Sqlite
    }
}

/// Opens a backend of the requested kind. `dir`/`name` locate the on-disk
/// store for durable kinds; the trie backend ignores them.
pub fn open_backend(kind: BackendKind, dir: &Path, name: &str) -> Result<Arc<dyn StorageBackend>> {
    match kind {
        BackendKind::Sqlite => {
            let backend = SqliteBackend::open(&dir.join(format!("{name}.db")))?;
            Ok(Arc::new(backend))
        }
        BackendKind::Trie => Ok(Arc::new(TrieBackend::new())),
    }
}
