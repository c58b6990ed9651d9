use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use super::StorageBackend;
use crate::types::error::Result;

/// Embedded relational backend: one `kv_store` table behind a connection
/// pool, WAL journaling for concurrent readers.
pub struct SqliteBackend {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl SqliteBackend {
    /// Opens (or creates) the database at `path`. An unreadable database is
    /// treated as missing: the file is removed and recreated empty, so a
    /// corrupt store is silently rebuilt rather than surfaced as fatal.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::types::error::CoreError::io(parent, e))?;
        }

        match Self::open_at(path) {
            Ok(backend) => Ok(backend),
            Err(err) if path.exists() => {
                warn!(path = %path.display(), error = %err, "metadata store unreadable, rebuilding");
                remove_database_files(path);
                Self::open_at(path)
            }
            Err(err) => Err(err),
        }
    }

    fn open_at(path: &Path) -> Result<Self> {
        // Validate and initialize on a direct connection first: a corrupt
        // file then fails immediately instead of cycling the pool until its
        // connection timeout.
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        init_schema(&conn)?;
        conn.query_row("SELECT COUNT(*) FROM kv_store", [], |row| {
            row.get::<_, i64>(0)
        })?;
        drop(conn);

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
        });
        let pool = Pool::builder()
            .max_size(8)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)?;

        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv_store (
            key        TEXT PRIMARY KEY,
            value      BLOB NOT NULL,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );",
    )
}

fn remove_database_files(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut candidate = path.as_os_str().to_owned();
        candidate.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(candidate));
    }
}

impl StorageBackend for SqliteBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.pool.get()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let affected = conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    fn clear(&self) -> Result<()> {
        // Dropping data and re-establishing the schema is one contract; the
        // store must be usable by the very next call.
        let conn = self.pool.get()?;
        conn.execute_batch("DELETE FROM kv_store;")?;
        init_schema(&conn)?;
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM kv_store", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn keys(&self) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT key FROM kv_store ORDER BY key")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for key in rows {
            keys.push(key?);
        }
        Ok(keys)
    }

    fn items(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT key, value FROM kv_store ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut items = Vec::new();
        for item in rows {
            items.push(item?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("meta.db");

        {
            let backend = SqliteBackend::open(&db).unwrap();
            backend.put("k", b"v").unwrap();
        }

        let backend = SqliteBackend::open(&db).unwrap();
        assert_eq!(backend.get("k").unwrap().as_deref(), Some(&b"v"[..]));
    }

    #[test]
    fn corrupt_database_is_rebuilt_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("meta.db");
        std::fs::write(&db, b"this is not a sqlite database, not even close").unwrap();

        let backend = SqliteBackend::open(&db).unwrap();
        assert_eq!(backend.len().unwrap(), 0);
        backend.put("k", b"v").unwrap();
        assert_eq!(backend.get("k").unwrap().as_deref(), Some(&b"v"[..]));
    }

    #[test]
    fn clear_is_immediately_reusable() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::open(&dir.path().join("meta.db")).unwrap();

        for i in 0..10 {
            backend.put(&format!("key{i}"), b"x").unwrap();
        }
        backend.clear().unwrap();
        assert_eq!(backend.len().unwrap(), 0);

        backend.put("fresh", b"y").unwrap();
        assert_eq!(backend.len().unwrap(), 1);
    }

    #[test]
    fn concurrent_writers_do_not_lose_entries() {
        let dir = tempfile::tempdir().unwrap();
        let backend = std::sync::Arc::new(SqliteBackend::open(&dir.path().join("meta.db")).unwrap());

        let mut handles = Vec::new();
        for t in 0..4 {
            let backend = backend.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..25 {
                    backend.put(&format!("t{t}/k{i}"), b"payload").unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(backend.len().unwrap(), 100);
    }
}
