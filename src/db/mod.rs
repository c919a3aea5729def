//! Domain record store on SQLite with sqlite-vec distance functions.
//!
//! Every domain shares one `records` table; the `domains` table pins the
//! vector dimensionality of a domain on its first embedded insert. Reads go
//! through an `r2d2` pool so concurrent chat requests query in parallel.
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::{Connection, OpenFlags};
use sqlite_vec::sqlite3_vec_init;
use thiserror::Error;
use tracing::info;

pub mod models;
pub mod records;
pub mod search;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS domains (
    name TEXT PRIMARY KEY,
    dimensions INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain TEXT NOT NULL,
    external_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    parent_ref TEXT,
    recorded_at DATETIME,
    embedding BLOB,
    UNIQUE(domain, external_id)
);

CREATE INDEX IF NOT EXISTS idx_records_domain ON records(domain);
CREATE INDEX IF NOT EXISTS idx_records_parent ON records(domain, parent_ref);
CREATE INDEX IF NOT EXISTS idx_records_recorded ON records(domain, recorded_at);
"#;

static INIT_VEC: Once = Once::new();
static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

/// Register sqlite-vec for every connection opened afterwards.
fn init_sqlite_vec() {
    INIT_VEC.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("domain {domain} stores {expected}-dimensional vectors, got {actual}")]
    DimensionMismatch {
        domain: String,
        expected: usize,
        actual: usize,
    },

    #[error("empty vector for domain {0}")]
    EmptyVector(String),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

enum Target {
    File(PathBuf),
    SharedMemory(String),
}

/// `r2d2` connection manager for the record store.
pub struct SqliteManager {
    target: Target,
}

impl r2d2::ManageConnection for SqliteManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        init_sqlite_vec();
        let conn = match &self.target {
            Target::File(path) => {
                let conn = Connection::open(path)?;
                let _mode: String =
                    conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
                conn
            }
            Target::SharedMemory(uri) => Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )?,
        };
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.query_row("SELECT 1", [], |_| Ok(()))
    }

    fn has_broken(&self, _conn: &mut Connection) -> bool {
        false
    }
}

/// Cloneable handle to the pooled record store.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: r2d2::Pool<SqliteManager>,
}

impl Store {
    /// Open (or create) the store at `path` with up to `pool_size` connections.
    pub fn open<P: AsRef<Path>>(path: P, pool_size: u32) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!("Opening record store: {}", path.display());
        Self::build(
            SqliteManager {
                target: Target::File(path.to_path_buf()),
            },
            pool_size,
        )
    }

    /// Open a private in-memory store shared by all pooled connections.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let seq = MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed);
        let uri = format!(
            "file:bostadsrag-{}-{seq}?mode=memory&cache=shared",
            std::process::id()
        );
        Self::build(
            SqliteManager {
                target: Target::SharedMemory(uri),
            },
            4,
        )
    }

    fn build(manager: SqliteManager, pool_size: u32) -> Result<Self, StoreError> {
        let pool = r2d2::Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)?;

        let conn = pool.get()?;
        let vec_version: String = conn.query_row("SELECT vec_version()", [], |row| row.get(0))?;
        info!("sqlite-vec version: {}", vec_version);
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self { pool })
    }
}

/// Serialize a float32 vector into the little-endian blob sqlite-vec reads.
pub fn serialize_vector(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_init() {
        let store = Store::open_in_memory().expect("in-memory store");
        let conn = store.pool.get().unwrap();
        let tables: usize = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name IN ('domains', 'records')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[test]
    fn test_in_memory_stores_are_isolated() {
        let a = Store::open_in_memory().unwrap();
        let b = Store::open_in_memory().unwrap();
        a.pool
            .get()
            .unwrap()
            .execute("INSERT INTO domains (name, dimensions) VALUES ('x', 3)", [])
            .unwrap();
        let count: i64 = b
            .pool
            .get()
            .unwrap()
            .query_row("SELECT count(*) FROM domains", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_file_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        {
            let store = Store::open(&path, 2).unwrap();
            store
                .pool
                .get()
                .unwrap()
                .execute("INSERT INTO domains (name, dimensions) VALUES ('faq', 8)", [])
                .unwrap();
        }
        let store = Store::open(&path, 2).unwrap();
        let dims: i64 = store
            .pool
            .get()
            .unwrap()
            .query_row("SELECT dimensions FROM domains WHERE name = 'faq'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(dims, 8);
    }

    #[test]
    fn test_serialize_vector() {
        let bytes = serialize_vector(&[1.0, -3.5]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x80, 0x3f]);
        assert_eq!(&bytes[4..8], &[0x00, 0x00, 0x60, 0xc0]);
    }
}
