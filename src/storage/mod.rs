use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

use crate::config::{ConfigPaths, StorageOptions};

mod schema;
mod write_behind;

pub use write_behind::WriteBehindStore;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite error")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored value for `{key}` is not valid JSON")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("persistence backend unavailable: {0}")]
    Unavailable(String),
}

/// Asynchronous-in-spirit key/value store the history engine writes through.
/// Implementations must tolerate being shared across threads.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError>;
    fn set(&self, key: &str, value: Value) -> Result<(), PersistenceError>;

    /// Writes that were accepted but later failed to land.
    fn failed_writes(&self) -> usize {
        0
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, Value>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `set` fail until switched off again.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable(format!(
                "write to `{key}` rejected"
            )));
        }
        self.values.write().insert(key.to_string(), value);
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    db_path: Arc<PathBuf>,
    options: Arc<StorageOptions>,
}

impl SqliteStore {
    pub fn open(db_path: &Path, options: &StorageOptions) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?;
        prepare_connection(&conn, options)?;
        schema::apply(&conn)?;
        Ok(Self {
            db_path: Arc::new(db_path.to_path_buf()),
            options: Arc::new(options.clone()),
        })
    }

    pub fn connect(&self) -> Result<Connection, PersistenceError> {
        let conn = Connection::open(&*self.db_path)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(
            None,
            "wal_autocheckpoint",
            self.options.wal_autocheckpoint.to_string(),
        )?;
        Ok(conn)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        let conn = self.connect()?;
        let raw: Option<String> = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|source| PersistenceError::Corrupt {
                key: key.to_string(),
                source,
            })
        })
        .transpose()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), PersistenceError> {
        let conn = self.connect()?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                            updated_at = excluded.updated_at",
            params![key, value.to_string(), now],
        )?;
        Ok(())
    }
}

/// Opens the configured persistence backend: SQLite, optionally behind a
/// write-behind queue.
pub fn init(paths: &ConfigPaths, options: &StorageOptions) -> Result<Arc<dyn KeyValueStore>> {
    let db_path = if options.database_path.as_os_str().is_empty() {
        paths.database_path.clone()
    } else {
        options.database_path.clone()
    };
    let sqlite = SqliteStore::open(&db_path, options)?;
    if options.write_behind {
        let store = WriteBehindStore::spawn(Arc::new(sqlite))
            .context("starting write-behind persistence")?;
        Ok(Arc::new(store))
    } else {
        Ok(Arc::new(sqlite))
    }
}

fn prepare_connection(conn: &Connection, storage: &StorageOptions) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("setting journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("setting synchronous=NORMAL")?;
    conn.pragma_update(
        None,
        "wal_autocheckpoint",
        storage.wal_autocheckpoint.to_string(),
    )
    .context("setting wal_autocheckpoint")?;
    Ok(())
}
