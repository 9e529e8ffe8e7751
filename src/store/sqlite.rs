//! SQLite implementation of the key-value store.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::traits::KeyValueStore;
use crate::error::StorageError;

/// Table used by the response cache.
pub const CACHE_TABLE: &str = "response_cache";
/// Table used by the offline request queue.
pub const QUEUE_TABLE: &str = "offline_queue";

/// SQLite-based store. One instance owns one table through its own
/// connection, so the cache and queue tables can live in the same file
/// without sharing a lock.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  table: String,
}

impl SqliteStore {
  /// Open (or create) `table` inside the database at `path`.
  pub fn open(path: &Path, table: &str) -> Result<Self, StorageError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent).map_err(|e| {
          StorageError::Io(format!(
            "failed to create directory {}: {}",
            parent.display(),
            e
          ))
        })?;
      }
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    debug!(path = %path.display(), table, "opened sqlite store");
    Self::with_connection(conn, table)
  }

  /// Open `table` in a private in-memory database.
  pub fn open_in_memory(table: &str) -> Result<Self, StorageError> {
    Self::with_connection(Connection::open_in_memory()?, table)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf, StorageError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StorageError::Io("could not determine data directory".into()))?;

    Ok(data_dir.join("gqlsync").join("store.db"))
  }

  fn with_connection(conn: Connection, table: &str) -> Result<Self, StorageError> {
    validate_table(table)?;
    let store = Self {
      conn: Mutex::new(conn),
      table: table.to_string(),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Create the table if needed. Safe to run on every open.
  fn run_migrations(&self) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute_batch(&format!(
      "CREATE TABLE IF NOT EXISTS {table} (
         key TEXT PRIMARY KEY,
         value BLOB NOT NULL,
         written_at TEXT NOT NULL DEFAULT (datetime('now'))
       );",
      table = self.table
    ))?;
    Ok(())
  }

  pub fn table(&self) -> &str {
    &self.table
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::LockPoisoned(e.to_string()))
  }
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
fn validate_table(table: &str) -> Result<(), StorageError> {
  let mut chars = table.chars();
  let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
  if valid {
    Ok(())
  } else {
    Err(StorageError::InvalidTable(table.to_string()))
  }
}

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare_cached(&format!(
      "SELECT value FROM {} WHERE key = ?",
      self.table
    ))?;
    let value = stmt
      .query_row(params![key], |row| row.get::<_, Vec<u8>>(0))
      .optional()?;
    Ok(value)
  }

  fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute(
      &format!(
        "INSERT OR REPLACE INTO {} (key, value, written_at) VALUES (?, ?, datetime('now'))",
        self.table
      ),
      params![key, value],
    )?;
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<bool, StorageError> {
    let conn = self.lock()?;
    let removed = conn.execute(
      &format!("DELETE FROM {} WHERE key = ?", self.table),
      params![key],
    )?;
    Ok(removed > 0)
  }

  fn list(&self) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare_cached(&format!(
      "SELECT key, value FROM {} ORDER BY key",
      self.table
    ))?;
    let rows = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<Result<Vec<(String, Vec<u8>)>, _>>()?;
    Ok(rows)
  }

  fn clear(&self) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute(&format!("DELETE FROM {}", self.table), [])?;
    Ok(())
  }

  fn len(&self) -> Result<usize, StorageError> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row(
      &format!("SELECT COUNT(*) FROM {}", self.table),
      [],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }
}
