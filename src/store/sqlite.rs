//! SQLite-backed key/value store.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::KeyValueStore;

/// Key/value store persisted in a single SQLite table.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("drivecrawl").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    self
      .conn()?
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete {}: {}", key, e))?;

    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT key FROM kv_store ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare key scan: {}", e))?;

    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to scan keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_values_survive_reopen() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("nested").join("cache.db");

    {
      let store = SqliteStore::open_at(&path).unwrap();
      store.set("driveCache_drive_v1_F1_0", "{}").unwrap();
      store.set("other", "x").unwrap();
    }

    let store = SqliteStore::open_at(&path).unwrap();
    assert_eq!(
      store.get("driveCache_drive_v1_F1_0").unwrap().as_deref(),
      Some("{}")
    );
    assert_eq!(
      store.keys().unwrap(),
      vec!["driveCache_drive_v1_F1_0".to_string(), "other".to_string()]
    );
  }

  #[test]
  fn test_overwrite_and_remove() {
    let temp = TempDir::new().unwrap();
    let store = SqliteStore::open_at(&temp.path().join("cache.db")).unwrap();

    store.set("k", "1").unwrap();
    store.set("k", "2").unwrap();
    assert_eq!(store.get("k").unwrap().as_deref(), Some("2"));

    store.remove("k").unwrap();
    store.remove("k").unwrap();
    assert_eq!(store.get("k").unwrap(), None);
  }
}
