//! Client-local key/value persistence.
//!
//! The cache store and the background preloader only see [`KeyValueStore`].
//! The SQLite backend is what the binary uses; the in-memory backend serves
//! tests and `--ephemeral` runs.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use color_eyre::Result;

/// A flat string key/value namespace.
pub trait KeyValueStore: Send + Sync {
  /// Read the value stored under `key`.
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Store `value` under `key`, replacing any previous value.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  /// Delete `key`. Deleting a missing key is not an error.
  fn remove(&self, key: &str) -> Result<()>;

  /// Every key currently present in the namespace.
  fn keys(&self) -> Result<Vec<String>>;
}
