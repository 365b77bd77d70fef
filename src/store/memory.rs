use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::KeyValueStore;

/// Store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, String>>> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    Ok(self.entries()?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    self.entries()?.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.entries()?.remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(self.entries()?.keys().cloned().collect())
  }
}
