//! TTL'd, versioned listing cache over a [`KeyValueStore`].

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::drive::FileEntry;
use crate::store::KeyValueStore;

use super::entry::{CacheEntry, CacheMetadata, CacheStats, EntryStamp};
use super::keys::{entry_key, metadata_key, SWEEP_PREFIXES};

/// Listing cache shared by every crawl in the process.
///
/// Every public operation is infallible; storage errors are logged and
/// degrade to a miss or a no-op.
#[derive(Clone)]
pub struct CacheStore {
  store: Arc<dyn KeyValueStore>,
  ttl: Duration,
  /// Scopes cleared by name during a full clear
  known_scopes: Arc<Vec<String>>,
  /// Serializes read-modify-write of metadata records
  metadata_lock: Arc<Mutex<()>>,
}

impl CacheStore {
  pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
    Self {
      store,
      ttl: Duration::hours(24),
      known_scopes: Arc::new(Vec::new()),
      metadata_lock: Arc::new(Mutex::new(())),
    }
  }

  /// Set how long entries stay valid.
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  /// Set the scopes a full clear walks by name.
  pub fn with_known_scopes(mut self, scopes: Vec<String>) -> Self {
    self.known_scopes = Arc::new(scopes);
    self
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  /// The underlying key/value store.
  pub fn backing_store(&self) -> &Arc<dyn KeyValueStore> {
    &self.store
  }

  /// Cached listing for `folder_id`, if present and still valid.
  pub fn get(&self, folder_id: &str, scope: &str, depth: u32) -> Option<Vec<FileEntry>> {
    self
      .try_get(folder_id, scope, depth)
      .unwrap_or_else(|e| {
        warn!("Failed to load from persistent cache: {}", e);
        None
      })
  }

  /// Store a listing stamped with the current time and version.
  pub fn put(&self, folder_id: &str, scope: &str, depth: u32, files: &[FileEntry]) {
    self.put_entry(folder_id, scope, depth, &CacheEntry::new(files))
  }

  /// Store a pre-stamped entry as-is.
  pub fn put_entry<T: serde::Serialize>(
    &self,
    folder_id: &str,
    scope: &str,
    depth: u32,
    entry: &CacheEntry<T>,
  ) {
    if let Err(e) = self.try_put(folder_id, scope, depth, entry) {
      warn!("Failed to save to persistent cache: {}", e);
    }
  }

  pub fn stats(&self, scope: &str) -> CacheStats {
    self.try_stats(scope).unwrap_or_else(|e| {
      warn!("Failed to get cache stats for {}: {}", scope, e);
      CacheStats::default()
    })
  }

  /// Delete every entry of `scope` and its metadata. Returns the number of
  /// entries removed.
  pub fn clear_scope(&self, scope: &str) -> usize {
    match self.try_clear_scope(scope) {
      Ok(cleared) => {
        info!("Cleared {} cache entries for {}", cleared, scope);
        cleared
      }
      Err(e) => {
        warn!("Failed to clear cache for {}: {}", scope, e);
        0
      }
    }
  }

  /// Clear every known scope, then sweep any remaining key that follows the
  /// crate's naming convention. Returns the number of records removed.
  pub fn clear_all(&self) -> usize {
    let mut cleared = 0;

    for scope in self.known_scopes.iter() {
      match self.try_clear_scope(scope) {
        Ok(count) => cleared += count,
        Err(e) => warn!("Failed to clear cache for {}: {}", scope, e),
      }
    }

    match self.sweep() {
      Ok(count) => cleared += count,
      Err(e) => warn!("Failed to sweep cache keys: {}", e),
    }

    info!("Cleared {} cache entries", cleared);
    cleared
  }

  /// Remove expired or unreadable entries of `scope` and rewrite its
  /// metadata to the surviving keys. Returns the number of entries removed.
  pub fn clean_expired(&self, scope: &str) -> usize {
    match self.try_clean_expired(scope) {
      Ok(cleaned) => {
        info!("Cleaned {} expired cache entries for {}", cleaned, scope);
        cleaned
      }
      Err(e) => {
        warn!("Failed to clean expired cache for {}: {}", scope, e);
        0
      }
    }
  }

  fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
  }

  fn try_get(&self, folder_id: &str, scope: &str, depth: u32) -> Result<Option<Vec<FileEntry>>> {
    let key = entry_key(folder_id, scope, depth);
    let Some(raw) = self.store.get(&key)? else {
      return Ok(None);
    };

    let entry = serde_json::from_str::<CacheEntry<Vec<FileEntry>>>(&raw);
    let valid = EntryStamp::check(&raw, self.ttl, Self::now_ms());

    match entry {
      Ok(entry) if valid => Ok(Some(entry.data)),
      _ => {
        debug!("Purging invalid cache entry {}", key);
        self.store.remove(&key)?;
        self.unregister(&key, scope)?;
        Ok(None)
      }
    }
  }

  fn try_put<T: serde::Serialize>(
    &self,
    folder_id: &str,
    scope: &str,
    depth: u32,
    entry: &CacheEntry<T>,
  ) -> Result<()> {
    let key = entry_key(folder_id, scope, depth);
    let value =
      serde_json::to_string(entry).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;

    self.store.set(&key, &value)?;
    self.register(&key, scope)
  }

  fn try_stats(&self, scope: &str) -> Result<CacheStats> {
    let metadata = self.read_metadata(scope)?;
    let now = Self::now_ms();
    let mut stats = CacheStats {
      total_keys: metadata.keys.len(),
      ..CacheStats::default()
    };

    for key in &metadata.keys {
      if let Some(raw) = self.store.get(key)? {
        stats.total_size += raw.len();
        if EntryStamp::check(&raw, self.ttl, now) {
          stats.valid_keys += 1;
        } else {
          stats.expired_keys += 1;
        }
      }
    }

    Ok(stats)
  }

  fn try_clear_scope(&self, scope: &str) -> Result<usize> {
    let _guard = self.lock_metadata();
    let metadata = self.read_metadata(scope)?;

    for key in &metadata.keys {
      self.store.remove(key)?;
    }
    self.store.remove(&metadata_key(scope))?;

    Ok(metadata.keys.len())
  }

  fn sweep(&self) -> Result<usize> {
    let mut removed = 0;
    for key in self.store.keys()? {
      if SWEEP_PREFIXES.iter().any(|prefix| key.contains(prefix)) {
        self.store.remove(&key)?;
        removed += 1;
      }
    }
    Ok(removed)
  }

  fn try_clean_expired(&self, scope: &str) -> Result<usize> {
    let _guard = self.lock_metadata();
    let mut metadata = self.read_metadata(scope)?;
    let now = Self::now_ms();
    let mut cleaned = 0;

    let mut surviving = metadata.keys.clone();
    for key in &metadata.keys {
      match self.store.get(key)? {
        Some(raw) if EntryStamp::check(&raw, self.ttl, now) => {}
        Some(_) => {
          self.store.remove(key)?;
          surviving.remove(key);
          cleaned += 1;
        }
        // Listed but gone: drop the stale key
        None => {
          surviving.remove(key);
        }
      }
    }

    metadata.keys = surviving;
    metadata.last_cleanup = now;
    self.write_metadata(scope, &metadata)?;

    Ok(cleaned)
  }

  fn lock_metadata(&self) -> std::sync::MutexGuard<'_, ()> {
    self
      .metadata_lock
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn read_metadata(&self, scope: &str) -> Result<CacheMetadata> {
    match self.store.get(&metadata_key(scope))? {
      None => Ok(CacheMetadata::default()),
      Some(raw) => serde_json::from_str(&raw).or_else(|e| {
        warn!("Discarding unreadable cache metadata for {}: {}", scope, e);
        Ok(CacheMetadata::default())
      }),
    }
  }

  fn write_metadata(&self, scope: &str, metadata: &CacheMetadata) -> Result<()> {
    let value =
      serde_json::to_string(metadata).map_err(|e| eyre!("Failed to serialize metadata: {}", e))?;
    self.store.set(&metadata_key(scope), &value)
  }

  fn register(&self, key: &str, scope: &str) -> Result<()> {
    let _guard = self.lock_metadata();
    let mut metadata = self.read_metadata(scope)?;
    metadata.keys.insert(key.to_string());
    metadata.last_updated = Self::now_ms();
    self.write_metadata(scope, &metadata)
  }

  fn unregister(&self, key: &str, scope: &str) -> Result<()> {
    let _guard = self.lock_metadata();
    let mut metadata = self.read_metadata(scope)?;
    if metadata.keys.remove(key) {
      self.write_metadata(scope, &metadata)?;
    }
    Ok(())
  }
}
