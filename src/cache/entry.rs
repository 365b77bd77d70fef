use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::keys::CACHE_VERSION;

/// A stored payload with its creation time (epoch millis) and format version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  #[serde(alias = "files")]
  pub data: T,
  pub timestamp: i64,
  pub version: String,
}

impl<T> CacheEntry<T> {
  /// Stamp `data` with the current time and version.
  pub fn new(data: T) -> Self {
    Self {
      data,
      timestamp: Utc::now().timestamp_millis(),
      version: CACHE_VERSION.to_string(),
    }
  }
}

/// Just the validity fields of an entry, readable without decoding the payload.
#[derive(Debug, Deserialize)]
pub(crate) struct EntryStamp {
  pub timestamp: i64,
  pub version: String,
}

impl EntryStamp {
  pub fn is_valid(&self, ttl: Duration, now_ms: i64) -> bool {
    now_ms - self.timestamp <= ttl.num_milliseconds() && self.version == CACHE_VERSION
  }

  /// Validity of a raw stored value; unreadable values are invalid.
  pub fn check(raw: &str, ttl: Duration, now_ms: i64) -> bool {
    serde_json::from_str::<EntryStamp>(raw)
      .map(|stamp| stamp.is_valid(ttl, now_ms))
      .unwrap_or(false)
  }
}

/// Keys belonging to one scope, plus bookkeeping times.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
  #[serde(default)]
  pub keys: BTreeSet<String>,
  #[serde(rename = "lastUpdated", default)]
  pub last_updated: i64,
  #[serde(rename = "lastCleanup", default)]
  pub last_cleanup: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
  /// Keys listed in the scope metadata
  pub total_keys: usize,
  /// Combined length of the stored values
  pub total_size: usize,
  pub valid_keys: usize,
  pub expired_keys: usize,
}
