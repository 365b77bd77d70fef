//! Result wrapper recording where a listing came from.

use crate::limiter::FallbackReason;

/// Result from a cache-aware fetch, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  /// Data served from a valid cache entry.
  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }

  /// Placeholder data after a failed request.
  pub fn fallback(data: T, reason: FallbackReason) -> Self {
    Self {
      data,
      source: CacheSource::Fallback(reason),
    }
  }

  pub fn is_cached(&self) -> bool {
    self.source == CacheSource::Cache
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched from the provider just now
  Network,
  /// Read from a valid cache entry
  Cache,
  /// The request failed; the data is an empty stand-in
  Fallback(FallbackReason),
}
