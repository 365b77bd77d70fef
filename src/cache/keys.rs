//! Naming convention for everything the crate writes to the key/value store.

/// Bump to invalidate every existing entry.
pub const CACHE_VERSION: &str = "v1";

pub const ENTRY_PREFIX: &str = "driveCache_";
pub const METADATA_PREFIX: &str = "driveCacheMetadata_";
pub const PROGRESS_PREFIX: &str = "cachePreloadProgress_";
const RESOLVED_FOLDER_PREFIX: &str = "resolvedFolderCache_";
/// Batch catalogue the site keeps alongside the listing cache
const BATCH_DATA_KEY: &str = "BATCH_DATA_CACHE";

/// Any key containing one of these is removed by a full clear.
pub const SWEEP_PREFIXES: &[&str] = &[
  ENTRY_PREFIX,
  METADATA_PREFIX,
  RESOLVED_FOLDER_PREFIX,
  BATCH_DATA_KEY,
  PROGRESS_PREFIX,
];

pub fn entry_key(folder_id: &str, scope: &str, depth: u32) -> String {
  format!("{ENTRY_PREFIX}{scope}_{CACHE_VERSION}_{folder_id}_{depth}")
}

pub fn metadata_key(scope: &str) -> String {
  format!("{METADATA_PREFIX}{scope}_{CACHE_VERSION}")
}

/// Record holding background preload progress for `scope`.
pub fn progress_key(scope: &str) -> String {
  format!("{PROGRESS_PREFIX}{scope}_{CACHE_VERSION}")
}
