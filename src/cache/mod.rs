//! Persistent listing cache.
//!
//! Folder listings are stored in the client-local key/value store under
//! `driveCache_<scope>_<version>_<folderId>_<depth>`, each stamped with its
//! creation time and format version. A per-scope metadata record tracks which
//! entry keys belong to the scope so it can be counted, cleaned and cleared
//! in bulk.
//!
//! Entries older than the TTL or written under another format version are
//! treated as absent and purged when read. Storage failures never escape:
//! they are logged and behave like a miss.

mod entry;
mod keys;
mod store;
mod traits;

pub use entry::{CacheEntry, CacheMetadata, CacheStats};
pub use keys::{
  entry_key, metadata_key, progress_key, CACHE_VERSION, ENTRY_PREFIX, METADATA_PREFIX,
  PROGRESS_PREFIX, SWEEP_PREFIXES,
};
pub use store::CacheStore;
pub use traits::{CacheResult, CacheSource};
