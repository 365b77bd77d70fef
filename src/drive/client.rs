//! Drive client that resolves folder listings through the cache store and
//! falls back to the rate-limited network.

use color_eyre::{eyre::eyre, Result};
use tracing::debug;
use url::Url;

use crate::cache::{CacheResult, CacheStore};
use crate::limiter::{Fetched, RateLimiter};

use super::keys::{fingerprint, ApiKeyPool};
use super::types::FileEntry;

const LISTING_FIELDS: &str = "files(id,name,mimeType,webViewLink)";
const PAGE_SIZE: &str = "1000";

/// Lists the direct children of drive folders.
///
/// Clones share the limiter, cache and key rotation.
#[derive(Clone)]
pub struct DriveClient {
  limiter: RateLimiter,
  cache: CacheStore,
  keys: ApiKeyPool,
  api_base: Url,
}

impl DriveClient {
  pub fn new(limiter: RateLimiter, cache: CacheStore, keys: ApiKeyPool, api_base: &str) -> Result<Self> {
    let api_base =
      Url::parse(api_base).map_err(|e| eyre!("Invalid Drive API base {}: {}", api_base, e))?;

    Ok(Self {
      limiter,
      cache,
      keys,
      api_base,
    })
  }

  /// Same cache and keys, different request queue.
  pub fn with_limiter(&self, limiter: RateLimiter) -> Self {
    Self {
      limiter,
      ..self.clone()
    }
  }

  pub fn limiter(&self) -> &RateLimiter {
    &self.limiter
  }

  pub fn cache(&self) -> &CacheStore {
    &self.cache
  }

  /// Query URL for the non-trashed direct children of `folder_id`.
  pub fn listing_url(&self, folder_id: &str, api_key: &str) -> Url {
    let mut url = self.api_base.clone();
    url
      .query_pairs_mut()
      .append_pair("q", &format!("'{}' in parents and trashed=false", folder_id))
      .append_pair("key", api_key)
      .append_pair("fields", LISTING_FIELDS)
      .append_pair("pageSize", PAGE_SIZE)
      .append_pair("orderBy", "name");
    url
  }

  /// Children of `folder_id`, empty on any failure.
  pub async fn list_children(
    &self,
    folder_id: &str,
    scope: &str,
    depth: u32,
    use_cache: bool,
  ) -> Vec<FileEntry> {
    self
      .fetch_children(folder_id, scope, depth, use_cache)
      .await
      .data
  }

  /// Like [`list_children`](Self::list_children), also reporting where the
  /// listing came from.
  pub async fn fetch_children(
    &self,
    folder_id: &str,
    scope: &str,
    depth: u32,
    use_cache: bool,
  ) -> CacheResult<Vec<FileEntry>> {
    if use_cache {
      if let Some(cached) = self.cache.get(folder_id, scope, depth) {
        return CacheResult::from_cache(cached);
      }
    }

    self.fetch_remote(folder_id, scope, depth, use_cache).await
  }

  /// Fetch from the network regardless of cache contents and overwrite the
  /// cached listing.
  pub async fn refresh_children(&self, folder_id: &str, scope: &str, depth: u32) -> Vec<FileEntry> {
    self.fetch_remote(folder_id, scope, depth, true).await.data
  }

  async fn fetch_remote(
    &self,
    folder_id: &str,
    scope: &str,
    depth: u32,
    store: bool,
  ) -> CacheResult<Vec<FileEntry>> {
    let api_key = self.keys.next_key();
    debug!(
      "Listing folder {} (scope {}, depth {}, key {})",
      folder_id,
      scope,
      depth,
      fingerprint(api_key)
    );

    let url = self.listing_url(folder_id, api_key);
    let fetched = self.limiter.submit(url).await;

    match fetched {
      Fetched::Listing(list) => {
        let files = list.into_entries();
        if store {
          self.cache.put(folder_id, scope, depth, &files);
        }
        CacheResult::from_network(files)
      }
      // Failures are not cached so the next lookup tries again
      Fetched::Fallback(reason) => CacheResult::fallback(Vec::new(), reason),
    }
  }
}

/// Folder id named in a listing URL's `q` parameter.
pub fn folder_id_from_url(url: &Url) -> Option<String> {
  let (_, query) = url.query_pairs().find(|(name, _)| name == "q")?;
  let rest = query.strip_prefix('\'')?;
  let end = rest.find('\'')?;
  Some(rest[..end].to_string())
}
