use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::CacheStore;
use crate::config::Config;
use crate::crawler::Crawler;
use crate::drive::{fingerprint, ApiKeyPool, DriveClient, MappingLoader, MappingSource, ReqwestTransport, Transport};
use crate::limiter::RateLimiter;
use crate::preloader::Preloader;
use crate::store::{KeyValueStore, MemoryStore, SqliteStore};

/// Every service of one process, wired from a [`Config`].
///
/// Interactive listing and search share the foreground limiter; the
/// preloader owns the background one. Both read and write the same cache.
/// The cache is always available; the Drive services need API keys.
pub struct Session {
  pub config: Config,
  pub cache: CacheStore,
  pub mapping: MappingLoader,
  /// Why the Drive services are missing, when they are
  drive: std::result::Result<DriveServices, String>,
}

struct DriveServices {
  crawler: Crawler,
  preloader: Preloader,
}

impl Session {
  /// Open the SQLite cache (or an in-memory one when `ephemeral`) and build
  /// the services on top of it.
  pub fn open(config: Config, ephemeral: bool) -> Result<Self> {
    let store: Arc<dyn KeyValueStore> = if ephemeral {
      debug!("Using in-memory cache");
      Arc::new(MemoryStore::new())
    } else {
      let store = match &config.cache.path {
        Some(path) => SqliteStore::open_at(path)?,
        None => SqliteStore::open()?,
      };
      Arc::new(store)
    };

    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new()?);
    Self::with_parts(config, store, transport)
  }

  /// Build the services over an existing store and transport.
  pub fn with_parts(
    config: Config,
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn Transport>,
  ) -> Result<Self> {
    let cache = CacheStore::new(store)
      .with_ttl(config.cache.ttl())
      .with_known_scopes(config.cache.scopes.clone());

    let mapping = MappingLoader::new(
      MappingSource::parse(config.preload.mapping.as_deref()),
      transport.clone(),
    );

    let drive = match ApiKeyPool::new(config.api_keys()) {
      Ok(keys) => {
        info!(
          "Loaded {} API keys (current {})",
          keys.len(),
          fingerprint(keys.current())
        );
        Ok(Self::drive_services(&config, &cache, &mapping, keys, transport)?)
      }
      Err(e) => {
        debug!("Drive services unavailable: {}", e);
        Err(e.to_string())
      }
    };

    Ok(Self {
      config,
      cache,
      mapping,
      drive,
    })
  }

  fn drive_services(
    config: &Config,
    cache: &CacheStore,
    mapping: &MappingLoader,
    keys: ApiKeyPool,
    transport: Arc<dyn Transport>,
  ) -> Result<DriveServices> {
    let foreground = RateLimiter::new(config.foreground.clone(), transport.clone());
    let background = RateLimiter::new(config.background.clone(), transport);

    let client = DriveClient::new(foreground, cache.clone(), keys, &config.drive.api_base)?;
    let preloader = Preloader::new(
      client.with_limiter(background),
      mapping.clone(),
      config.preload.clone(),
    );
    let crawler = Crawler::new(client, config.search.clone());

    Ok(DriveServices { crawler, preloader })
  }

  /// Listing, search and rebuild. Fails without API keys.
  pub fn crawler(&self) -> Result<&Crawler> {
    self
      .drive
      .as_ref()
      .map(|drive| &drive.crawler)
      .map_err(|e| eyre!("{}", e))
  }

  /// The background preloader. Fails without API keys.
  pub fn preloader(&self) -> Result<&Preloader> {
    self
      .drive
      .as_ref()
      .map(|drive| &drive.preloader)
      .map_err(|e| eyre!("{}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::{file, MockReply, MockTransport};

  fn session(transport: &Arc<MockTransport>, yaml: &str) -> Session {
    let config = Config::from_yaml(yaml).unwrap();
    Session::with_parts(config, Arc::new(MemoryStore::new()), transport.clone()).unwrap()
  }

  fn keyless_env() -> bool {
    std::env::var("DRIVECRAWL_API_KEYS").is_err()
  }

  #[tokio::test]
  async fn test_services_share_one_cache() {
    let transport = Arc::new(MockTransport::new());
    transport.reply("F1", MockReply::files(vec![file("x", "a.pdf")]));
    let session = session(
      &transport,
      "drive:\n  api_base: https://drive.test/files\n  api_keys: [k1]\n",
    );
    let crawler = session.crawler().unwrap();

    crawler.client().list_children("F1", "drive", 0, true).await;

    assert!(session.cache.get("F1", "drive", 0).is_some());
    assert_eq!(crawler.client().limiter().config().max_concurrent, 200);
    assert_eq!(session.preloader().unwrap().stats().limiter.max_concurrent, 2);
  }

  #[test]
  fn test_cache_commands_work_without_api_keys() {
    if !keyless_env() {
      return;
    }
    let transport = Arc::new(MockTransport::new());
    let session = session(&transport, "");
    session.cache.put("F1", "drive", 0, &[]);

    assert_eq!(session.cache.stats("drive").total_keys, 1);
    assert_eq!(session.cache.clean_expired("drive"), 0);
    assert!(session.cache.clear_all() >= 1);
    assert_eq!(session.cache.stats("drive").total_keys, 0);

    let err = session.crawler().err().unwrap();
    assert!(err.to_string().contains("No Drive API keys"));
    assert!(session.preloader().is_err());
    assert_eq!(transport.total_calls(), 0);
  }
}
