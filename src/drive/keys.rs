//! Round-robin pool of provider API keys.

use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::limiter::random_u64;

/// Rotating set of API keys shared by every client built from it.
#[derive(Debug, Clone)]
pub struct ApiKeyPool {
  keys: Arc<Vec<String>>,
  cursor: Arc<AtomicUsize>,
}

impl ApiKeyPool {
  pub fn new(keys: Vec<String>) -> Result<Self> {
    let keys: Vec<String> = keys
      .into_iter()
      .map(|k| k.trim().to_string())
      .filter(|k| !k.is_empty())
      .collect();

    if keys.is_empty() {
      return Err(eyre!(
        "No Drive API keys configured. Set DRIVECRAWL_API_KEYS or drive.api_keys in the config file."
      ));
    }

    Ok(Self {
      keys: Arc::new(keys),
      cursor: Arc::new(AtomicUsize::new(0)),
    })
  }

  /// Return the current key and advance the rotation.
  pub fn next_key(&self) -> &str {
    let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.keys.len();
    &self.keys[index]
  }

  /// Any key, chosen without touching the rotation.
  pub fn random(&self) -> &str {
    let index = (random_u64() % self.keys.len() as u64) as usize;
    &self.keys[index]
  }

  /// The key `next_key` would return, without advancing.
  pub fn current(&self) -> &str {
    &self.keys[self.cursor.load(Ordering::Relaxed) % self.keys.len()]
  }

  pub fn len(&self) -> usize {
    self.keys.len()
  }

  pub fn is_empty(&self) -> bool {
    self.keys.is_empty()
  }

  /// Restart the rotation from the first key.
  pub fn reset(&self) {
    self.cursor.store(0, Ordering::Relaxed);
  }
}

/// Short stable identifier for a key, safe to log.
pub fn fingerprint(key: &str) -> String {
  let digest = Sha256::digest(key.as_bytes());
  hex::encode(&digest[..4])
}
