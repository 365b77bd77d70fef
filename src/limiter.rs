//! Bounded-concurrency request queue for provider listing calls.
//!
//! Requests start in submission order, at most `max_concurrent` at a time,
//! spaced by `inter_start_delay`. Every submission resolves: failures become
//! a [`Fetched::Fallback`] so that one bad folder never aborts a crawl.

use reqwest::StatusCode;
use std::collections::hash_map::RandomState;
use std::collections::VecDeque;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;

use crate::config::LimiterConfig;
use crate::drive::{folder_id_from_url, ApiFileList, Transport};

/// Why a request resolved without a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
  /// 500 or 403 from the provider
  Provider(StatusCode),
  /// Still throttled after the configured number of retries
  Throttled,
  /// Any other non-success status
  Status(StatusCode),
  /// The attempt exceeded its deadline
  Timeout,
  /// Connection or body read failure
  Transport(String),
  /// The body was not a listing
  Parse(String),
  /// The request was discarded before it ran
  Dropped,
}

/// Outcome of a submitted request.
#[derive(Debug, Clone)]
pub enum Fetched {
  Listing(ApiFileList),
  Fallback(FallbackReason),
}

impl Fetched {
  pub fn is_listing(&self) -> bool {
    matches!(self, Fetched::Listing(_))
  }

  /// The listing, or the empty listing for a fallback.
  pub fn into_listing(self) -> ApiFileList {
    match self {
      Fetched::Listing(list) => list,
      Fetched::Fallback(_) => ApiFileList::default(),
    }
  }
}

/// Snapshot of limiter load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterStats {
  pub active: usize,
  pub queued: usize,
  pub max_concurrent: usize,
}

struct Pending {
  url: Url,
  reply: oneshot::Sender<Fetched>,
}

struct Inner {
  config: LimiterConfig,
  transport: Arc<dyn Transport>,
  queue: Mutex<VecDeque<Pending>>,
  active: AtomicUsize,
  draining: AtomicBool,
}

/// FIFO request queue with a concurrency cap. Clones share the same queue.
#[derive(Clone)]
pub struct RateLimiter {
  inner: Arc<Inner>,
}

impl RateLimiter {
  pub fn new(config: LimiterConfig, transport: Arc<dyn Transport>) -> Self {
    Self {
      inner: Arc::new(Inner {
        config,
        transport,
        queue: Mutex::new(VecDeque::new()),
        active: AtomicUsize::new(0),
        draining: AtomicBool::new(false),
      }),
    }
  }

  pub fn config(&self) -> &LimiterConfig {
    &self.inner.config
  }

  /// Queue a GET for `url` and wait for its outcome. Never fails.
  pub async fn submit(&self, url: Url) -> Fetched {
    let (reply, rx) = oneshot::channel();
    self.queue().push_back(Pending { url, reply });
    self.process_queue();

    rx.await
      .unwrap_or(Fetched::Fallback(FallbackReason::Dropped))
  }

  pub fn stats(&self) -> LimiterStats {
    LimiterStats {
      active: self.inner.active.load(Ordering::SeqCst),
      queued: self.queue().len(),
      max_concurrent: self.inner.config.max_concurrent,
    }
  }

  /// Drop every queued request; their callers resolve with
  /// [`FallbackReason::Dropped`]. In-flight requests are unaffected.
  pub fn reset(&self) -> usize {
    let dropped: Vec<Pending> = self.queue().drain(..).collect();
    if !dropped.is_empty() {
      debug!("Dropped {} queued requests", dropped.len());
    }
    dropped.len()
  }

  fn queue(&self) -> MutexGuard<'_, VecDeque<Pending>> {
    self
      .inner
      .queue
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn has_capacity(&self) -> bool {
    self.inner.active.load(Ordering::SeqCst) < self.inner.config.max_concurrent
  }

  /// Start a drain unless one is already running.
  fn process_queue(&self) {
    if self.inner.draining.swap(true, Ordering::SeqCst) {
      return;
    }
    let this = self.clone();
    tokio::spawn(async move { this.drain().await });
  }

  async fn drain(&self) {
    loop {
      while self.has_capacity() {
        let Some(pending) = self.queue().pop_front() else {
          break;
        };
        // Only the drainer increments, so the cap cannot be overshot
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let this = self.clone();
        tokio::spawn(async move { this.execute(pending).await });

        if !self.queue().is_empty() {
          tokio::time::sleep(self.inner.config.inter_start_delay).await;
        }
      }

      self.inner.draining.store(false, Ordering::SeqCst);

      // A submit or completion may have raced with the flag reset
      let more = !self.queue().is_empty() && self.has_capacity();
      if !more || self.inner.draining.swap(true, Ordering::SeqCst) {
        return;
      }
    }
  }

  async fn execute(&self, pending: Pending) {
    let outcome = self.fetch(&pending.url).await;

    self.inner.active.fetch_sub(1, Ordering::SeqCst);
    // The caller may have gone away
    let _ = pending.reply.send(outcome);

    let this = self.clone();
    tokio::spawn(async move {
      tokio::time::sleep(this.inner.config.inter_start_delay).await;
      this.process_queue();
    });
  }

  async fn fetch(&self, url: &Url) -> Fetched {
    let config = &self.inner.config;
    let folder = folder_id_from_url(url).unwrap_or_else(|| "unknown".to_string());
    let mut throttled = 0;

    loop {
      let attempt = tokio::time::timeout(config.request_timeout, self.inner.transport.get(url.clone()));

      let response = match attempt.await {
        Err(_) => {
          warn!("Request for folder {} timed out after {:?}", folder, config.request_timeout);
          return Fetched::Fallback(FallbackReason::Timeout);
        }
        Ok(Err(e)) => {
          warn!("Request error for folder {}: {}", folder, e);
          return Fetched::Fallback(FallbackReason::Transport(e.to_string()));
        }
        Ok(Ok(response)) => response,
      };

      match response.status {
        status if status.is_success() => {
          return match serde_json::from_slice::<ApiFileList>(&response.body) {
            Ok(list) => Fetched::Listing(list),
            Err(e) => {
              warn!("Unreadable listing for folder {}: {}", folder, e);
              Fetched::Fallback(FallbackReason::Parse(e.to_string()))
            }
          };
        }
        status @ (StatusCode::INTERNAL_SERVER_ERROR | StatusCode::FORBIDDEN) => {
          debug!("Provider returned {} for folder {}", status, folder);
          return Fetched::Fallback(FallbackReason::Provider(status));
        }
        StatusCode::TOO_MANY_REQUESTS => {
          throttled += 1;
          if throttled > config.max_throttle_retries {
            warn!(
              "Giving up on folder {} after {} throttled attempts",
              folder, throttled
            );
            return Fetched::Fallback(FallbackReason::Throttled);
          }
          let wait = self.backoff();
          debug!("Throttled on folder {}, retrying in {:?}", folder, wait);
          tokio::time::sleep(wait).await;
        }
        status => {
          warn!("API error {} for folder {}", status, folder);
          return Fetched::Fallback(FallbackReason::Status(status));
        }
      }
    }
  }

  /// Random wait in `[backoff_min, backoff_max)`.
  fn backoff(&self) -> Duration {
    let config = &self.inner.config;
    let span = config.backoff_max.saturating_sub(config.backoff_min).as_millis() as u64;
    if span == 0 {
      return config.backoff_min;
    }
    config.backoff_min + Duration::from_millis(random_u64() % span)
  }
}

/// Cheap non-cryptographic randomness for jitter and key selection.
pub(crate) fn random_u64() -> u64 {
  let mut hasher = RandomState::new().build_hasher();
  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_nanos())
    .unwrap_or_default();
  hasher.write_u128(nanos);
  hasher.finish()
}
