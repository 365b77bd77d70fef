//! Scripted transport and stores shared by the unit tests.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::cache::CacheStore;
use crate::config::LimiterConfig;
use crate::drive::{folder_id_from_url, ApiKeyPool, DriveClient, HttpResponse, Transport, FOLDER_MIME_TYPE};
use crate::limiter::RateLimiter;
use crate::store::{KeyValueStore, MemoryStore};

#[derive(Debug, Clone)]
pub enum MockReply {
  /// 200 with a JSON body
  Body(String),
  Status(u16),
  /// Transport-level failure
  Error,
}

impl MockReply {
  pub fn files(files: Vec<Value>) -> Self {
    Self::Body(json!({ "files": files }).to_string())
  }
}

pub fn file(id: &str, name: &str) -> Value {
  json!({
    "id": id,
    "name": name,
    "mimeType": "application/pdf",
    "webViewLink": format!("https://drive.test/{}", id),
  })
}

pub fn folder(id: &str, name: &str) -> Value {
  json!({
    "id": id,
    "name": name,
    "mimeType": FOLDER_MIME_TYPE,
    "webViewLink": format!("https://drive.test/{}", id),
  })
}

#[derive(Default)]
struct Script {
  replies: HashMap<String, VecDeque<MockReply>>,
  calls: Vec<String>,
  keys: Vec<String>,
}

/// Replies are scripted per folder id (or URL path when the request has no
/// folder query). Each scripted reply is used once, except the last, which
/// repeats. Unscripted requests get an empty listing.
#[derive(Default)]
pub struct MockTransport {
  script: Arc<Mutex<Script>>,
  latency: Duration,
  in_flight: Arc<AtomicUsize>,
  peak: Arc<AtomicUsize>,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  pub fn reply(&self, folder_id: &str, reply: MockReply) {
    self
      .script
      .lock()
      .unwrap()
      .replies
      .entry(folder_id.to_string())
      .or_default()
      .push_back(reply);
  }

  pub fn reply_url(&self, path: &str, reply: MockReply) {
    self.reply(path, reply);
  }

  pub fn calls_for(&self, key: &str) -> usize {
    let script = self.script.lock().unwrap();
    script.calls.iter().filter(|c| c.as_str() == key).count()
  }

  pub fn total_calls(&self) -> usize {
    self.script.lock().unwrap().calls.len()
  }

  pub fn call_order(&self) -> Vec<String> {
    self.script.lock().unwrap().calls.clone()
  }

  pub fn keys_used(&self) -> Vec<String> {
    self.script.lock().unwrap().keys.clone()
  }

  pub fn peak_in_flight(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }

  fn next_reply(&self, url: &Url) -> MockReply {
    let key = folder_id_from_url(url).unwrap_or_else(|| url.path().to_string());
    let mut script = self.script.lock().unwrap();
    script.calls.push(key.clone());
    if let Some((_, api_key)) = url.query_pairs().find(|(name, _)| name == "key") {
      script.keys.push(api_key.into_owned());
    }

    match script.replies.get_mut(&key) {
      Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
      Some(queue) if !queue.is_empty() => queue[0].clone(),
      _ => MockReply::files(Vec::new()),
    }
  }
}

impl Transport for MockTransport {
  fn get(&self, url: Url) -> BoxFuture<'static, Result<HttpResponse>> {
    let reply = self.next_reply(&url);
    let latency = self.latency;
    let in_flight = self.in_flight.clone();
    let peak = self.peak.clone();

    Box::pin(async move {
      let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      peak.fetch_max(now, Ordering::SeqCst);
      let _guard = InFlight(in_flight);

      if !latency.is_zero() {
        tokio::time::sleep(latency).await;
      }

      match reply {
        MockReply::Body(body) => Ok(HttpResponse {
          status: StatusCode::OK,
          body: body.into_bytes(),
        }),
        MockReply::Status(code) => Ok(HttpResponse {
          status: StatusCode::from_u16(code).unwrap(),
          body: Vec::new(),
        }),
        MockReply::Error => Err(eyre!("connection reset")),
      }
    })
  }
}

/// Limiter settings that keep tests fast.
pub fn fast_limiter_config() -> LimiterConfig {
  LimiterConfig {
    max_concurrent: 50,
    inter_start_delay: Duration::from_millis(1),
    backoff_min: Duration::from_millis(1),
    backoff_max: Duration::from_millis(3),
    max_throttle_retries: 8,
    request_timeout: Duration::from_secs(5),
  }
}

/// Client over an in-memory cache with keys `k1` and `k2`.
pub fn test_client(transport: Arc<MockTransport>) -> (DriveClient, Arc<MemoryStore>) {
  let store = Arc::new(MemoryStore::new());
  let limiter = RateLimiter::new(fast_limiter_config(), transport);
  let keys = ApiKeyPool::new(vec!["k1".into(), "k2".into()]).unwrap();
  let client = DriveClient::new(
    limiter,
    CacheStore::new(store.clone()),
    keys,
    "https://drive.test/files",
  )
  .unwrap();
  (client, store)
}

/// Store whose every operation fails.
pub struct FailingStore;

impl KeyValueStore for FailingStore {
  fn get(&self, _key: &str) -> Result<Option<String>> {
    Err(eyre!("storage unavailable"))
  }

  fn set(&self, _key: &str, _value: &str) -> Result<()> {
    Err(eyre!("storage unavailable"))
  }

  fn remove(&self, _key: &str) -> Result<()> {
    Err(eyre!("storage unavailable"))
  }

  fn keys(&self) -> Result<Vec<String>> {
    Err(eyre!("storage unavailable"))
  }
}
