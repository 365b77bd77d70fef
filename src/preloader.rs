//! Background cache preloader.
//!
//! Walks every folder of the mapping document to a fixed depth through its
//! own slow rate limiter, one root at a time, so that later searches hit the
//! cache. Completed roots are recorded in a persisted progress record; a
//! resumed run skips them.

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::progress_key;
use crate::config::PreloadSettings;
use crate::drive::{DriveClient, FileEntry, MappingLoader};
use crate::limiter::LimiterStats;
use crate::store::KeyValueStore;

/// Cancellation token for stopping a preload run
#[derive(Debug, Clone)]
pub struct CancellationToken {
  cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
  pub fn new() -> Self {
    Self {
      cancelled: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }
}

impl Default for CancellationToken {
  fn default() -> Self {
    Self::new()
  }
}

/// Persisted record of which roots have been preloaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadProgress {
  #[serde(default)]
  pub completed: Vec<String>,
  #[serde(default)]
  pub total: usize,
  #[serde(rename = "lastUpdated", default)]
  pub last_updated: i64,
}

impl PreloadProgress {
  /// No update within `ttl`; the listings it vouches for have expired.
  pub fn is_stale(&self, ttl: ChronoDuration, now_ms: i64) -> bool {
    now_ms - self.last_updated > ttl.num_milliseconds()
  }

  pub fn never_run(&self) -> bool {
    self.total == 0
  }
}

/// Page the preloader is scheduled from; decides the start delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
  Landing,
  Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreloadOutcome {
  /// Another run was in progress; nothing was done
  AlreadyRunning,
  /// `stop` was called before the run began
  Cancelled,
  /// The mapping document was missing or empty
  NoMapping,
  /// Every remaining root was preloaded
  Completed { preloaded: usize, skipped: usize },
  /// `stop` was called before all roots were done
  Stopped { preloaded: usize, remaining: usize },
}

impl fmt::Display for PreloadOutcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::AlreadyRunning => write!(f, "preload already running"),
      Self::Cancelled => write!(f, "preload cancelled before it started"),
      Self::NoMapping => write!(f, "no drive mapping available"),
      Self::Completed { preloaded, skipped } => write!(
        f,
        "preloaded {} folders ({} already done)",
        preloaded, skipped
      ),
      Self::Stopped {
        preloaded,
        remaining,
      } => write!(
        f,
        "stopped after {} folders ({} remaining)",
        preloaded, remaining
      ),
    }
  }
}

#[derive(Debug, Clone)]
pub struct PreloadStats {
  pub is_preloading: bool,
  pub progress: PreloadProgress,
  pub limiter: LimiterStats,
}

/// Idle/Preloading state plus the stop signal for whatever is running or
/// scheduled.
///
/// A cancelled token stays cancelled until nothing it was aimed at is left:
/// no run in progress and no scheduled start still waiting.
#[derive(Debug, Default)]
struct RunState {
  running: bool,
  /// Scheduled starts still in their delay
  pending: usize,
  token: CancellationToken,
}

impl RunState {
  fn settle(&mut self) {
    if self.token.is_cancelled() && !self.running && self.pending == 0 {
      self.token = CancellationToken::new();
    }
  }
}

enum Begin {
  Run(CancellationToken),
  Skip(Option<PreloadOutcome>),
}

struct Inner {
  client: DriveClient,
  store: Arc<dyn KeyValueStore>,
  mapping: MappingLoader,
  settings: PreloadSettings,
  state: Mutex<RunState>,
}

/// Single-flight background preloader. Clones share state.
#[derive(Clone)]
pub struct Preloader {
  inner: Arc<Inner>,
}

/// Returns the preloader to Idle when a run ends, however it ends.
struct RunGuard<'a>(&'a Preloader);

impl Drop for RunGuard<'_> {
  fn drop(&mut self) {
    let mut state = self.0.state();
    state.running = false;
    state.settle();
  }
}

impl Preloader {
  /// `client` should carry the background rate limiter; its cache store's
  /// backing store also holds the progress record.
  pub fn new(client: DriveClient, mapping: MappingLoader, settings: PreloadSettings) -> Self {
    let store = client.cache().backing_store().clone();
    Self {
      inner: Arc::new(Inner {
        client,
        store,
        mapping,
        settings,
        state: Mutex::new(RunState::default()),
      }),
    }
  }

  pub fn is_preloading(&self) -> bool {
    self.state().running
  }

  /// Run a preload pass to completion, unless one is already running.
  pub async fn start(&self) -> PreloadOutcome {
    match self.begin(false, false) {
      Begin::Run(token) => self.run_guarded(token).await,
      Begin::Skip(outcome) => outcome.unwrap_or(PreloadOutcome::AlreadyRunning),
    }
  }

  /// Stop a running pass at the next folder boundary, and cancel any
  /// scheduled start still waiting out its delay. Without either this does
  /// nothing.
  pub fn stop(&self) {
    let state = self.state();
    if state.running || state.pending > 0 {
      info!("Background preloader stopping");
      state.token.cancel();
    } else {
      debug!("Preloader idle, nothing to stop");
    }
  }

  pub fn stats(&self) -> PreloadStats {
    PreloadStats {
      is_preloading: self.is_preloading(),
      progress: self.load_progress(),
      limiter: self.inner.client.limiter().stats(),
    }
  }

  /// Whether the persisted progress calls for a new pass.
  pub fn needs_preload(&self) -> bool {
    let progress = self.load_progress();
    progress.never_run() || progress.is_stale(self.ttl(), Utc::now().timestamp_millis())
  }

  /// Start a pass if none is running and progress is stale or missing.
  pub async fn start_if_stale(&self) -> Option<PreloadOutcome> {
    match self.begin(false, true) {
      Begin::Run(token) => Some(self.run_guarded(token).await),
      Begin::Skip(outcome) => outcome,
    }
  }

  /// Delay before a scheduled start from `page`.
  pub fn delay_for(&self, page: PageKind) -> Duration {
    let secs = match page {
      PageKind::Landing => self.inner.settings.landing_delay_secs,
      PageKind::Other => self.inner.settings.page_delay_secs,
    };
    Duration::from_secs(secs)
  }

  /// After the page-dependent delay, start a pass if one is due. A `stop`
  /// during the delay cancels the start.
  pub fn schedule(&self, page: PageKind) -> JoinHandle<Option<PreloadOutcome>> {
    let delay = self.delay_for(page);
    info!("Background cache preloader will start in {:?}", delay);
    self.state().pending += 1;

    let this = self.clone();
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      match this.begin(true, true) {
        Begin::Run(token) => Some(this.run_guarded(token).await),
        Begin::Skip(outcome) => outcome,
      }
    })
  }

  /// The Idle to Preloading transition. `scheduled` retires one pending
  /// start; `only_if_stale` skips quietly when progress is fresh or a run
  /// is already going.
  fn begin(&self, scheduled: bool, only_if_stale: bool) -> Begin {
    let mut state = self.state();
    if scheduled {
      state.pending = state.pending.saturating_sub(1);
    }

    if state.token.is_cancelled() && !state.running {
      info!("Preload cancelled before start");
      state.settle();
      return Begin::Skip(Some(PreloadOutcome::Cancelled));
    }
    if state.running {
      debug!("Preload already running");
      return Begin::Skip((!only_if_stale).then_some(PreloadOutcome::AlreadyRunning));
    }
    if only_if_stale && !self.needs_preload() {
      debug!("Preload not needed");
      return Begin::Skip(None);
    }

    state.running = true;
    Begin::Run(state.token.clone())
  }

  async fn run_guarded(&self, token: CancellationToken) -> PreloadOutcome {
    let _guard = RunGuard(self);
    info!("Starting background cache preloader");
    self.run(&token).await
  }

  fn state(&self) -> std::sync::MutexGuard<'_, RunState> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn ttl(&self) -> ChronoDuration {
    self.inner.client.cache().ttl()
  }

  async fn run(&self, token: &CancellationToken) -> PreloadOutcome {
    let mapping = self.inner.mapping.load().await;
    if mapping.is_empty() {
      warn!("No drive mapping loaded, preloader cannot continue");
      return PreloadOutcome::NoMapping;
    }

    let folders = mapping.flatten(None);
    let mut progress = self.load_progress();
    if progress.is_stale(self.ttl(), Utc::now().timestamp_millis()) {
      // Listings recorded by an expired pass are gone from the cache too
      progress.completed.clear();
    }
    progress.total = folders.len();

    let remaining: Vec<_> = folders
      .into_iter()
      .filter(|folder| !progress.completed.contains(&folder.folder_id))
      .collect();
    let skipped = progress.total - remaining.len();
    info!(
      "Background preloader: {}/{} folders remaining",
      remaining.len(),
      progress.total
    );

    let mut preloaded = 0;
    for folder in &remaining {
      if token.is_cancelled() {
        break;
      }

      let listed = self
        .preload_folder(folder.folder_id.clone(), 0, token.clone())
        .await;

      // A folder cut short is not complete
      if token.is_cancelled() {
        break;
      }

      debug!("Preloaded {} ({} listings)", folder.label, listed);
      if !progress.completed.contains(&folder.folder_id) {
        progress.completed.push(folder.folder_id.clone());
      }
      progress.last_updated = Utc::now().timestamp_millis();
      self.save_progress(&progress);
      preloaded += 1;
    }

    if preloaded < remaining.len() {
      info!("Background preloader stopped");
      return PreloadOutcome::Stopped {
        preloaded,
        remaining: remaining.len() - preloaded,
      };
    }

    info!("Background cache preloading completed");
    PreloadOutcome::Completed { preloaded, skipped }
  }

  /// List `folder_id` and, one at a time, every subfolder down to the
  /// configured depth. Returns the number of folders listed.
  fn preload_folder(
    &self,
    folder_id: String,
    depth: u32,
    token: CancellationToken,
  ) -> BoxFuture<'static, usize> {
    let this = self.clone();
    Box::pin(async move {
      if depth >= this.inner.settings.max_depth || token.is_cancelled() {
        return 0;
      }

      let children = this
        .inner
        .client
        .list_children(&folder_id, &this.inner.settings.scope, depth, true)
        .await;

      let mut listed = 1;
      for child in children.into_iter().filter(FileEntry::is_folder) {
        listed += this
          .preload_folder(child.id, depth + 1, token.clone())
          .await;
      }
      listed
    })
  }

  fn load_progress(&self) -> PreloadProgress {
    let key = progress_key(&self.inner.settings.scope);
    match self.inner.store.get(&key) {
      Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!("Discarding unreadable preload progress: {}", e);
        PreloadProgress::default()
      }),
      Ok(None) => PreloadProgress::default(),
      Err(e) => {
        warn!("Failed to read preload progress: {}", e);
        PreloadProgress::default()
      }
    }
  }

  fn save_progress(&self, progress: &PreloadProgress) {
    let key = progress_key(&self.inner.settings.scope);
    let result = serde_json::to_string(progress)
      .map_err(|e| color_eyre::eyre::eyre!("Failed to serialize preload progress: {}", e))
      .and_then(|value| self.inner.store.set(&key, &value));

    if let Err(e) = result {
      warn!("Failed to save preload progress: {}", e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::drive::MappingSource;
  use crate::test_support::{file, folder, test_client, MockReply, MockTransport};

  const MAPPING: &str = r#"{
    "1ST": {"24": {"folderId": "A", "label": "24th Batch"}},
    "2ND": {"24": {"folderId": "B", "label": "24th Batch"},
            "25": {"folderId": "C", "label": "25th Batch"}}
  }"#;

  fn settings() -> PreloadSettings {
    PreloadSettings {
      mapping: Some("https://site.test/assets/drive-mapping.json".into()),
      ..PreloadSettings::default()
    }
  }

  fn preloader(transport: &Arc<MockTransport>) -> Preloader {
    transport.reply_url("/assets/drive-mapping.json", MockReply::Body(MAPPING.into()));
    let (client, _) = test_client(transport.clone());
    let settings = settings();
    let loader = MappingLoader::new(
      MappingSource::parse(settings.mapping.as_deref()),
      transport.clone(),
    );
    Preloader::new(client, loader, settings)
  }

  #[tokio::test]
  async fn test_preloads_every_root_to_depth_four() {
    let transport = Arc::new(MockTransport::new());
    transport.reply("A", MockReply::files(vec![folder("A1", "x"), file("a", "a.pdf")]));
    transport.reply("A1", MockReply::files(vec![folder("A2", "y")]));
    transport.reply("A2", MockReply::files(vec![folder("A3", "z")]));
    transport.reply("A3", MockReply::files(vec![folder("A4", "too deep")]));
    let preloader = preloader(&transport);

    let outcome = preloader.start().await;

    assert_eq!(
      outcome,
      PreloadOutcome::Completed {
        preloaded: 3,
        skipped: 0
      }
    );
    for id in ["A", "A1", "A2", "A3", "B", "C"] {
      assert_eq!(transport.calls_for(id), 1, "folder {}", id);
    }
    assert_eq!(transport.calls_for("A4"), 0);

    let cache = preloader.inner.client.cache();
    assert!(cache.get("A3", "preload", 3).is_some());
    assert!(cache.get("A", "drive", 0).is_none());

    let progress = preloader.stats().progress;
    assert_eq!(progress.completed, vec!["A", "B", "C"]);
    assert_eq!(progress.total, 3);
    assert!(progress.last_updated > 0);
    assert!(!preloader.is_preloading());
  }

  #[tokio::test]
  async fn test_resume_skips_completed_roots() {
    let transport = Arc::new(MockTransport::new());
    let preloader = preloader(&transport);
    preloader.save_progress(&PreloadProgress {
      completed: vec!["A".into(), "B".into()],
      total: 3,
      last_updated: Utc::now().timestamp_millis(),
    });

    let outcome = preloader.start().await;

    assert_eq!(
      outcome,
      PreloadOutcome::Completed {
        preloaded: 1,
        skipped: 2
      }
    );
    assert_eq!(transport.calls_for("A"), 0);
    assert_eq!(transport.calls_for("C"), 1);
  }

  #[tokio::test]
  async fn test_stale_progress_starts_over() {
    let transport = Arc::new(MockTransport::new());
    let preloader = preloader(&transport);
    preloader.save_progress(&PreloadProgress {
      completed: vec!["A".into(), "B".into(), "C".into()],
      total: 3,
      last_updated: Utc::now().timestamp_millis() - 25 * 60 * 60 * 1000,
    });
    assert!(preloader.needs_preload());

    let outcome = preloader.start_if_stale().await;

    assert_eq!(
      outcome,
      Some(PreloadOutcome::Completed {
        preloaded: 3,
        skipped: 0
      })
    );
    assert!(!preloader.needs_preload());
    assert_eq!(preloader.start_if_stale().await, None);
  }

  #[tokio::test]
  async fn test_missing_mapping_aborts() {
    let transport = Arc::new(MockTransport::new());
    let (client, _) = test_client(transport.clone());
    let loader = MappingLoader::new(MappingSource::None, transport.clone());
    let preloader = Preloader::new(client, loader, PreloadSettings::default());

    assert_eq!(preloader.start().await, PreloadOutcome::NoMapping);
    assert!(!preloader.is_preloading());
    assert_eq!(transport.total_calls(), 0);
    assert!(preloader.needs_preload());
  }

  #[tokio::test(start_paused = true)]
  async fn test_second_start_is_noop_while_running() {
    let transport = Arc::new(MockTransport::new().with_latency(Duration::from_millis(30)));
    let preloader = preloader(&transport);

    let running = tokio::spawn({
      let preloader = preloader.clone();
      async move { preloader.start().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(preloader.is_preloading());
    assert_eq!(preloader.start().await, PreloadOutcome::AlreadyRunning);
    assert_eq!(preloader.start_if_stale().await, None);

    assert!(matches!(
      running.await.unwrap(),
      PreloadOutcome::Completed { .. }
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_at_folder_boundary() {
    let transport = Arc::new(MockTransport::new().with_latency(Duration::from_millis(40)));
    let preloader = preloader(&transport);

    let running = tokio::spawn({
      let preloader = preloader.clone();
      async move { preloader.start().await }
    });
    // Mapping fetch plus part of the first root
    tokio::time::sleep(Duration::from_millis(60)).await;
    preloader.stop();

    let outcome = running.await.unwrap();
    assert!(matches!(outcome, PreloadOutcome::Stopped { .. }));
    assert!(!preloader.is_preloading());
    assert_eq!(transport.calls_for("C"), 0);

    // Resumed later, the run picks up what is left
    let resumed = preloader.start().await;
    assert!(matches!(resumed, PreloadOutcome::Completed { .. }));
    assert_eq!(preloader.stats().progress.completed.len(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_during_scheduled_delay_cancels_start() {
    let transport = Arc::new(MockTransport::new());
    let preloader = preloader(&transport);

    let scheduled = preloader.schedule(PageKind::Landing);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!preloader.is_preloading());
    preloader.stop();

    assert_eq!(scheduled.await.unwrap(), Some(PreloadOutcome::Cancelled));
    assert_eq!(transport.total_calls(), 0);
    assert!(preloader.needs_preload());

    // The stop was spent on that start; the next one runs
    assert!(matches!(
      preloader.start().await,
      PreloadOutcome::Completed { preloaded: 3, .. }
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_right_after_start_is_honoured() {
    let transport = Arc::new(MockTransport::new().with_latency(Duration::from_millis(40)));
    let preloader = preloader(&transport);

    let running = tokio::spawn({
      let preloader = preloader.clone();
      async move { preloader.start().await }
    });
    // Let the run claim the Preloading state, then stop before any listing
    tokio::task::yield_now().await;
    assert!(preloader.is_preloading());
    preloader.stop();

    assert_eq!(
      running.await.unwrap(),
      PreloadOutcome::Stopped {
        preloaded: 0,
        remaining: 3
      }
    );
    assert_eq!(transport.calls_for("A"), 0);
  }

  #[tokio::test]
  async fn test_stop_while_idle_does_not_block_next_start() {
    let transport = Arc::new(MockTransport::new());
    let preloader = preloader(&transport);

    preloader.stop();

    assert!(matches!(
      preloader.start().await,
      PreloadOutcome::Completed { .. }
    ));
  }

  #[tokio::test]
  async fn test_schedule_waits_for_delay() {
    let transport = Arc::new(MockTransport::new());
    transport.reply_url("/assets/drive-mapping.json", MockReply::Body(MAPPING.into()));
    let (client, _) = test_client(transport.clone());
    let loader = MappingLoader::new(MappingSource::parse(settings().mapping.as_deref()), transport.clone());
    let preloader = Preloader::new(
      client,
      loader,
      PreloadSettings {
        landing_delay_secs: 0,
        page_delay_secs: 60,
        ..settings()
      },
    );

    assert_eq!(preloader.delay_for(PageKind::Other), Duration::from_secs(60));
    let outcome = preloader.schedule(PageKind::Landing).await.unwrap();
    assert!(matches!(outcome, Some(PreloadOutcome::Completed { .. })));
  }

  #[test]
  fn test_progress_wire_format() {
    let progress: PreloadProgress =
      serde_json::from_str(r#"{"completed":["A"],"total":3,"lastUpdated":5}"#).unwrap();
    assert_eq!(progress.completed, vec!["A"]);
    assert_eq!(progress.last_updated, 5);
    assert!(PreloadProgress::default().never_run());
  }

  #[test]
  fn test_cancellation_token_shared_between_clones() {
    let token = CancellationToken::new();
    let clone = token.clone();
    assert!(!token.is_cancelled());
    clone.cancel();
    assert!(token.is_cancelled());
  }
}
