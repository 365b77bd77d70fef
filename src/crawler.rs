//! Depth-bounded recursive crawl and term search over drive folders.

use futures::future::{join_all, BoxFuture};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::SearchSettings;
use crate::drive::{DriveClient, FileEntry, FolderConfig, SearchResult, ROOT_PATH};

/// Progress reported after each batch of crawl roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchProgress {
  pub completed_folders: usize,
  pub total_folders: usize,
  /// Requests waiting in the limiter queue
  pub queued: usize,
  /// Requests currently in flight
  pub active: usize,
  pub results: usize,
}

/// Per-root values every level of a crawl needs.
struct CrawlContext {
  scope: String,
  semester: String,
  batch: String,
  max_depth: u32,
}

/// Recursive crawler and search engine.
#[derive(Clone)]
pub struct Crawler {
  client: DriveClient,
  settings: SearchSettings,
}

impl Crawler {
  pub fn new(client: DriveClient, settings: SearchSettings) -> Self {
    Self { client, settings }
  }

  pub fn client(&self) -> &DriveClient {
    &self.client
  }

  pub fn settings(&self) -> &SearchSettings {
    &self.settings
  }

  /// Every leaf document under `root`, at most `max_depth` listings deep.
  pub async fn crawl(&self, root: &FolderConfig, max_depth: u32, scope: &str) -> Vec<SearchResult> {
    self
      .crawl_from(root, String::new(), 0, max_depth, scope)
      .await
  }

  /// Crawl starting at `depth` with `path` already walked.
  pub async fn crawl_from(
    &self,
    root: &FolderConfig,
    path: String,
    depth: u32,
    max_depth: u32,
    scope: &str,
  ) -> Vec<SearchResult> {
    let ctx = Arc::new(CrawlContext {
      scope: scope.to_string(),
      semester: root.semester.clone(),
      batch: root.batch_label.clone(),
      max_depth,
    });
    self
      .crawl_folder(ctx, root.folder_id.clone(), path, depth)
      .await
  }

  fn crawl_folder(
    &self,
    ctx: Arc<CrawlContext>,
    folder_id: String,
    path: String,
    depth: u32,
  ) -> BoxFuture<'static, Vec<SearchResult>> {
    let this = self.clone();
    Box::pin(async move {
      if depth >= ctx.max_depth {
        return Vec::new();
      }

      let children = this
        .client
        .list_children(&folder_id, &ctx.scope, depth, true)
        .await;
      let (folders, documents): (Vec<FileEntry>, Vec<FileEntry>) =
        children.into_iter().partition(FileEntry::is_folder);

      let mut results: Vec<SearchResult> = documents
        .into_iter()
        .map(|file| SearchResult {
          name: file.name,
          link: file.view_link,
          path: if path.is_empty() {
            ROOT_PATH.to_string()
          } else {
            path.clone()
          },
          semester: ctx.semester.clone(),
          batch: ctx.batch.clone(),
          mime_type: file.mime_type,
          folder_id: folder_id.clone(),
        })
        .collect();

      let subtrees = folders.into_iter().map(|folder| {
        let child_path = if path.is_empty() {
          folder.name
        } else {
          format!("{}/{}", path, folder.name)
        };
        this.crawl_folder(ctx.clone(), folder.id, child_path, depth + 1)
      });

      for subtree in join_all(subtrees).await {
        results.extend(subtree);
      }

      results
    })
  }

  /// Crawl `roots` and return the documents whose name contains `term`
  /// (case-insensitive), deduplicated.
  ///
  /// Roots are crawled `batch_size` at a time. Once more than `result_limit`
  /// matches are collected no further batch is started.
  pub async fn search(
    &self,
    roots: &[FolderConfig],
    term: &str,
    max_depth: u32,
    scope: &str,
    progress: Option<&mpsc::UnboundedSender<SearchProgress>>,
  ) -> Vec<SearchResult> {
    let needle = term.to_lowercase();
    let total_folders = roots.len();
    let mut completed_folders = 0;
    let mut found: Vec<SearchResult> = Vec::new();

    info!(
      "Searching {} folders for {:?} (depth {}, scope {})",
      total_folders, term, max_depth, scope
    );

    for batch in roots.chunks(self.settings.batch_size.max(1)) {
      let crawls = batch.iter().map(|root| {
        let needle = &needle;
        async move {
          let mut hits = self.crawl(root, max_depth, scope).await;
          hits.retain(|result| result.name.to_lowercase().contains(needle.as_str()));
          hits
        }
      });

      for hits in join_all(crawls).await {
        found.extend(hits);
      }
      completed_folders += batch.len();

      let limiter = self.client.limiter().stats();
      let update = SearchProgress {
        completed_folders,
        total_folders,
        queued: limiter.queued,
        active: limiter.active,
        results: found.len(),
      };
      debug!("Search progress: {:?}", update);
      if let Some(tx) = progress {
        // Nobody listening is fine
        let _ = tx.send(update);
      }

      if found.len() > self.settings.result_limit {
        info!(
          "Early termination: found {} results (limit {})",
          found.len(),
          self.settings.result_limit
        );
        break;
      }
    }

    dedupe(found)
  }

  /// Re-fetch `folder_id` and everything below it to `max_depth`, ignoring
  /// cached listings and overwriting them. Subfolders are walked one at a
  /// time. Returns the number of folders refreshed.
  pub async fn rebuild(&self, folder_id: &str, scope: &str, max_depth: u32) -> usize {
    let refreshed = self
      .rebuild_folder(Arc::from(scope), folder_id.to_string(), 0, max_depth)
      .await;
    info!("Rebuilt {} folder listings under {}", refreshed, folder_id);
    refreshed
  }

  fn rebuild_folder(
    &self,
    scope: Arc<str>,
    folder_id: String,
    depth: u32,
    max_depth: u32,
  ) -> BoxFuture<'static, usize> {
    let this = self.clone();
    Box::pin(async move {
      if depth >= max_depth {
        return 0;
      }

      let children = this.client.refresh_children(&folder_id, &scope, depth).await;
      let mut refreshed = 1;
      for folder in children.into_iter().filter(FileEntry::is_folder) {
        refreshed += this
          .rebuild_folder(scope.clone(), folder.id, depth + 1, max_depth)
          .await;
      }
      refreshed
    })
  }
}

/// Keep the first result for each `(semester, batch, path)`.
pub fn dedupe(results: Vec<SearchResult>) -> Vec<SearchResult> {
  let mut seen: HashSet<(String, String, String)> = HashSet::with_capacity(results.len());
  results
    .into_iter()
    .filter(|result| {
      let (semester, batch, path) = result.dedup_key();
      seen.insert((semester.to_string(), batch.to_string(), path.to_string()))
    })
    .collect()
}
