//! The folder-mapping document: `scope -> batch -> {folderId, label}`.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use super::transport::Transport;
use super::types::FolderConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFolder {
  #[serde(rename = "folderId")]
  pub folder_id: String,
  #[serde(default)]
  pub label: String,
}

/// Known drive roots grouped by scope (semester) and batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriveMapping(pub BTreeMap<String, BTreeMap<String, BatchFolder>>);

/// One flattened mapping entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingFolder {
  pub folder_id: String,
  pub label: String,
  pub semester: String,
  pub batch_key: String,
}

impl DriveMapping {
  pub fn from_json(bytes: &[u8]) -> Result<Self> {
    serde_json::from_slice(bytes).map_err(|e| eyre!("Failed to parse drive mapping: {}", e))
  }

  pub fn is_empty(&self) -> bool {
    self.0.values().all(BTreeMap::is_empty)
  }

  /// Every folder in the mapping, optionally restricted to one semester.
  pub fn flatten(&self, semester: Option<&str>) -> Vec<MappingFolder> {
    self
      .0
      .iter()
      .filter(|(name, _)| semester.map_or(true, |s| s.eq_ignore_ascii_case(name)))
      .flat_map(|(name, batches)| {
        batches.iter().map(move |(batch_key, info)| MappingFolder {
          folder_id: info.folder_id.clone(),
          label: info.label.clone(),
          semester: name.clone(),
          batch_key: batch_key.clone(),
        })
      })
      .filter(|folder| !folder.folder_id.is_empty())
      .collect()
  }

  /// Crawl roots for a search.
  pub fn folder_configs(&self, semester: Option<&str>) -> Vec<FolderConfig> {
    self
      .flatten(semester)
      .into_iter()
      .map(|folder| FolderConfig {
        batch_label: if folder.label.is_empty() {
          folder.batch_key
        } else {
          folder.label
        },
        folder_id: folder.folder_id,
        semester: folder.semester,
      })
      .collect()
  }
}

/// Where the mapping document lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingSource {
  None,
  File(PathBuf),
  Url(Url),
}

impl MappingSource {
  pub fn parse(value: Option<&str>) -> Self {
    match value.map(str::trim) {
      None | Some("") => MappingSource::None,
      Some(v) if v.starts_with("http://") || v.starts_with("https://") => match Url::parse(v) {
        Ok(url) => MappingSource::Url(url),
        Err(e) => {
          warn!("Invalid mapping URL {}: {}", v, e);
          MappingSource::None
        }
      },
      Some(v) => MappingSource::File(PathBuf::from(v)),
    }
  }
}

/// Loads the mapping document from disk or over HTTP.
#[derive(Clone)]
pub struct MappingLoader {
  source: MappingSource,
  transport: Arc<dyn Transport>,
}

impl MappingLoader {
  pub fn new(source: MappingSource, transport: Arc<dyn Transport>) -> Self {
    Self { source, transport }
  }

  pub fn source(&self) -> &MappingSource {
    &self.source
  }

  /// The mapping, or an empty one if it cannot be loaded.
  pub async fn load(&self) -> DriveMapping {
    match self.try_load().await {
      Ok(mapping) => mapping,
      Err(e) => {
        warn!("Failed to load drive mapping: {}", e);
        DriveMapping::default()
      }
    }
  }

  pub async fn try_load(&self) -> Result<DriveMapping> {
    match &self.source {
      MappingSource::None => Err(eyre!("No drive mapping configured")),
      MappingSource::File(path) => {
        info!("Loading drive mapping from {}", path.display());
        let bytes = tokio::fs::read(path)
          .await
          .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
        DriveMapping::from_json(&bytes)
      }
      MappingSource::Url(url) => {
        info!("Loading drive mapping from {}", url);
        let response = self.transport.get(url.clone()).await?;
        if !response.status.is_success() {
          return Err(eyre!("HTTP {} fetching {}", response.status, url));
        }
        DriveMapping::from_json(&response.body)
      }
    }
  }
}
