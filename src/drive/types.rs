use serde::{Deserialize, Serialize};

/// MIME type the provider reports for folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Path shown for documents that sit directly in a crawl root.
pub const ROOT_PATH: &str = "Root";

/// One direct child of a drive folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
  pub id: String,
  pub name: String,
  #[serde(rename = "mimeType")]
  pub mime_type: String,
  #[serde(rename = "webViewLink", alias = "viewLink", default)]
  pub view_link: String,
}

impl FileEntry {
  pub fn is_folder(&self) -> bool {
    self.mime_type == FOLDER_MIME_TYPE
  }
}

/// A crawl root: one drive folder belonging to a semester/batch pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderConfig {
  pub folder_id: String,
  pub semester: String,
  pub batch_label: String,
}

/// A leaf document found while crawling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
  pub name: String,
  pub link: String,
  /// Slash-joined ancestor folder names below the root, or [`ROOT_PATH`]
  pub path: String,
  pub semester: String,
  pub batch: String,
  #[serde(rename = "type")]
  pub mime_type: String,
  /// Folder the document was listed in
  pub folder_id: String,
}

impl SearchResult {
  /// Identity used when collapsing duplicate results.
  pub fn dedup_key(&self) -> (&str, &str, &str) {
    (&self.semester, &self.batch, &self.path)
  }
}
