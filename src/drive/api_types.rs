//! Serde-deserializable types matching the Drive v3 `files.list` response.

use serde::Deserialize;

use super::types::FileEntry;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiFileList {
  #[serde(default)]
  pub files: Vec<ApiFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiFile {
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(rename = "mimeType", default)]
  pub mime_type: String,
  #[serde(rename = "webViewLink")]
  pub web_view_link: Option<String>,
}

impl ApiFileList {
  pub fn into_entries(self) -> Vec<FileEntry> {
    self.files.into_iter().map(FileEntry::from).collect()
  }
}

impl From<ApiFile> for FileEntry {
  fn from(file: ApiFile) -> Self {
    FileEntry {
      id: file.id,
      name: file.name,
      mime_type: file.mime_type,
      view_link: file.web_view_link.unwrap_or_default(),
    }
  }
}
