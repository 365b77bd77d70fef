//! Google Drive listing: provider types, transport, key rotation, the cached
//! client and the folder-mapping document.

mod api_types;
mod client;
mod keys;
mod mapping;
mod transport;
mod types;

pub use api_types::{ApiFile, ApiFileList};
pub use client::{folder_id_from_url, DriveClient};
pub use keys::{fingerprint, ApiKeyPool};
pub use mapping::{BatchFolder, DriveMapping, MappingFolder, MappingLoader, MappingSource};
pub use transport::{HttpResponse, ReqwestTransport, Transport};
pub use types::{FileEntry, FolderConfig, SearchResult, FOLDER_MIME_TYPE, ROOT_PATH};
