use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::errors::{UploadError, UploadResult};

/// Identifier of a file admitted to an uploader.
pub type FileId = u64;

// Shared by every uploader in the process so ids never collide.
static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_file_id() -> FileId {
    NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone)]
enum FileSource {
    Path(PathBuf),
    Memory(Arc<Vec<u8>>),
}

/// A file selected for upload, backed by a path on disk or an in-memory buffer.
///
/// Metadata is captured when the handle is created and does not change if the
/// file on disk does.
#[derive(Debug, Clone)]
pub struct FileHandle {
    source: FileSource,
    name: String,
    size: u64,
    mime_type: String,
    modified: DateTime<Utc>,
}

/// Serializable view of a handle's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub modified: DateTime<Utc>,
}

impl FileHandle {
    pub fn from_path(path: impl AsRef<Path>) -> UploadResult<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;

        if !metadata.is_file() {
            return Err(UploadError::validation(
                "file_path",
                &format!("{} is not a regular file", path.display()),
            ));
        }

        let name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Self {
            mime_type: guess_mime_type(&name),
            source: FileSource::Path(path.to_path_buf()),
            name,
            size: metadata.len(),
            modified,
        })
    }

    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        let name = name.into();
        Self {
            mime_type: guess_mime_type(&name),
            size: data.len() as u64,
            source: FileSource::Memory(Arc::new(data)),
            name,
            modified: Utc::now(),
        }
    }

    /// Override the guessed mime type.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            FileSource::Path(path) => Some(path),
            FileSource::Memory(_) => None,
        }
    }

    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            name: self.name.clone(),
            size: self.size,
            mime_type: self.mime_type.clone(),
            modified: self.modified,
        }
    }

    /// Read the whole file.
    pub async fn read(&self) -> UploadResult<Arc<Vec<u8>>> {
        match &self.source {
            FileSource::Path(path) => {
                let data = tokio::fs::read(path).await?;
                log::debug!("Read {} bytes from {}", data.len(), path.display());
                Ok(Arc::new(data))
            }
            FileSource::Memory(data) => Ok(Arc::clone(data)),
        }
    }
}

fn guess_mime_type(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
