use serde::Serialize;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::task::AbortHandle;

use crate::file::{FileHandle, FileId, FileMetadata};

use super::transport::UploadPayload;

/// Where a queued file currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Pending,
    Uploading,
    Retrying,
}

/// Snapshot of a queued file for callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedFileInfo {
    pub id: FileId,
    pub file: FileMetadata,
    pub attempts: u32,
    pub state: FileState,
}

/// A file owned by the queue: lives in exactly one of the pending or
/// uploading sets until it succeeds, fails for good, or is removed.
pub(crate) struct QueuedFile {
    pub id: FileId,
    pub file: FileHandle,
    pub attempts: u32,
    pub current_request: Option<AbortHandle>,
    pub retry_timer: Option<AbortHandle>,
    /// Built by the first attempt, reused by retries
    pub payload: Arc<OnceCell<Arc<UploadPayload>>>,
}

impl QueuedFile {
    pub fn new(id: FileId, file: FileHandle) -> Self {
        Self {
            id,
            file,
            attempts: 0,
            current_request: None,
            retry_timer: None,
            payload: Arc::new(OnceCell::new()),
        }
    }

    pub fn in_flight(&self) -> bool {
        self.current_request.is_some()
    }

    /// Abort the in-flight request and any scheduled retry.
    pub fn abort(&mut self) {
        if let Some(request) = self.current_request.take() {
            log::debug!("Aborting in-flight request for file {}", self.id);
            request.abort();
        }
        if let Some(timer) = self.retry_timer.take() {
            log::debug!("Cancelling scheduled retry for file {}", self.id);
            timer.abort();
        }
    }

    pub fn info(&self, pending: bool) -> QueuedFileInfo {
        let state = if pending {
            FileState::Pending
        } else if self.retry_timer.is_some() && !self.in_flight() {
            FileState::Retrying
        } else {
            FileState::Uploading
        };

        QueuedFileInfo {
            id: self.id,
            file: self.file.metadata(),
            attempts: self.attempts,
            state,
        }
    }
}
