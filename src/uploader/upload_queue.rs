use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, OnceCell};

use crate::config::{validate_uploader_config, UploaderConfig};
use crate::errors::{lock_or_recover, UploadError, UploadResult};
use crate::events::{Event, EventEmitter, ListenerId};
use crate::file::{next_file_id, FileHandle, FileId, FileMetadata};
use crate::picker::FilePicker;

use super::progress_tracker::{ProgressTracker, Transition};
use super::retry::RetryPolicy;
use super::transport::{HttpTransport, ProgressCallback, Transport, UploadPayload};
use super::upload_file::{QueuedFile, QueuedFileInfo};

/// Lifecycle events of the queued uploader.
#[derive(Debug, Clone, PartialEq)]
pub enum UploaderEvent {
    FileAdded { id: FileId, file: FileMetadata },
    Upload { id: FileId, attempt: u32 },
    Progress { id: FileId, sent: u64, total: u64 },
    Retry { id: FileId, attempt: u32, reason: String },
    Success { id: FileId, response: Value },
    Error { id: FileId, reason: String },
    UploadStarted,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploaderEventKind {
    FileAdded,
    Upload,
    Progress,
    Retry,
    Success,
    Error,
    UploadStarted,
    Complete,
}

impl UploaderEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileAdded => "file",
            Self::Upload => "upload",
            Self::Progress => "progress",
            Self::Retry => "retry",
            Self::Success => "success",
            Self::Error => "error",
            Self::UploadStarted => "upload-started",
            Self::Complete => "complete",
        }
    }
}

impl Event for UploaderEvent {
    type Kind = UploaderEventKind;

    fn kind(&self) -> UploaderEventKind {
        match self {
            Self::FileAdded { .. } => UploaderEventKind::FileAdded,
            Self::Upload { .. } => UploaderEventKind::Upload,
            Self::Progress { .. } => UploaderEventKind::Progress,
            Self::Retry { .. } => UploaderEventKind::Retry,
            Self::Success { .. } => UploaderEventKind::Success,
            Self::Error { .. } => UploaderEventKind::Error,
            Self::UploadStarted => UploaderEventKind::UploadStarted,
            Self::Complete => UploaderEventKind::Complete,
        }
    }
}

#[derive(Default)]
struct QueueState {
    /// Ids are monotonic, so key order is admission order
    pending: BTreeMap<FileId, QueuedFile>,
    uploading: HashMap<FileId, QueuedFile>,
    tracker: ProgressTracker,
}

struct Inner {
    config: UploaderConfig,
    retry: RetryPolicy,
    transport: Arc<dyn Transport>,
    state: Mutex<QueueState>,
    events: EventEmitter<UploaderEvent>,
    idle: watch::Sender<bool>,
}

/// Queued uploader: admits files into a pending queue and moves them into a
/// bounded set of concurrent uploads, retrying failures after a fixed delay.
///
/// Cloning is cheap and every clone drives the same queue. Methods that can
/// start uploads must be called from inside a tokio runtime.
#[derive(Clone)]
pub struct Uploader {
    inner: Arc<Inner>,
}

impl Uploader {
    pub fn new(config: UploaderConfig, transport: Arc<dyn Transport>) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                retry: RetryPolicy::from_config(&config),
                config,
                transport,
                state: Mutex::new(QueueState::default()),
                events: EventEmitter::new(),
                idle,
            }),
        }
    }

    /// Validate the configuration and post over HTTP.
    pub fn with_http(config: UploaderConfig, timeout: Duration) -> UploadResult<Self> {
        validate_uploader_config(&config)?;
        let transport = HttpTransport::new(timeout)?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventEmitter<UploaderEvent> {
        &self.inner.events
    }

    pub fn on<F>(&self, kind: UploaderEventKind, callback: F) -> ListenerId
    where
        F: Fn(&UploaderEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, callback)
    }

    pub fn on_any<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&UploaderEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_any(callback)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    /// Admit a file.
    ///
    /// Files over `max_upload_size` are rejected without touching either
    /// queue and without an event.
    pub fn add(&self, file: FileHandle) -> UploadResult<FileId> {
        let limit = self.inner.config.max_upload_size;
        if limit > 0 && file.size() > limit {
            log::warn!(
                "Rejected {} ({} bytes): exceeds limit of {} bytes",
                file.name(),
                file.size(),
                limit
            );
            return Err(UploadError::file_too_large(file.name(), file.size(), limit));
        }

        let id = next_file_id();
        {
            let mut state = self.lock_state("add");
            log::info!("Queued {} as file {}", file.name(), id);
            let metadata = file.metadata();
            state.pending.insert(id, QueuedFile::new(id, file));
            self.inner
                .events
                .enqueue(UploaderEvent::FileAdded { id, file: metadata });
            self.continue_locked(&mut state);
        }
        self.inner.events.dispatch();

        Ok(id)
    }

    /// Select files from paths with the configured picker and admit each one.
    pub fn add_paths<P: AsRef<Path>>(&self, paths: &[P]) -> Vec<(String, UploadResult<FileId>)> {
        FilePicker::new(&self.inner.config.picker)
            .select(paths)
            .into_iter()
            .map(|file| (file.name().to_string(), self.add(file)))
            .collect()
    }

    /// Start a queued file now, regardless of the concurrency cap.
    ///
    /// Returns false for unknown files and files with a request in flight.
    pub fn upload(&self, id: FileId) -> bool {
        let started = {
            let mut state = self.lock_state("manual upload");
            self.start_locked(&mut state, id)
        };
        self.inner.events.dispatch();
        started
    }

    /// Remove a file, aborting its request or scheduled retry.
    pub fn remove(&self, id: FileId) -> bool {
        let removed = {
            let mut state = self.lock_state("remove");
            let removed = self.remove_locked(&mut state, id).is_some();
            self.continue_locked(&mut state);
            removed
        };
        self.inner.events.dispatch();

        if removed {
            log::info!("Removed file {}", id);
        }
        removed
    }

    /// Remove every pending and uploading file. Returns how many were removed.
    pub fn cancel_all(&self) -> usize {
        let count = {
            let mut state = self.lock_state("cancel all");
            let ids: Vec<FileId> = state
                .pending
                .keys()
                .chain(state.uploading.keys())
                .copied()
                .collect();
            for id in &ids {
                self.remove_locked(&mut state, *id);
            }
            self.continue_locked(&mut state);
            ids.len()
        };
        self.inner.events.dispatch();

        log::info!("Cancelled {} queued uploads", count);
        count
    }

    pub fn pending_ids(&self) -> Vec<FileId> {
        self.lock_state("pending ids").pending.keys().copied().collect()
    }

    pub fn uploading_ids(&self) -> Vec<FileId> {
        let mut ids: Vec<FileId> = self
            .lock_state("uploading ids")
            .uploading
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn file(&self, id: FileId) -> Option<QueuedFileInfo> {
        let state = self.lock_state("file info");
        state
            .pending
            .get(&id)
            .map(|f| f.info(true))
            .or_else(|| state.uploading.get(&id).map(|f| f.info(false)))
    }

    /// Every queued file, in id order.
    pub fn files(&self) -> Vec<QueuedFileInfo> {
        let state = self.lock_state("file list");
        let mut files: Vec<QueuedFileInfo> = state
            .pending
            .values()
            .map(|f| f.info(true))
            .chain(state.uploading.values().map(|f| f.info(false)))
            .collect();
        files.sort_by_key(|f| f.id);
        files
    }

    pub fn is_uploading(&self) -> bool {
        self.lock_state("progress check").tracker.in_progress()
    }

    /// Resolve once both the pending queue and the uploading set are empty.
    ///
    /// With auto upload off this waits for pending files to be started or removed.
    pub async fn wait_until_idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = idle.wait_for(|idle| *idle).await;
    }

    fn lock_state(&self, operation: &str) -> std::sync::MutexGuard<'_, QueueState> {
        lock_or_recover(&self.inner.state, operation)
    }

    /// Fill free slots from the pending queue, then re-evaluate progress.
    fn continue_locked(&self, state: &mut QueueState) {
        if self.inner.config.auto_upload {
            let mut slots = self
                .inner
                .config
                .max_auto_uploads
                .saturating_sub(state.uploading.len());

            while slots > 0 {
                let Some(&id) = state.pending.keys().next() else {
                    break;
                };
                self.start_locked(state, id);
                slots -= 1;
            }
        }

        self.observe_locked(state);
    }

    fn start_locked(&self, state: &mut QueueState, id: FileId) -> bool {
        if state.uploading.get(&id).is_some_and(QueuedFile::in_flight) {
            log::debug!("File {} already has a request in flight", id);
            return false;
        }

        if let Some(file) = state.pending.remove(&id) {
            state.uploading.insert(id, file);
        }

        let Some(file) = state.uploading.get_mut(&id) else {
            log::debug!("Cannot start unknown file {}", id);
            return false;
        };

        if let Some(timer) = file.retry_timer.take() {
            timer.abort();
        }
        file.attempts += 1;
        let attempt = file.attempts;

        let task = tokio::spawn(run_attempt(
            self.clone(),
            id,
            file.file.clone(),
            Arc::clone(&file.payload),
            attempt,
        ));
        file.current_request = Some(task.abort_handle());

        log::info!(
            "Uploading {} (file {}, attempt {}/{})",
            file.file.name(),
            id,
            attempt,
            self.inner.retry.total_attempts()
        );
        self.inner
            .events
            .enqueue(UploaderEvent::Upload { id, attempt });
        self.observe_locked(state);
        true
    }

    fn remove_locked(&self, state: &mut QueueState, id: FileId) -> Option<QueuedFile> {
        let mut removed = state.pending.remove(&id);
        if let Some(file) = state.uploading.remove(&id) {
            removed = Some(file);
        }
        if let Some(file) = removed.as_mut() {
            file.abort();
        }
        removed
    }

    fn observe_locked(&self, state: &mut QueueState) {
        match state.tracker.observe(state.uploading.len()) {
            Some(Transition::Started) => self.inner.events.enqueue(UploaderEvent::UploadStarted),
            Some(Transition::Complete) => self.inner.events.enqueue(UploaderEvent::Complete),
            None => {}
        }

        let idle = state.pending.is_empty() && state.uploading.is_empty();
        self.inner.idle.send_if_modified(|current| {
            let changed = *current != idle;
            *current = idle;
            changed
        });
    }

    fn finish_attempt(&self, id: FileId, attempt: u32, result: UploadResult<Value>) {
        {
            let mut state = self.lock_state("finish attempt");
            let Some(file) = state.uploading.get_mut(&id) else {
                log::debug!("Dropping result for removed file {}", id);
                return;
            };
            if file.attempts != attempt {
                log::debug!("Dropping stale result of attempt {} for file {}", attempt, id);
                return;
            }
            file.current_request = None;

            match result {
                Ok(response) => {
                    log::info!("Uploaded {} (file {})", file.file.name(), id);
                    self.remove_locked(&mut state, id);
                    self.inner
                        .events
                        .enqueue(UploaderEvent::Success { id, response });
                }
                Err(e) if self.inner.retry.should_retry(attempt) => {
                    log::warn!(
                        "Upload attempt {} failed for {} (file {}), retrying in {:?}: {}",
                        attempt,
                        file.file.name(),
                        id,
                        self.inner.retry.delay,
                        e
                    );
                    let timer = tokio::spawn(retry_after(self.clone(), id, self.inner.retry.delay));
                    file.retry_timer = Some(timer.abort_handle());
                    self.inner.events.enqueue(UploaderEvent::Retry {
                        id,
                        attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    log::error!(
                        "Upload failed for {} (file {}) after {} attempts: {}",
                        file.file.name(),
                        id,
                        attempt,
                        e
                    );
                    self.remove_locked(&mut state, id);
                    self.inner.events.enqueue(UploaderEvent::Error {
                        id,
                        reason: e.to_string(),
                    });
                }
            }

            self.continue_locked(&mut state);
        }
        self.inner.events.dispatch();
    }

    fn resume_retry(&self, id: FileId) {
        {
            let mut state = self.lock_state("retry");
            match state.uploading.get_mut(&id) {
                Some(file) => {
                    file.retry_timer = None;
                    self.start_locked(&mut state, id);
                }
                None => log::debug!("Retry for removed file {} suppressed", id),
            }
        }
        self.inner.events.dispatch();
    }

    fn progress_callback(&self, id: FileId) -> ProgressCallback {
        let uploader = self.clone();
        Arc::new(move |sent, total| {
            uploader
                .inner
                .events
                .emit(UploaderEvent::Progress { id, sent, total });
        })
    }
}

async fn run_attempt(
    uploader: Uploader,
    id: FileId,
    file: FileHandle,
    payload: Arc<OnceCell<Arc<UploadPayload>>>,
    attempt: u32,
) {
    let request = &uploader.inner.config.request;
    let result: UploadResult<Value> = async {
        let payload = payload
            .get_or_try_init(|| async {
                UploadPayload::prepare(request, &file).await.map(Arc::new)
            })
            .await?;
        uploader
            .inner
            .transport
            .send(Arc::clone(payload), uploader.progress_callback(id))
            .await
    }
    .await;

    uploader.finish_attempt(id, attempt, result);
}

async fn retry_after(uploader: Uploader, id: FileId, delay: Duration) {
    tokio::time::sleep(delay).await;
    uploader.resume_retry(id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(UploaderEventKind::FileAdded.as_str(), "file");
        assert_eq!(UploaderEventKind::UploadStarted.as_str(), "upload-started");
        assert_eq!(UploaderEvent::Complete.kind(), UploaderEventKind::Complete);
        assert_eq!(
            UploaderEvent::Retry {
                id: 1,
                attempt: 1,
                reason: String::new()
            }
            .kind()
            .as_str(),
            "retry"
        );
    }
}
