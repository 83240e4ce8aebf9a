use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::{validate_batch_config, BatchConfig, RequestConfig};
use crate::errors::{lock_or_recover, UploadError, UploadResult};
use crate::events::{Event, EventEmitter, ListenerId};
use crate::file::{FileHandle, FileMetadata};
use crate::picker::FilePicker;

use super::transport::{HttpTransport, ProgressCallback, Transport, UploadPayload};

/// Events of the batch uploader. `index` is the file's position in the
/// retained (truncated) selection.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    File { index: usize, file: FileMetadata },
    Progress { index: usize, sent: u64, total: u64 },
    Read { index: usize, file: FileMetadata, contents: Arc<Vec<u8>> },
    FileSuccess { index: usize, file: FileMetadata, response: Value },
    FileError { index: usize, file: FileMetadata, reason: String },
    Success { files: Vec<FileMetadata> },
    Error { files: Vec<FileMetadata> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchEventKind {
    File,
    Progress,
    Read,
    FileSuccess,
    FileError,
    Success,
    Error,
}

impl BatchEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Progress => "progress",
            Self::Read => "read",
            Self::FileSuccess => "file-success",
            Self::FileError => "file-error",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl Event for BatchEvent {
    type Kind = BatchEventKind;

    fn kind(&self) -> BatchEventKind {
        match self {
            Self::File { .. } => BatchEventKind::File,
            Self::Progress { .. } => BatchEventKind::Progress,
            Self::Read { .. } => BatchEventKind::Read,
            Self::FileSuccess { .. } => BatchEventKind::FileSuccess,
            Self::FileError { .. } => BatchEventKind::FileError,
            Self::Success { .. } => BatchEventKind::Success,
            Self::Error { .. } => BatchEventKind::Error,
        }
    }
}

/// Result of one selection, in selection order.
#[derive(Debug)]
pub struct BatchOutcome {
    pub files: Vec<FileMetadata>,
    pub results: Vec<UploadResult<Value>>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.results.iter().all(Result::is_ok)
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.is_err()).count()
    }
}

/// Orders a file's `Read` event against its own success or error event.
///
/// Both go through one lock, so a read never reports after the upload settled.
#[derive(Default)]
struct Settlement {
    settled: Mutex<bool>,
}

impl Settlement {
    /// Run `emit` only if the upload has not settled yet.
    fn unless_settled(&self, emit: impl FnOnce()) -> bool {
        let settled = lock_or_recover(&self.settled, "batch read");
        if *settled {
            return false;
        }
        emit();
        true
    }

    /// Settle the upload and run `emit`. Only the first call has any effect.
    fn settle(&self, emit: impl FnOnce()) -> bool {
        let mut settled = lock_or_recover(&self.settled, "batch settle");
        if *settled {
            return false;
        }
        *settled = true;
        emit();
        true
    }
}

/// Handle to a selection whose uploads are running. Resolves to the
/// combined outcome.
pub struct PendingBatch {
    task: JoinHandle<BatchOutcome>,
    uploads: Vec<AbortHandle>,
    reads: Vec<AbortHandle>,
}

impl PendingBatch {
    pub fn len(&self) -> usize {
        self.uploads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
    }

    /// Abort every upload and read of the batch. Each aborted file gets a
    /// `FileError` and the batch still settles, as a failure.
    pub fn abort(&self) {
        for task in self.uploads.iter().chain(&self.reads) {
            task.abort();
        }
    }

    pub async fn wait(self) -> UploadResult<BatchOutcome> {
        self.await
    }
}

impl Future for PendingBatch {
    type Output = UploadResult<BatchOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task)
            .poll(cx)
            .map(|joined| joined.map_err(|e| UploadError::Internal(format!("Batch task failed: {}", e))))
    }
}

/// Fires every selected file at once and reports one combined outcome.
pub struct BatchUploader {
    config: BatchConfig,
    transport: Arc<dyn Transport>,
    events: Arc<EventEmitter<BatchEvent>>,
}

impl BatchUploader {
    pub fn new(config: BatchConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            events: Arc::new(EventEmitter::new()),
        }
    }

    pub fn with_http(config: BatchConfig, timeout: Duration) -> UploadResult<Self> {
        validate_batch_config(&config)?;
        let transport = HttpTransport::new(timeout)?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn events(&self) -> &EventEmitter<BatchEvent> {
        &self.events
    }

    pub fn on<F>(&self, kind: BatchEventKind, callback: F) -> ListenerId
    where
        F: Fn(&BatchEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, callback)
    }

    pub fn on_any<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&BatchEvent) + Send + Sync + 'static,
    {
        self.events.on_any(callback)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    /// Start uploading a selection.
    ///
    /// Files past `max_upload` are dropped silently. `File` events are
    /// emitted and every request is started before this returns.
    pub fn select(&self, mut files: Vec<FileHandle>) -> PendingBatch {
        let max_upload = self.config.max_upload;
        if max_upload > 0 && files.len() > max_upload {
            log::info!(
                "Selection of {} files truncated to {}",
                files.len(),
                max_upload
            );
            files.truncate(max_upload);
        }

        let metadata: Vec<FileMetadata> = files.iter().map(FileHandle::metadata).collect();
        let mut uploads = Vec::with_capacity(files.len());
        let mut reads = Vec::new();
        let mut settlements = Vec::with_capacity(files.len());

        for (index, file) in files.into_iter().enumerate() {
            self.events.emit(BatchEvent::File {
                index,
                file: file.metadata(),
            });

            let settlement = Arc::new(Settlement::default());
            uploads.push(tokio::spawn(upload_one(
                self.config.request.clone(),
                Arc::clone(&self.transport),
                Arc::clone(&self.events),
                index,
                file.clone(),
                Arc::clone(&settlement),
            )));

            if self.config.read {
                let read = tokio::spawn(read_one(
                    Arc::clone(&self.events),
                    index,
                    file,
                    Arc::clone(&settlement),
                ));
                reads.push(read.abort_handle());
            }
            settlements.push(settlement);
        }

        let abort_handles = uploads.iter().map(JoinHandle::abort_handle).collect();
        let events = Arc::clone(&self.events);
        let task = tokio::spawn(async move {
            let joined = futures::future::join_all(uploads).await;
            let mut results: Vec<UploadResult<Value>> = Vec::with_capacity(joined.len());

            for (index, joined) in joined.into_iter().enumerate() {
                let result = match joined {
                    Ok(result) => result,
                    Err(e) => {
                        let error = if e.is_cancelled() {
                            UploadError::Aborted
                        } else {
                            UploadError::Internal(format!("Upload task failed: {}", e))
                        };
                        log::warn!("Upload of {} ended early: {}", metadata[index].name, error);
                        settlements[index].settle(|| {
                            events.emit(BatchEvent::FileError {
                                index,
                                file: metadata[index].clone(),
                                reason: error.to_string(),
                            });
                        });
                        Err(error)
                    }
                };
                results.push(result);
            }

            let outcome = BatchOutcome {
                files: metadata,
                results,
            };

            log::info!(
                "Batch finished: {}/{} uploaded",
                outcome.results.len() - outcome.failed(),
                outcome.results.len()
            );

            if outcome.is_success() {
                events.emit(BatchEvent::Success {
                    files: outcome.files.clone(),
                });
            } else {
                events.emit(BatchEvent::Error {
                    files: outcome.files.clone(),
                });
            }
            outcome
        });

        PendingBatch {
            task,
            uploads: abort_handles,
            reads,
        }
    }

    /// Select files from paths with the configured picker, then upload them.
    pub fn select_paths<P: AsRef<Path>>(&self, paths: &[P]) -> PendingBatch {
        let files = FilePicker::new(&self.config.picker).select(paths);
        self.select(files)
    }
}

async fn upload_one(
    request: RequestConfig,
    transport: Arc<dyn Transport>,
    events: Arc<EventEmitter<BatchEvent>>,
    index: usize,
    file: FileHandle,
    settlement: Arc<Settlement>,
) -> UploadResult<Value> {
    let progress_events = Arc::clone(&events);
    let on_progress: ProgressCallback = Arc::new(move |sent, total| {
        progress_events.emit(BatchEvent::Progress { index, sent, total });
    });

    let result: UploadResult<Value> = async {
        let payload = Arc::new(UploadPayload::prepare(&request, &file).await?);
        transport.send(payload, on_progress).await
    }
    .await;

    match &result {
        Ok(response) => {
            log::info!("Uploaded {}", file.name());
            settlement.settle(|| {
                events.emit(BatchEvent::FileSuccess {
                    index,
                    file: file.metadata(),
                    response: response.clone(),
                });
            });
        }
        Err(e) => {
            log::error!("Upload failed for {}: {}", file.name(), e);
            settlement.settle(|| {
                events.emit(BatchEvent::FileError {
                    index,
                    file: file.metadata(),
                    reason: e.to_string(),
                });
            });
        }
    }

    result
}

async fn read_one(
    events: Arc<EventEmitter<BatchEvent>>,
    index: usize,
    file: FileHandle,
    settlement: Arc<Settlement>,
) {
    match file.read().await {
        Ok(contents) => {
            let delivered = settlement.unless_settled(|| {
                events.emit(BatchEvent::Read {
                    index,
                    file: file.metadata(),
                    contents,
                });
            });
            if !delivered {
                log::debug!("Upload of {} already settled, dropping read", file.name());
            }
        }
        Err(e) => log::warn!("Failed to read {}: {}", file.name(), e),
    }
}
