//! Event-driven multipart file uploader.
//!
//! Two front ends share one file model, transport and event mechanism:
//!
//! * [`Uploader`] queues files, uploads a bounded number at a time and
//!   retries failures after a fixed delay.
//! * [`BatchUploader`] posts a whole selection at once and reports one
//!   combined outcome.

pub mod config;
pub mod errors;
pub mod events;
pub mod file;
pub mod picker;
pub mod security;
pub mod uploader;

pub use config::{BatchConfig, PickerConfig, RequestConfig, Settings, UploaderConfig};
pub use errors::{UploadError, UploadResult};
pub use events::{Event, EventEmitter, ListenerId};
pub use file::{FileHandle, FileId, FileMetadata};
pub use picker::{AcceptFilter, FilePicker};
pub use uploader::{
    BatchEvent, BatchEventKind, BatchOutcome, BatchUploader, FileState, HttpTransport,
    PendingBatch, QueuedFileInfo, Transport, Uploader, UploaderEvent, UploaderEventKind,
};
