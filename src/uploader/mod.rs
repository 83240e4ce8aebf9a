// Uploader module - queued and batch uploaders over a shared transport
//
// The queued uploader drives admission, concurrency and retries; the batch
// uploader fires a whole selection at once.

pub mod batch;
pub mod progress_tracker;
pub mod retry;
pub mod transport;
pub mod upload_file;
pub mod upload_queue;

pub use batch::{BatchEvent, BatchEventKind, BatchOutcome, BatchUploader, PendingBatch};
pub use transport::{HttpTransport, ProgressCallback, Transport, UploadPayload};
pub use upload_file::{FileState, QueuedFileInfo};
pub use upload_queue::{Uploader, UploaderEvent, UploaderEventKind};
