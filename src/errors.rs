use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server responded with {status}: {body}")]
    Http { status: u16, body: String },

    #[error("File too large: {name} is {size} bytes, limit is {limit} bytes")]
    FileTooLarge { name: String, size: u64, limit: u64 },

    #[error("File not accepted: {name} does not match '{accept}'")]
    NotAccepted { name: String, accept: String },

    #[error("Invalid request header: {name}")]
    InvalidHeader { name: String },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Upload aborted")]
    Aborted,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Custom result type
pub type UploadResult<T> = Result<T, UploadError>;

impl UploadError {
    pub fn validation(field: &str, message: &str) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    pub fn file_too_large(name: &str, size: u64, limit: u64) -> Self {
        Self::FileTooLarge {
            name: name.to_string(),
            size,
            limit,
        }
    }

    pub fn not_accepted(name: &str, accept: &str) -> Self {
        Self::NotAccepted {
            name: name.to_string(),
            accept: accept.to_string(),
        }
    }

    pub fn invalid_header(name: &str) -> Self {
        Self::InvalidHeader {
            name: name.to_string(),
        }
    }

    /// Rejections that happen before a file ever reaches a queue.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            UploadError::FileTooLarge { .. } | UploadError::NotAccepted { .. }
        )
    }
}

/// Lock a mutex, recovering the guard if a listener panicked while holding it.
pub fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, operation: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::error!(
                "Lock poisoned during {} (recovering, non-critical)",
                operation
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_admission_rejections() {
        assert!(UploadError::file_too_large("a.bin", 5000, 4000).is_admission_rejection());
        assert!(UploadError::not_accepted("a.exe", "image/*").is_admission_rejection());
        assert!(!UploadError::Aborted.is_admission_rejection());
        assert!(!UploadError::Http {
            status: 500,
            body: String::new()
        }
        .is_admission_rejection());
    }

    #[test]
    fn test_error_messages() {
        let err = UploadError::file_too_large("photo.png", 5000, 4000);
        assert_eq!(
            err.to_string(),
            "File too large: photo.png is 5000 bytes, limit is 4000 bytes"
        );

        let err = UploadError::validation("url", "Must be http or https");
        assert_eq!(err.to_string(), "Validation error: url - Must be http or https");
    }

    #[test]
    fn test_lock_or_recover_poisoned_mutex() {
        let mutex = Arc::new(Mutex::new(1));
        let clone = Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(mutex.is_poisoned());
        let mut guard = lock_or_recover(&mutex, "test");
        *guard += 1;
        assert_eq!(*guard, 2);
    }
}
