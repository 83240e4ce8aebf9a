use regex::Regex;
use std::sync::OnceLock;

use crate::errors::{UploadError, UploadResult};

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^https?://[A-Za-z0-9\-\._~%]+(:\d{1,5})?(/[^\s]*)?$").expect("valid regex")
    })
}

fn token_pattern() -> &'static Regex {
    // RFC 7230 token characters
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[!#$%&'*+\-.^_`|~0-9A-Za-z]+$").expect("valid regex"))
}

fn unsafe_filename_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).expect("valid regex"))
}

pub struct InputValidator;

impl InputValidator {
    pub fn validate_url(url: &str) -> UploadResult<()> {
        let trimmed = url.trim();

        if trimmed.is_empty() {
            return Err(UploadError::validation("url", "Upload URL cannot be empty"));
        }

        if trimmed.len() > 2048 {
            return Err(UploadError::validation("url", "Upload URL too long"));
        }

        if !url_pattern().is_match(trimmed) {
            return Err(UploadError::validation(
                "url",
                "Upload URL must be an http or https URL",
            ));
        }

        Ok(())
    }

    pub fn validate_field_name(name: &str) -> UploadResult<()> {
        if name.trim().is_empty() {
            return Err(UploadError::validation(
                "field_name",
                "Field name cannot be empty",
            ));
        }

        if name.contains(['"', '\r', '\n']) {
            return Err(UploadError::validation(
                "field_name",
                "Field name contains invalid characters",
            ));
        }

        Ok(())
    }

    pub fn validate_header(name: &str, value: &str) -> UploadResult<()> {
        if !token_pattern().is_match(name) {
            return Err(UploadError::invalid_header(name));
        }

        // Visible ASCII plus space and tab
        if value
            .bytes()
            .any(|b| !(b == b'\t' || (0x20..0x7f).contains(&b)))
        {
            return Err(UploadError::invalid_header(name));
        }

        Ok(())
    }

    pub fn sanitize_filename(filename: &str) -> String {
        let sanitized = unsafe_filename_chars().replace_all(filename.trim(), "_");

        if sanitized.is_empty() {
            return "upload".to_string();
        }

        // Limit length without splitting a character
        if sanitized.len() > 255 {
            let mut end = 252;
            while !sanitized.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &sanitized[..end])
        } else {
            sanitized.to_string()
        }
    }
}
