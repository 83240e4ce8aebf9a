use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{UploadError, UploadResult};
use crate::security::InputValidator;

/// Where and how each file is posted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub url: String,
    pub field_name: String,
    pub headers: BTreeMap<String, String>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/upload".to_string(),
            field_name: "file".to_string(),
            headers: BTreeMap::new(),
        }
    }
}

/// Selection rules, the equivalent of a file input's `accept` and `multiple`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PickerConfig {
    pub accept: String,
    pub multiple: bool,
}

impl Default for PickerConfig {
    fn default() -> Self {
        Self {
            accept: String::new(),
            multiple: true,
        }
    }
}

/// Settings for the queued uploader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    #[serde(flatten)]
    pub request: RequestConfig,
    #[serde(flatten)]
    pub picker: PickerConfig,
    /// Bytes, 0 means unlimited
    pub max_upload_size: u64,
    pub auto_upload: bool,
    pub max_auto_uploads: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            request: RequestConfig::default(),
            picker: PickerConfig::default(),
            max_upload_size: 0,
            auto_upload: true,
            max_auto_uploads: 3,
            max_retries: 3,
            retry_delay_ms: 2000,
        }
    }
}

impl UploaderConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Settings for the batch uploader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    #[serde(flatten)]
    pub request: RequestConfig,
    #[serde(flatten)]
    pub picker: PickerConfig,
    /// Read each file's contents alongside its upload
    pub read: bool,
    /// Files per selection, 0 means unlimited
    pub max_upload: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            request: RequestConfig::default(),
            picker: PickerConfig::default(),
            read: false,
            max_upload: 10,
        }
    }
}

/// Persisted settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub uploader: UploaderConfig,
    pub batch: BatchConfig,
    pub request_timeout_secs: u64,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            uploader: UploaderConfig::default(),
            batch: BatchConfig::default(),
            request_timeout_secs: 120,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

pub fn config_path() -> UploadResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| UploadError::Config("Could not find config directory".to_string()))?
        .join("file-uploader");

    fs::create_dir_all(&config_dir)?;
    Ok(config_dir.join("config.json"))
}

/// Load settings from `path`, or from the platform config directory.
///
/// A missing file is created with defaults. A file that fails to parse is
/// logged and replaced by defaults in memory only.
pub fn load_settings(path: Option<&Path>) -> UploadResult<Settings> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => config_path()?,
    };

    if config_path.exists() {
        let config_str = fs::read_to_string(&config_path)?;
        let settings: Settings = serde_json::from_str(&config_str).unwrap_or_else(|e| {
            log::warn!(
                "Failed to parse config file {}: {}. Using defaults.",
                config_path.display(),
                e
            );
            Settings::default()
        });

        validate_settings(&settings)?;
        Ok(settings)
    } else {
        let settings = Settings::default();
        save_settings_to(&settings, &config_path)?;
        Ok(settings)
    }
}

pub fn save_settings(settings: &Settings, path: Option<&Path>) -> UploadResult<()> {
    validate_settings(settings)?;
    match path {
        Some(path) => save_settings_to(settings, path),
        None => save_settings_to(settings, &config_path()?),
    }
}

fn save_settings_to(settings: &Settings, config_path: &Path) -> UploadResult<()> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Create backup of existing config
    if config_path.exists() {
        let backup_path = config_path.with_extension("json.bak");
        if let Err(e) = fs::copy(config_path, &backup_path) {
            log::warn!("Failed to create config backup: {}", e);
        }
    }

    let config_str = serde_json::to_string_pretty(settings)?;
    fs::write(config_path, config_str)?;

    log::info!("Configuration saved to {}", config_path.display());
    Ok(())
}

/// Reset settings to defaults, keeping a copy of the previous file.
pub fn reset_settings(path: Option<&Path>) -> UploadResult<Settings> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => config_path()?,
    };

    if config_path.exists() {
        let backup_path = config_path.with_extension("json.reset_backup");
        fs::copy(&config_path, &backup_path)?;
        log::info!("Existing config backed up to {}", backup_path.display());
    }

    let settings = Settings::default();
    save_settings_to(&settings, &config_path)?;

    log::info!("Configuration reset to defaults");
    Ok(settings)
}

pub fn validate_request(request: &RequestConfig) -> UploadResult<()> {
    InputValidator::validate_url(&request.url)?;
    InputValidator::validate_field_name(&request.field_name)?;
    for (name, value) in &request.headers {
        InputValidator::validate_header(name, value)?;
    }
    Ok(())
}

pub fn validate_uploader_config(config: &UploaderConfig) -> UploadResult<()> {
    validate_request(&config.request)?;

    if config.max_auto_uploads == 0 {
        return Err(UploadError::validation(
            "max_auto_uploads",
            "Must be at least 1",
        ));
    }

    if config.max_retries > 10 {
        return Err(UploadError::validation("max_retries", "Must be 10 or fewer"));
    }

    Ok(())
}

pub fn validate_batch_config(config: &BatchConfig) -> UploadResult<()> {
    validate_request(&config.request)
}

pub fn validate_settings(settings: &Settings) -> UploadResult<()> {
    validate_uploader_config(&settings.uploader)?;
    validate_batch_config(&settings.batch)?;

    if settings.request_timeout_secs == 0 {
        return Err(UploadError::validation(
            "request_timeout_secs",
            "Must be greater than 0",
        ));
    }

    let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
    if !valid_log_levels.contains(&settings.log_level.as_str()) {
        return Err(UploadError::validation("log_level", "Must be a valid log level"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(validate_settings(&settings).is_ok());
        assert_eq!(settings.uploader.max_auto_uploads, 3);
        assert_eq!(settings.uploader.max_retries, 3);
        assert_eq!(settings.uploader.retry_delay(), Duration::from_millis(2000));
        assert_eq!(settings.batch.max_upload, 10);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "uploader": { "url": "https://example.com/files", "max_auto_uploads": 5 },
            "batch": { "read": true }
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();

        assert_eq!(settings.uploader.request.url, "https://example.com/files");
        assert_eq!(settings.uploader.request.field_name, "file");
        assert_eq!(settings.uploader.max_auto_uploads, 5);
        assert!(settings.uploader.auto_upload);
        assert!(settings.batch.read);
        assert_eq!(settings.batch.max_upload, 10);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn test_validation_failures() {
        let mut settings = Settings::default();
        settings.uploader.max_auto_uploads = 0;
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.uploader.max_retries = 11;
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.batch.request.url = "not a url".to_string();
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings
            .uploader
            .request
            .headers
            .insert("Bad Header".to_string(), "x".to_string());
        assert!(matches!(
            validate_settings(&settings),
            Err(UploadError::InvalidHeader { .. })
        ));

        let mut settings = Settings::default();
        settings.log_level = "loud".to_string();
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn test_load_creates_defaults_then_reads_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let loaded = load_settings(Some(&path)).unwrap();
        assert_eq!(loaded, Settings::default());
        assert!(path.exists());

        let mut changed = loaded.clone();
        changed.uploader.max_upload_size = 4000;
        changed
            .uploader
            .request
            .headers
            .insert("X-Requested-With".to_string(), "XMLHttpRequest".to_string());
        save_settings(&changed, Some(&path)).unwrap();
        assert!(path.with_extension("json.bak").exists());

        let reloaded = load_settings(Some(&path)).unwrap();
        assert_eq!(reloaded, changed);

        let reset = reset_settings(Some(&path)).unwrap();
        assert_eq!(reset, Settings::default());
        assert!(path.with_extension("json.reset_backup").exists());
    }

    #[test]
    fn test_unparseable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let loaded = load_settings(Some(&path)).unwrap();
        assert_eq!(loaded, Settings::default());
    }
}
