//! File selection: turns user-supplied paths into [`FileHandle`]s, applying
//! an `accept` filter and the single/multiple selection rule.

use std::path::{Path, PathBuf};

use crate::config::PickerConfig;
use crate::errors::{UploadError, UploadResult};
use crate::file::FileHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
enum AcceptToken {
    Extension(String),
    TypeWildcard(String),
    Exact(String),
}

/// Parsed `accept` list such as `image/*,.pdf,text/plain`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptFilter {
    source: String,
    tokens: Vec<AcceptToken>,
}

impl AcceptFilter {
    pub fn parse(accept: &str) -> Self {
        let tokens = accept
            .split(',')
            .map(|token| token.trim().to_ascii_lowercase())
            .filter(|token| !token.is_empty())
            .map(|token| {
                if let Some(ext) = token.strip_prefix('.') {
                    AcceptToken::Extension(ext.to_string())
                } else if let Some(top) = token.strip_suffix("/*") {
                    AcceptToken::TypeWildcard(top.to_string())
                } else {
                    AcceptToken::Exact(token)
                }
            })
            .collect();

        Self {
            source: accept.trim().to_string(),
            tokens,
        }
    }

    pub fn accepts_everything(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn accepts(&self, file: &FileHandle) -> bool {
        if self.tokens.is_empty() {
            return true;
        }

        let name = file.name().to_ascii_lowercase();
        let extension = Path::new(&name)
            .extension()
            .map(|e| e.to_string_lossy().to_string());
        let mime = file.mime_type().to_ascii_lowercase();
        let top_level = mime.split('/').next().unwrap_or_default();

        self.tokens.iter().any(|token| match token {
            AcceptToken::Extension(ext) => extension.as_deref() == Some(ext.as_str()),
            AcceptToken::TypeWildcard(top) => top == top_level,
            AcceptToken::Exact(exact) => *exact == mime,
        })
    }

    /// Accept the file or explain why not.
    pub fn check(&self, file: &FileHandle) -> UploadResult<()> {
        if self.accepts(file) {
            Ok(())
        } else {
            Err(UploadError::not_accepted(file.name(), &self.source))
        }
    }
}

pub struct FilePicker {
    filter: AcceptFilter,
    multiple: bool,
}

impl FilePicker {
    pub fn new(config: &PickerConfig) -> Self {
        Self {
            filter: AcceptFilter::parse(&config.accept),
            multiple: config.multiple,
        }
    }

    pub fn filter(&self) -> &AcceptFilter {
        &self.filter
    }

    /// Resolve paths into handles.
    ///
    /// Directories contribute their regular files, sorted by name, without
    /// recursing. Unreadable paths and files rejected by the filter are
    /// logged and skipped. When multiple selection is off only the first
    /// accepted file is kept.
    pub fn select<P: AsRef<Path>>(&self, paths: &[P]) -> Vec<FileHandle> {
        let mut selected = Vec::new();

        for path in paths {
            for candidate in expand_path(path.as_ref()) {
                let file = match FileHandle::from_path(&candidate) {
                    Ok(file) => file,
                    Err(e) => {
                        log::warn!("Skipping {}: {}", candidate.display(), e);
                        continue;
                    }
                };

                if let Err(e) = self.filter.check(&file) {
                    log::info!("{}", e);
                    continue;
                }

                selected.push(file);
                if !self.multiple {
                    return selected;
                }
            }
        }

        selected
    }
}

fn expand_path(path: &Path) -> Vec<PathBuf> {
    if !path.is_dir() {
        return vec![path.to_path_buf()];
    }

    match std::fs::read_dir(path) {
        Ok(entries) => {
            let mut files: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|p| p.is_file())
                .collect();
            files.sort();
            files
        }
        Err(e) => {
            log::warn!("Failed to read directory {}: {}", path.display(), e);
            Vec::new()
        }
    }
}
