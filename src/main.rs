use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use file_uploader::config::{self, Settings};
use file_uploader::{BatchEvent, BatchUploader, Uploader, UploaderEvent};

#[derive(Parser)]
#[command(name = "file-uploader")]
#[command(about = "Upload files as multipart/form-data with a bounded queue and retries")]
#[command(version)]
struct Cli {
    /// Files or directories to upload
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Settings file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Endpoint receiving the uploads
    #[arg(long)]
    url: Option<String>,

    /// Form field the file is attached under
    #[arg(long)]
    field: Option<String>,

    /// Extra request header as NAME:VALUE (repeatable)
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Accepted types, e.g. "image/*,.pdf"
    #[arg(long)]
    accept: Option<String>,

    /// Reject files larger than this many bytes (queue mode)
    #[arg(long)]
    max_size: Option<u64>,

    /// Concurrent uploads (queue mode)
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Retries per file (queue mode)
    #[arg(long)]
    max_retries: Option<u32>,

    /// Delay between retries in milliseconds (queue mode)
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Post every file at once instead of queueing
    #[arg(long)]
    batch: bool,

    /// Also read each file and report its size (batch mode)
    #[arg(long)]
    read: bool,

    /// Files per selection (batch mode)
    #[arg(long)]
    max_files: Option<usize>,

    /// Persist the effective settings
    #[arg(long)]
    save_config: bool,
}

fn parse_header(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("Invalid header '{}', expected NAME:VALUE", raw)),
    }
}

const DEFAULT_LOG_LEVEL: &str = "info";

/// Level to cap logging at, or `None` when `RUST_LOG` decides.
fn effective_level(configured: &str, env_filter: bool) -> Option<LevelFilter> {
    if env_filter {
        return None;
    }
    Some(configured.parse().unwrap_or(LevelFilter::Info))
}

fn apply_overrides(settings: &mut Settings, cli: &Cli) {
    for request in [&mut settings.uploader.request, &mut settings.batch.request] {
        if let Some(url) = &cli.url {
            request.url = url.clone();
        }
        if let Some(field) = &cli.field {
            request.field_name = field.clone();
        }
        for (name, value) in &cli.headers {
            request.headers.insert(name.clone(), value.clone());
        }
    }

    for picker in [&mut settings.uploader.picker, &mut settings.batch.picker] {
        if let Some(accept) = &cli.accept {
            picker.accept = accept.clone();
        }
    }

    let uploader = &mut settings.uploader;
    if let Some(max_size) = cli.max_size {
        uploader.max_upload_size = max_size;
    }
    if let Some(max_concurrent) = cli.max_concurrent {
        uploader.max_auto_uploads = max_concurrent;
    }
    if let Some(max_retries) = cli.max_retries {
        uploader.max_retries = max_retries;
    }
    if let Some(delay) = cli.retry_delay_ms {
        uploader.retry_delay_ms = delay;
    }

    if cli.read {
        settings.batch.read = true;
    }
    if let Some(max_files) = cli.max_files {
        settings.batch.max_upload = max_files;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let env_filter = std::env::var_os("RUST_LOG").is_some();

    // Initialize logging before settings load so their warnings are shown
    env_logger::Builder::new()
        .filter_level(LevelFilter::Trace)
        .parse_default_env()
        .init();
    if let Some(level) = effective_level(DEFAULT_LOG_LEVEL, env_filter) {
        log::set_max_level(level);
    }

    let mut settings =
        config::load_settings(cli.config.as_deref()).context("Failed to load settings")?;
    apply_overrides(&mut settings, &cli);
    config::validate_settings(&settings).context("Invalid settings")?;

    if let Some(level) = effective_level(&settings.log_level, env_filter) {
        log::set_max_level(level);
    }

    log::info!("Starting file-uploader");

    if cli.save_config {
        config::save_settings(&settings, cli.config.as_deref())
            .context("Failed to save settings")?;
    }

    let (cancel_tx, cancel_rx) = unbounded_channel();
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C, cancelling uploads...");
        let _ = cancel_tx.send(());
    })
    .context("Error setting Ctrl-C handler")?;

    let failed = if cli.batch {
        run_batch(&settings, &cli.paths, cancel_rx).await?
    } else {
        run_queue(&settings, &cli.paths, cancel_rx).await?
    };

    if failed > 0 {
        anyhow::bail!("{} file(s) were not uploaded", failed);
    }
    Ok(())
}

async fn run_queue(
    settings: &Settings,
    paths: &[PathBuf],
    mut cancel: UnboundedReceiver<()>,
) -> Result<usize> {
    let uploader = Uploader::with_http(settings.uploader.clone(), settings.request_timeout())
        .context("Failed to create uploader")?;

    let failed = Arc::new(AtomicUsize::new(0));
    let failed_counter = Arc::clone(&failed);
    uploader.on_any(move |event| match event {
        UploaderEvent::FileAdded { id, file } => {
            println!("[{}] queued {} ({} bytes)", id, file.name, file.size)
        }
        UploaderEvent::Upload { id, attempt } => println!("[{}] uploading (attempt {})", id, attempt),
        UploaderEvent::Progress { id, sent, total } => {
            log::debug!("[{}] {}/{} bytes sent", id, sent, total)
        }
        UploaderEvent::Retry { id, attempt, reason } => {
            println!("[{}] attempt {} failed, will retry: {}", id, attempt, reason)
        }
        UploaderEvent::Success { id, response } => println!("[{}] done: {}", id, response),
        UploaderEvent::Error { id, reason } => {
            failed_counter.fetch_add(1, Ordering::Relaxed);
            eprintln!("[{}] failed: {}", id, reason);
        }
        UploaderEvent::UploadStarted => log::info!("Uploads started"),
        UploaderEvent::Complete => log::info!("All uploads finished"),
    });

    let mut rejected = 0;
    for (name, result) in uploader.add_paths(paths) {
        if let Err(e) = result {
            eprintln!("{}: {}", name, e);
            rejected += 1;
        }
    }

    if !uploader.config().auto_upload {
        for id in uploader.pending_ids() {
            uploader.upload(id);
        }
    }

    let mut cancelled = 0;
    tokio::select! {
        _ = uploader.wait_until_idle() => {}
        _ = cancel.recv() => {
            cancelled = uploader.cancel_all();
        }
    }

    Ok(failed.load(Ordering::Relaxed) + rejected + cancelled)
}

async fn run_batch(
    settings: &Settings,
    paths: &[PathBuf],
    mut cancel: UnboundedReceiver<()>,
) -> Result<usize> {
    let uploader = BatchUploader::with_http(settings.batch.clone(), settings.request_timeout())
        .context("Failed to create batch uploader")?;

    uploader.on_any(|event| match event {
        BatchEvent::File { index, file } => {
            println!("[{}] uploading {} ({} bytes)", index, file.name, file.size)
        }
        BatchEvent::Progress { index, sent, total } => {
            log::debug!("[{}] {}/{} bytes sent", index, sent, total)
        }
        BatchEvent::Read {
            index, contents, ..
        } => println!("[{}] read {} bytes", index, contents.len()),
        BatchEvent::FileSuccess {
            index, response, ..
        } => println!("[{}] done: {}", index, response),
        BatchEvent::FileError { index, reason, .. } => eprintln!("[{}] failed: {}", index, reason),
        BatchEvent::Success { files } => println!("Batch of {} file(s) uploaded", files.len()),
        BatchEvent::Error { files } => eprintln!("Batch of {} file(s) had failures", files.len()),
    });

    let mut pending = uploader.select_paths(paths);
    if pending.is_empty() {
        log::warn!("No files selected");
    }

    let outcome = tokio::select! {
        outcome = &mut pending => outcome?,
        _ = cancel.recv() => {
            pending.abort();
            pending.await?
        }
    };

    Ok(outcome.failed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_level() {
        assert_eq!(effective_level("debug", false), Some(LevelFilter::Debug));
        assert_eq!(effective_level("ERROR", false), Some(LevelFilter::Error));
        assert_eq!(effective_level("nonsense", false), Some(LevelFilter::Info));
        assert_eq!(effective_level("debug", true), None);
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("X-Token: abc").unwrap(),
            ("X-Token".to_string(), "abc".to_string())
        );
        assert!(parse_header(":abc").is_err());
        assert!(parse_header("no-colon").is_err());
    }
}
