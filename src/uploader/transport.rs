use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{multipart, Body, Client};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RequestConfig;
use crate::errors::{UploadError, UploadResult};
use crate::file::FileHandle;
use crate::security::InputValidator;

/// Size of the body chunks handed to the connection; progress is reported per chunk.
const PROGRESS_CHUNK_BYTES: usize = 64 * 1024;

/// Called with `(bytes_sent, bytes_total)` while a body is being sent.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

pub fn no_progress() -> ProgressCallback {
    Arc::new(|_, _| {})
}

/// Everything needed to post one file, built once and reused across retries.
#[derive(Debug, Clone)]
pub struct UploadPayload {
    pub url: String,
    pub field_name: String,
    pub headers: BTreeMap<String, String>,
    pub file_name: String,
    pub mime_type: String,
    pub data: Arc<Vec<u8>>,
}

impl UploadPayload {
    pub async fn prepare(request: &RequestConfig, file: &FileHandle) -> UploadResult<Self> {
        let data = file.read().await?;
        Ok(Self {
            url: request.url.clone(),
            field_name: request.field_name.clone(),
            headers: request.headers.clone(),
            file_name: InputValidator::sanitize_filename(file.name()),
            mime_type: file.mime_type().to_string(),
            data,
        })
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn header_map(&self) -> UploadResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| UploadError::invalid_header(name))?;
            let header_value =
                HeaderValue::from_str(value).map_err(|_| UploadError::invalid_header(name))?;
            headers.insert(header_name, header_value);
        }
        Ok(headers)
    }

    /// Build the multipart form, streaming the file so progress can be observed.
    pub fn build_form(&self, on_progress: ProgressCallback) -> UploadResult<multipart::Form> {
        let total = self.len();
        let chunks: Vec<Vec<u8>> = self
            .data
            .chunks(PROGRESS_CHUNK_BYTES)
            .map(|chunk| chunk.to_vec())
            .collect();

        let mut sent = 0u64;
        let stream = futures::stream::iter(chunks.into_iter().map(move |chunk| {
            sent += chunk.len() as u64;
            on_progress(sent, total);
            Ok::<_, std::io::Error>(chunk)
        }));

        let part = multipart::Part::stream_with_length(Body::wrap_stream(stream), total)
            .file_name(self.file_name.clone())
            .mime_str(&self.mime_type)?;

        Ok(multipart::Form::new().part(self.field_name.clone(), part))
    }
}

/// Sends one prepared payload and yields the server's decoded response.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(
        &self,
        payload: Arc<UploadPayload>,
        on_progress: ProgressCallback,
    ) -> UploadResult<serde_json::Value>;
}

/// `multipart/form-data` POST over reqwest.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> UploadResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        payload: Arc<UploadPayload>,
        on_progress: ProgressCallback,
    ) -> UploadResult<serde_json::Value> {
        let form = payload.build_form(on_progress)?;
        let headers = payload.header_map()?;

        log::debug!(
            "POST {} ({} bytes as '{}')",
            payload.url,
            payload.len(),
            payload.field_name
        );

        let response = self
            .client
            .post(&payload.url)
            .headers(headers)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            log::warn!(
                "Upload of {} rejected with {}: {}",
                payload.file_name,
                status,
                body.chars().take(300).collect::<String>()
            );
            return Err(UploadError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(decode_response(&body))
    }
}

/// Decode a response body: JSON when it parses, `null` when empty, a JSON string otherwise.
pub fn decode_response(body: &str) -> serde_json::Value {
    if body.trim().is_empty() {
        return serde_json::Value::Null;
    }

    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(json) => json,
        Err(e) => {
            log::debug!("Response is not JSON ({}), forwarding as text", e);
            serde_json::Value::String(body.to_string())
        }
    }
}
