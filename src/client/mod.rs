//! Client uploader
//!
//! Uploads local files to a resumable-upload endpoint in chunks. Each chunk
//! is a PATCH at the server's current offset; transient failures are retried
//! on a fixed delay schedule, re-reading the offset with HEAD before each
//! retry. Finished or abandoned uploads can be resumed by later runs through
//! a [`UrlStorage`].
//!
//! # Example
//!
//! ```no_run
//! use resumable_uploadr::client::{MemoryUrlStorage, TusClient, UploadOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = TusClient::new()?;
//! let storage = MemoryUrlStorage::new();
//! let options = UploadOptions::new("http://localhost:8080/files");
//!
//! let outcome = client
//!     .upload("movie.mp4".as_ref(), &options, &storage, |sent, total| {
//!         println!("{}/{}", sent, total);
//!     })
//!     .await?;
//! println!("Uploaded to {}", outcome.url);
//! # Ok(())
//! # }
//! ```

use crate::router::{OFFSET_OCTET_STREAM, TUS_VERSION};
use crate::session::{Metadata, MetadataError};
use bytes::Bytes;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Response, StatusCode, Url};
use std::future::Future;
use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

pub mod storage;

pub use storage::{fingerprint, FileUrlStorage, MemoryUrlStorage, PreviousUpload, UrlStorage};

/// Default PATCH size
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Default delays between retries, in milliseconds
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 4] = [0, 1000, 3000, 5000];

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Upload no longer exists: {0}")]
    UploadGone(String),

    #[error("Missing response header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid response header {name}: {value}")]
    InvalidHeader { name: &'static str, value: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("Upload state storage error: {0}")]
    Storage(String),

    #[error("Giving up after {attempts} retries: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: Box<ClientError>,
    },
}

impl ClientError {
    /// Connection problems, server errors, offset conflicts and locked uploads
    /// are worth another attempt; any other client error is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request() || e.is_body(),
            ClientError::UnexpectedStatus { status, .. } => {
                *status >= 500 || *status == 409 || *status == 423
            }
            _ => false,
        }
    }
}

/// Server-side view of an upload
#[derive(Debug, Clone, PartialEq)]
pub struct UploadInfo {
    pub offset: u64,
    /// `None` while the length is deferred
    pub length: Option<u64>,
}

/// Settings for [`TusClient::upload`]
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Collection URL uploads are created under
    pub endpoint: String,
    /// Sent on creation; `filename` is filled in from the path when missing
    pub metadata: Metadata,
    pub chunk_size: usize,
    /// One retry per entry; an empty schedule disables retries
    pub retry_delays: Vec<Duration>,
    /// Remember the upload URL so later runs can resume
    pub store_fingerprint: bool,
    /// Forget the upload URL once the upload finished
    pub remove_fingerprint_on_success: bool,
}

impl UploadOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            metadata: Metadata::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry_delays: DEFAULT_RETRY_DELAYS_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            store_fingerprint: true,
            remove_fingerprint_on_success: false,
        }
    }
}

/// Result of a finished upload
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
    pub url: String,
    pub size: u64,
    /// Whether an earlier upload was continued
    pub resumed: bool,
}

/// HTTP client for the resumable upload protocol
#[derive(Clone)]
pub struct TusClient {
    http: reqwest::Client,
    headers: HeaderMap,
}

impl TusClient {
    /// Create a new client
    pub fn new() -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let mut headers = HeaderMap::new();
        headers.insert("Tus-Resumable", HeaderValue::from_static(TUS_VERSION));

        Ok(Self { http, headers })
    }

    /// Send a bearer token with every request
    pub fn with_bearer_token(self, token: &str) -> Result<Self, ClientError> {
        self.with_header("Authorization", &format!("Bearer {}", token))
    }

    /// Send an extra header with every request
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, ClientError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ClientError::InvalidHeader {
                name: "request",
                value: name.to_string(),
            })?;
        let value = HeaderValue::from_str(value).map_err(|_| ClientError::InvalidHeader {
            name: "request",
            value: value.to_string(),
        })?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Create an upload, returning its absolute URL
    #[tracing::instrument(name = "client.create", skip(self, metadata), err)]
    pub async fn create(
        &self,
        endpoint: &str,
        length: Option<u64>,
        metadata: &Metadata,
    ) -> Result<String, ClientError> {
        let mut request = self.http.post(endpoint).headers(self.headers.clone());
        request = match length {
            Some(length) => request.header("Upload-Length", length),
            None => request.header("Upload-Defer-Length", "1"),
        };
        if !metadata.is_empty() {
            request = request.header("Upload-Metadata", metadata.encode());
        }

        let response = request.send().await?;
        self.location(endpoint, expect_status(response, StatusCode::CREATED).await?)
    }

    /// Create a partial upload for later concatenation
    pub async fn create_partial(&self, endpoint: &str, length: u64) -> Result<String, ClientError> {
        let response = self
            .http
            .post(endpoint)
            .headers(self.headers.clone())
            .header("Upload-Length", length)
            .header("Upload-Concat", "partial")
            .send()
            .await?;
        self.location(endpoint, expect_status(response, StatusCode::CREATED).await?)
    }

    /// Create a final upload joining `parts` in order
    pub async fn create_final(
        &self,
        endpoint: &str,
        parts: &[String],
        metadata: &Metadata,
    ) -> Result<String, ClientError> {
        let mut request = self
            .http
            .post(endpoint)
            .headers(self.headers.clone())
            .header("Upload-Concat", format!("final;{}", parts.join(" ")));
        if !metadata.is_empty() {
            request = request.header("Upload-Metadata", metadata.encode());
        }

        let response = request.send().await?;
        self.location(endpoint, expect_status(response, StatusCode::CREATED).await?)
    }

    /// Ask the server for the current offset
    #[tracing::instrument(name = "client.head", skip(self), err)]
    pub async fn head(&self, url: &str) -> Result<UploadInfo, ClientError> {
        let response = self
            .http
            .head(url)
            .headers(self.headers.clone())
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE | StatusCode::FORBIDDEN => {
                return Err(ClientError::UploadGone(url.to_string()))
            }
            _ => {}
        }
        let response = expect_status(response, StatusCode::OK).await?;

        Ok(UploadInfo {
            offset: header_u64(&response, "Upload-Offset")?
                .ok_or(ClientError::MissingHeader("Upload-Offset"))?,
            length: header_u64(&response, "Upload-Length")?,
        })
    }

    /// Send one chunk at `offset`, returning the new offset
    #[tracing::instrument(name = "client.patch", skip(self, chunk), fields(bytes = chunk.len()), err)]
    pub async fn patch(
        &self,
        url: &str,
        offset: u64,
        chunk: Bytes,
        upload_length: Option<u64>,
    ) -> Result<u64, ClientError> {
        let mut request = self
            .http
            .patch(url)
            .headers(self.headers.clone())
            .header("Content-Type", OFFSET_OCTET_STREAM)
            .header("Upload-Offset", offset);
        if let Some(length) = upload_length {
            request = request.header("Upload-Length", length);
        }

        let response = request.body(chunk).send().await?;
        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::GONE) {
            return Err(ClientError::UploadGone(url.to_string()));
        }
        let response = expect_status(response, StatusCode::NO_CONTENT).await?;

        header_u64(&response, "Upload-Offset")?.ok_or(ClientError::MissingHeader("Upload-Offset"))
    }

    /// Merge a final upload whose parts finished after it was created
    pub async fn finalize(&self, url: &str) -> Result<u64, ClientError> {
        let response = self
            .http
            .post(url)
            .headers(self.headers.clone())
            .send()
            .await?;
        let response = expect_status(response, StatusCode::NO_CONTENT).await?;
        header_u64(&response, "Upload-Offset")?.ok_or(ClientError::MissingHeader("Upload-Offset"))
    }

    /// Abort an upload
    pub async fn terminate(&self, url: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(url)
            .headers(self.headers.clone())
            .send()
            .await?;
        expect_status(response, StatusCode::NO_CONTENT).await?;
        Ok(())
    }

    /// Uploads recorded for this file and endpoint, newest first
    pub async fn find_previous_uploads(
        &self,
        storage: &dyn UrlStorage,
        fingerprint: &str,
    ) -> Result<Vec<PreviousUpload>, ClientError> {
        storage.find_uploads(fingerprint).await
    }

    /// Upload a file, resuming an earlier attempt when one is on record.
    ///
    /// `on_progress` receives `(bytes_uploaded, bytes_total)` after each chunk.
    #[tracing::instrument(
        name = "client.upload",
        skip(self, options, storage, on_progress),
        fields(path = %path.display(), endpoint = %options.endpoint),
        err
    )]
    pub async fn upload<P>(
        &self,
        path: &Path,
        options: &UploadOptions,
        storage: &dyn UrlStorage,
        mut on_progress: P,
    ) -> Result<UploadOutcome, ClientError>
    where
        P: FnMut(u64, u64) + Send,
    {
        let mut file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let fingerprint = fingerprint(&name, size, &options.endpoint);

        let mut metadata = options.metadata.clone();
        if !metadata.contains_key("filename") && !name.is_empty() {
            metadata.insert("filename", name.as_bytes())?;
        }

        let (url, mut offset, resumed) = match self
            .resume_previous(storage, &fingerprint, size)
            .await?
        {
            Some((url, offset)) => {
                info!(url = %url, offset, "Resuming previous upload");
                (url, offset, true)
            }
            None => {
                let url = self
                    .with_retries(&options.retry_delays, || {
                        self.create(&options.endpoint, Some(size), &metadata)
                    })
                    .await?;
                if options.store_fingerprint {
                    storage
                        .add_upload(PreviousUpload {
                            fingerprint: fingerprint.clone(),
                            upload_url: url.clone(),
                            size,
                            created_at: Utc::now(),
                        })
                        .await?;
                }
                info!(url = %url, size, "Created upload");
                (url, 0, false)
            }
        };

        on_progress(offset, size);

        let mut attempt = 0;
        while offset < size {
            let chunk = read_chunk(&mut file, offset, options.chunk_size).await?;

            match self.patch(&url, offset, chunk, None).await {
                Ok(new_offset) => {
                    offset = new_offset;
                    attempt = 0;
                    on_progress(offset, size);
                }
                Err(e) if e.is_retryable() => {
                    let Some(delay) = options.retry_delays.get(attempt).copied() else {
                        return Err(ClientError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    };
                    attempt += 1;
                    warn!(attempt, delay_ms = delay.as_millis(), error = %e, "Chunk failed; retrying");
                    tokio::time::sleep(delay).await;

                    // The server may have stored part of the chunk
                    match self.head(&url).await {
                        Ok(info) => offset = info.offset,
                        Err(e) if e.is_retryable() => {
                            debug!(error = %e, "Offset lookup failed; keeping local offset")
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if options.remove_fingerprint_on_success {
            storage.remove_upload(&url).await?;
        }

        info!(url = %url, size, resumed, "Upload finished");
        Ok(UploadOutcome { url, size, resumed })
    }

    /// First recorded upload the server still knows, with its offset
    async fn resume_previous(
        &self,
        storage: &dyn UrlStorage,
        fingerprint: &str,
        size: u64,
    ) -> Result<Option<(String, u64)>, ClientError> {
        for previous in storage.find_uploads(fingerprint).await? {
            match self.head(&previous.upload_url).await {
                Ok(info) if info.length == Some(size) => {
                    return Ok(Some((previous.upload_url, info.offset)))
                }
                Ok(_) | Err(ClientError::UploadGone(_)) => {
                    debug!(url = %previous.upload_url, "Dropping stale previous upload");
                    storage.remove_upload(&previous.upload_url).await?;
                }
                Err(e) => {
                    warn!(url = %previous.upload_url, error = %e, "Could not check previous upload");
                }
            }
        }
        Ok(None)
    }

    async fn with_retries<T, F, Fut>(&self, delays: &[Duration], mut op: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    let Some(delay) = delays.get(attempt).copied() else {
                        return Err(ClientError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    };
                    attempt += 1;
                    warn!(attempt, delay_ms = delay.as_millis(), error = %e, "Request failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolve a `Location` header against the endpoint
    fn location(&self, endpoint: &str, response: Response) -> Result<String, ClientError> {
        let location = response
            .headers()
            .get("Location")
            .ok_or(ClientError::MissingHeader("Location"))?
            .to_str()
            .map_err(|_| ClientError::InvalidHeader {
                name: "Location",
                value: "<binary>".into(),
            })?;

        let base = Url::parse(endpoint).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        base.join(location)
            .map(String::from)
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))
    }
}

async fn expect_status(response: Response, expected: StatusCode) -> Result<Response, ClientError> {
    if response.status() == expected {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::UnexpectedStatus { status, body })
}

fn header_u64(response: &Response, name: &'static str) -> Result<Option<u64>, ClientError> {
    response
        .headers()
        .get(name)
        .map(|value| {
            value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| ClientError::InvalidHeader {
                    name,
                    value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
                })
        })
        .transpose()
}

async fn read_chunk(
    file: &mut tokio::fs::File,
    offset: u64,
    chunk_size: usize,
) -> Result<Bytes, ClientError> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(chunk_size.min(1024 * 1024));
    file.take(chunk_size as u64).read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}
