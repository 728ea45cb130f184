//! Common E2E Test Infrastructure
//!
//! Provides shared utilities for E2E tests:
//! - Test server management
//! - Protocol request helpers
//! - JWT token generation
//! - Test data generation

use bytes::Bytes;
use resumable_uploadr::completion::CompletionRecord;
use resumable_uploadr::config::Config;
use resumable_uploadr::persistence::{RecordStore, SqliteRecordStore};
use resumable_uploadr::server::Server;
use resumable_uploadr::session::Metadata;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;

/// JWT secret for test tokens
pub const JWT_SECRET: &str = "e2e-test-secret-key-for-jwt-tokens";

pub const TUS_VERSION: &str = "1.0.0";
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// E2E Test Environment
///
/// Owns a running server and the temporary directory behind it. The server
/// is shut down when the environment is dropped.
pub struct E2ETestEnv {
    pub server_addr: SocketAddr,
    pub client: reqwest::Client,
    pub dir: TempDir,
    shutdown: Option<oneshot::Sender<()>>,
    _server_handle: tokio::task::JoinHandle<()>,
}

impl E2ETestEnv {
    /// Create a new E2E test environment with a running server
    pub async fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_config(|_| {}).await
    }

    /// Create a new E2E test environment, adjusting the default config first
    pub async fn with_config(
        customize: impl FnOnce(&mut Config),
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let mut config = Self::default_config(&dir);
        customize(&mut config);

        let server = Server::new(config).await?;
        let server_addr = server.local_addr();

        let (tx, rx) = oneshot::channel::<()>();
        let server_handle = tokio::spawn(async move {
            let _ = server
                .run_until(async {
                    let _ = rx.await;
                })
                .await;
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            server_addr,
            client,
            dir,
            shutdown: Some(tx),
            _server_handle: server_handle,
        })
    }

    /// Default test configuration rooted in `dir`
    pub fn default_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.server.address = "127.0.0.1:0".into();
        config.store.directory = dir.path().join("tusfiles");
        config.completion.completed_dir = dir.path().join("data");
        config.completion.database = dir.path().join("uploads.db");
        config
    }

    /// Get the base URL for the test server
    pub fn base_url(&self) -> String {
        format!("http://{}", self.server_addr)
    }

    /// Upload collection URL
    pub fn files_url(&self) -> String {
        format!("{}/files", self.base_url())
    }

    /// Absolute URL for a `Location` header value
    pub fn url_for(&self, location: &str) -> String {
        format!("{}{}", self.base_url(), location)
    }

    /// Folder that uploads without an owning entity land in
    pub fn completed_dir(&self) -> PathBuf {
        self.dir.path().join("data").join("CompletedFiles")
    }

    /// Completion records written so far
    pub async fn records(&self) -> Vec<CompletionRecord> {
        let store = SqliteRecordStore::open(self.dir.path().join("uploads.db"))
            .expect("Failed to open record database");
        store.list_records(None).await.expect("Failed to list records")
    }

    /// Create an upload of `length` bytes named `filename`
    pub async fn create(
        &self,
        length: u64,
        filename: &str,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .post(self.files_url())
            .header("Tus-Resumable", TUS_VERSION)
            .header("Upload-Length", length)
            .header("Upload-Metadata", Self::metadata(&[("filename", filename)]))
            .send()
            .await
    }

    /// Create an upload and return its `Location`
    pub async fn create_location(&self, length: u64, filename: &str) -> String {
        let response = self.create(length, filename).await.expect("Request failed");
        assert_eq!(response.status(), 201, "create should succeed");
        Self::location(&response)
    }

    /// Append `body` at `offset`
    pub async fn patch(
        &self,
        location: &str,
        offset: u64,
        body: impl Into<Bytes>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let body: Bytes = body.into();
        self.client
            .patch(self.url_for(location))
            .header("Tus-Resumable", TUS_VERSION)
            .header("Content-Type", OFFSET_OCTET_STREAM)
            .header("Upload-Offset", offset)
            .body(body)
            .send()
            .await
    }

    pub async fn head(&self, location: &str) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .head(self.url_for(location))
            .header("Tus-Resumable", TUS_VERSION)
            .send()
            .await
    }

    /// `Location` header of a creation response
    pub fn location(response: &reqwest::Response) -> String {
        response
            .headers()
            .get("Location")
            .expect("Location header missing")
            .to_str()
            .unwrap()
            .to_string()
    }

    /// Numeric response header
    pub fn header_u64(response: &reqwest::Response, name: &str) -> Option<u64> {
        response
            .headers()
            .get(name)
            .map(|v| v.to_str().unwrap().parse().unwrap())
    }

    /// Encode an `Upload-Metadata` header
    pub fn metadata(pairs: &[(&str, &str)]) -> String {
        pairs
            .iter()
            .fold(Metadata::new(), |m, (k, v)| m.with(k, v.as_bytes()).unwrap())
            .encode()
    }

    /// Generate a random test payload
    pub fn random_payload(size: usize) -> Bytes {
        use rand::Rng;
        let mut rng = rand::rng();
        let data: Vec<u8> = (0..size).map(|_| rng.random()).collect();
        Bytes::from(data)
    }

    /// Generate a JWT carrying `id` as the identity claim
    pub fn generate_test_jwt(id: &str, expires_in_secs: i64) -> String {
        use jsonwebtoken::{encode, EncodingKey, Header};
        use serde::Serialize;

        #[derive(Serialize)]
        struct Claims {
            id: String,
            exp: i64,
            iat: i64,
        }

        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            id: id.to_string(),
            exp: now + expires_in_secs,
            iat: now,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .expect("Failed to generate JWT")
    }
}

impl Drop for E2ETestEnv {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
