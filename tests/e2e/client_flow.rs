//! E2E Client Tests
//!
//! The bundled uploader against a live server: chunking, progress reporting
//! and resuming from a recorded upload URL.

use super::common::E2ETestEnv;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use resumable_uploadr::client::{
    fingerprint, FileUrlStorage, MemoryUrlStorage, PreviousUpload, TusClient, UploadOptions,
    UrlStorage,
};
use resumable_uploadr::session::Metadata;

fn write_source(env: &E2ETestEnv, name: &str, data: &[u8]) -> std::path::PathBuf {
    let path = env.dir.path().join("source").join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, data).unwrap();
    path
}

/// Test: File is sent in chunks with progress after every chunk
#[tokio::test]
async fn test_client_uploads_in_chunks() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");
    let payload = E2ETestEnv::random_payload(5000);
    let source = write_source(&env, "report.pdf", &payload);

    let client = TusClient::new().unwrap();
    let storage = MemoryUrlStorage::new();
    let mut options = UploadOptions::new(env.files_url());
    options.chunk_size = 1024;

    let progress = Mutex::new(Vec::new());
    let outcome = client
        .upload(&source, &options, &storage, |sent, total| {
            progress.lock().push((sent, total));
        })
        .await
        .expect("Upload failed");

    assert_eq!(outcome.size, 5000);
    assert!(!outcome.resumed);
    assert!(outcome.url.starts_with(&env.files_url()));

    let progress = progress.into_inner();
    assert_eq!(progress.first(), Some(&(0, 5000)));
    assert_eq!(progress.last(), Some(&(5000, 5000)));
    assert_eq!(progress.len(), 6);

    // filename is taken from the path
    let stored = std::fs::read(env.completed_dir().join("report.pdf")).unwrap();
    assert_eq!(stored, payload.to_vec());

    // URL is remembered for resuming by default
    assert_eq!(storage.len(), 1);
}

/// Test: A recorded upload is continued from the server's offset
#[tokio::test]
async fn test_client_resumes_previous_upload() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");
    let payload = E2ETestEnv::random_payload(3000);
    let source = write_source(&env, "resume.bin", &payload);

    let client = TusClient::new().unwrap();
    let metadata = Metadata::new().with("filename", "resume.bin").unwrap();
    let url = client
        .create(&env.files_url(), Some(3000), &metadata)
        .await
        .unwrap();
    let offset = client
        .patch(&url, 0, payload.slice(0..1200), None)
        .await
        .unwrap();
    assert_eq!(offset, 1200);

    let storage = MemoryUrlStorage::new();
    storage
        .add_upload(PreviousUpload {
            fingerprint: fingerprint("resume.bin", 3000, &env.files_url()),
            upload_url: url.clone(),
            size: 3000,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let mut first_progress = None;
    let outcome = client
        .upload(&source, &UploadOptions::new(env.files_url()), &storage, |sent, _| {
            first_progress.get_or_insert(sent);
        })
        .await
        .expect("Upload failed");

    assert!(outcome.resumed);
    assert_eq!(outcome.url, url);
    assert_eq!(first_progress, Some(1200));

    let stored = std::fs::read(env.completed_dir().join("resume.bin")).unwrap();
    assert_eq!(stored, payload.to_vec());
}

/// Test: A recorded upload the server no longer knows is replaced
#[tokio::test]
async fn test_client_starts_over_when_previous_upload_gone() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");
    let source = write_source(&env, "fresh.txt", b"fresh");

    let client = TusClient::new().unwrap();
    let gone = env.url_for("/files/0000000000000000000000000000dead");

    let state = env.dir.path().join("state.json");
    let storage = FileUrlStorage::new(&state);
    storage
        .add_upload(PreviousUpload {
            fingerprint: fingerprint("fresh.txt", 5, &env.files_url()),
            upload_url: gone.clone(),
            size: 5,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let outcome = client
        .upload(&source, &UploadOptions::new(env.files_url()), &storage, |_, _| {})
        .await
        .expect("Upload failed");

    assert!(!outcome.resumed);
    assert_ne!(outcome.url, gone);

    let remembered = storage
        .find_uploads(&fingerprint("fresh.txt", 5, &env.files_url()))
        .await
        .unwrap();
    assert_eq!(remembered.len(), 1);
    assert_eq!(remembered[0].upload_url, outcome.url);
}

/// Test: Client-driven concatenation and termination
#[tokio::test]
async fn test_client_concat_and_terminate() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");
    let client = TusClient::new().unwrap();

    let first = client.create_partial(&env.files_url(), 2).await.unwrap();
    let second = client.create_partial(&env.files_url(), 2).await.unwrap();
    client.patch(&first, 0, Bytes::from("ab"), None).await.unwrap();

    let metadata = Metadata::new().with("filename", "parts.txt").unwrap();
    let final_url = client
        .create_final(&env.files_url(), &[first.clone(), second.clone()], &metadata)
        .await
        .unwrap();

    client.patch(&second, 0, Bytes::from("cd"), None).await.unwrap();
    assert_eq!(client.finalize(&final_url).await.unwrap(), 4);

    let stored = std::fs::read(env.completed_dir().join("parts.txt")).unwrap();
    assert_eq!(stored, b"abcd");

    let scratch = client.create_partial(&env.files_url(), 10).await.unwrap();
    client.terminate(&scratch).await.unwrap();
    assert!(client.head(&scratch).await.is_err());
}
