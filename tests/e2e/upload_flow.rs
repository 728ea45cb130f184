//! E2E Upload Flow Tests
//!
//! Happy paths through the protocol: create, append in chunks, query the
//! offset, and find the finished file filed with a record.

use super::common::{E2ETestEnv, OFFSET_OCTET_STREAM, TUS_VERSION};

/// Test: OPTIONS advertises version and extensions without a version header
#[tokio::test]
async fn test_options_advertises_protocol() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");

    let response = env
        .client
        .request(reqwest::Method::OPTIONS, env.files_url())
        .send()
        .await
        .expect("Request failed");

    assert_eq!(response.status(), 204);
    assert_eq!(response.headers()["Tus-Version"], TUS_VERSION);
    let extensions = response.headers()["Tus-Extension"].to_str().unwrap();
    for extension in ["creation", "creation-defer-length", "termination", "concatenation"] {
        assert!(extensions.split(',').any(|e| e == extension), "missing {}", extension);
    }
}

/// Test: Chunked upload lands in the completed folder with a record
///
/// 1. Create an 11 byte upload
/// 2. Append 6 bytes, then check the offset with HEAD
/// 3. Append the remaining 5 bytes
/// 4. The file and its record exist
#[tokio::test]
async fn test_chunked_upload_completes() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");

    let response = env.create(11, "hello.txt").await.expect("Request failed");
    assert_eq!(response.status(), 201);
    assert_eq!(response.headers()["Tus-Resumable"], TUS_VERSION);
    assert!(response.headers().contains_key("Upload-Expires"));
    let location = E2ETestEnv::location(&response);
    assert!(location.starts_with("/files/"), "unexpected location {}", location);

    let response = env.patch(&location, 0, "hello ").await.expect("Request failed");
    assert_eq!(response.status(), 204);
    assert_eq!(E2ETestEnv::header_u64(&response, "Upload-Offset"), Some(6));

    let response = env.head(&location).await.expect("Request failed");
    assert_eq!(response.status(), 200);
    assert_eq!(E2ETestEnv::header_u64(&response, "Upload-Offset"), Some(6));
    assert_eq!(E2ETestEnv::header_u64(&response, "Upload-Length"), Some(11));
    assert_eq!(response.headers()["Cache-Control"], "no-store");

    let response = env.patch(&location, 6, "world").await.expect("Request failed");
    assert_eq!(response.status(), 204);
    assert_eq!(E2ETestEnv::header_u64(&response, "Upload-Offset"), Some(11));

    let stored = std::fs::read(env.completed_dir().join("hello.txt")).unwrap();
    assert_eq!(stored, b"hello world");

    let records = env.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].file_name, "hello.txt");
    assert_eq!(records[0].size, 11);
    assert_eq!(records[0].url, "/CompletedFiles/hello.txt");
    assert!(records[0].uploaded_by.is_none());
}

/// Test: Upload 1MB file in 256KB chunks
#[tokio::test]
async fn test_upload_1mb_in_chunks() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");
    let payload = E2ETestEnv::random_payload(1024 * 1024);
    let location = env.create_location(payload.len() as u64, "big.bin").await;

    let mut offset = 0u64;
    for chunk in payload.chunks(256 * 1024) {
        let response = env
            .patch(&location, offset, bytes::Bytes::copy_from_slice(chunk))
            .await
            .expect("Request failed");
        assert_eq!(response.status(), 204);
        offset = E2ETestEnv::header_u64(&response, "Upload-Offset").unwrap();
    }

    assert_eq!(offset, payload.len() as u64);
    let stored = std::fs::read(env.completed_dir().join("big.bin")).unwrap();
    assert_eq!(stored, payload.to_vec());
}

/// Test: Length may be declared on a later append
#[tokio::test]
async fn test_deferred_length() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");

    let response = env
        .client
        .post(env.files_url())
        .header("Tus-Resumable", TUS_VERSION)
        .header("Upload-Defer-Length", "1")
        .header("Upload-Metadata", E2ETestEnv::metadata(&[("filename", "later.txt")]))
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), 201);
    let location = E2ETestEnv::location(&response);

    let response = env.head(&location).await.expect("Request failed");
    assert_eq!(response.headers()["Upload-Defer-Length"], "1");
    assert!(!response.headers().contains_key("Upload-Length"));

    let response = env.patch(&location, 0, "abc").await.expect("Request failed");
    assert_eq!(response.status(), 204);

    let response = env
        .client
        .patch(env.url_for(&location))
        .header("Tus-Resumable", TUS_VERSION)
        .header("Content-Type", OFFSET_OCTET_STREAM)
        .header("Upload-Offset", 3)
        .header("Upload-Length", 5)
        .body("de")
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), 204);
    assert_eq!(E2ETestEnv::header_u64(&response, "Upload-Offset"), Some(5));

    let stored = std::fs::read(env.completed_dir().join("later.txt")).unwrap();
    assert_eq!(stored, b"abcde");
}

/// Test: Creation request may carry the first chunk
#[tokio::test]
async fn test_creation_with_upload() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");

    let response = env
        .client
        .post(env.files_url())
        .header("Tus-Resumable", TUS_VERSION)
        .header("Upload-Length", 10)
        .header("Upload-Metadata", E2ETestEnv::metadata(&[("filename", "first.bin")]))
        .header("Content-Type", OFFSET_OCTET_STREAM)
        .body("0123")
        .send()
        .await
        .expect("Request failed");

    assert_eq!(response.status(), 201);
    assert_eq!(E2ETestEnv::header_u64(&response, "Upload-Offset"), Some(4));

    let location = E2ETestEnv::location(&response);
    let response = env.patch(&location, 4, "456789").await.expect("Request failed");
    assert_eq!(E2ETestEnv::header_u64(&response, "Upload-Offset"), Some(10));
}

/// Test: Zero-length uploads complete on creation
#[tokio::test]
async fn test_zero_length_upload() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");

    let response = env.create(0, "empty.txt").await.expect("Request failed");
    assert_eq!(response.status(), 201);

    let stored = std::fs::read(env.completed_dir().join("empty.txt")).unwrap();
    assert!(stored.is_empty());
}

/// Test: Same file name twice gets a numbered second copy
#[tokio::test]
async fn test_name_collision_gets_suffix() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");

    for body in ["first", "second", "third"] {
        let location = env.create_location(body.len() as u64, "movie.mp4").await;
        let response = env.patch(&location, 0, body).await.expect("Request failed");
        assert_eq!(response.status(), 204);
    }

    let dir = env.completed_dir();
    assert_eq!(std::fs::read(dir.join("movie.mp4")).unwrap(), b"first");
    assert_eq!(std::fs::read(dir.join("movie-1.mp4")).unwrap(), b"second");
    assert_eq!(std::fs::read(dir.join("movie-2.mp4")).unwrap(), b"third");

    let mut names: Vec<_> = env.records().await.into_iter().map(|r| r.file_name).collect();
    names.sort();
    assert_eq!(names, vec!["movie-1.mp4", "movie-2.mp4", "movie.mp4"]);
}

/// Test: DELETE discards the upload
#[tokio::test]
async fn test_termination() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");
    let location = env.create_location(10, "gone.txt").await;
    env.patch(&location, 0, "abc").await.expect("Request failed");

    let response = env
        .client
        .delete(env.url_for(&location))
        .header("Tus-Resumable", TUS_VERSION)
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), 204);

    let response = env.head(&location).await.expect("Request failed");
    assert_eq!(response.status(), 404);

    let response = env.patch(&location, 3, "def").await.expect("Request failed");
    assert_eq!(response.status(), 404);
}

/// Test: X-HTTP-Method-Override turns a POST into a PATCH
#[tokio::test]
async fn test_method_override() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");
    let location = env.create_location(3, "override.txt").await;

    let response = env
        .client
        .post(env.url_for(&location))
        .header("X-HTTP-Method-Override", "PATCH")
        .header("Tus-Resumable", TUS_VERSION)
        .header("Content-Type", OFFSET_OCTET_STREAM)
        .header("Upload-Offset", 0)
        .body("abc")
        .send()
        .await
        .expect("Request failed");

    assert_eq!(response.status(), 204);
    assert_eq!(E2ETestEnv::header_u64(&response, "Upload-Offset"), Some(3));
}

/// Test: Health endpoint needs no protocol headers
#[tokio::test]
async fn test_health() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");
    let response = env
        .client
        .get(format!("{}/health", env.base_url()))
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");
}

/// Test: Metrics are exposed in Prometheus text format
#[tokio::test]
async fn test_metrics_endpoint() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");
    env.create_location(4, "m.txt").await;

    let response = env
        .client
        .get(format!("{}/metrics", env.base_url()))
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("resumable_requests_total"));
}
