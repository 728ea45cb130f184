//! E2E Error Scenario Tests
//!
//! Protocol violations map to the documented status codes and never corrupt
//! the stored upload.

use super::common::{E2ETestEnv, OFFSET_OCTET_STREAM, TUS_VERSION};

/// Test: Requests without Tus-Resumable are rejected with 412
#[tokio::test]
async fn test_missing_version_header() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");

    let response = env
        .client
        .post(env.files_url())
        .header("Upload-Length", 5)
        .send()
        .await
        .expect("Request failed");

    assert_eq!(response.status(), 412);
    assert_eq!(response.headers()["Tus-Version"], TUS_VERSION);
}

/// Test: Unsupported version is rejected with 412
#[tokio::test]
async fn test_unsupported_version() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");

    let response = env
        .client
        .post(env.files_url())
        .header("Tus-Resumable", "0.2.2")
        .header("Upload-Length", 5)
        .send()
        .await
        .expect("Request failed");

    assert_eq!(response.status(), 412);
}

/// Test: Append with the wrong content type is rejected with 415
#[tokio::test]
async fn test_wrong_content_type() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");
    let location = env.create_location(5, "a.txt").await;

    let response = env
        .client
        .patch(env.url_for(&location))
        .header("Tus-Resumable", TUS_VERSION)
        .header("Content-Type", "application/octet-stream")
        .header("Upload-Offset", 0)
        .body("hello")
        .send()
        .await
        .expect("Request failed");

    assert_eq!(response.status(), 415);
}

/// Test: Unknown uploads are 404
#[tokio::test]
async fn test_unknown_upload() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");

    let response = env
        .head("/files/0000000000000000000000000000dead")
        .await
        .expect("Request failed");
    assert_eq!(response.status(), 404);
}

/// Test: Stale offset is a 409 that reports the server offset
#[tokio::test]
async fn test_offset_mismatch() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");
    let location = env.create_location(10, "a.txt").await;
    env.patch(&location, 0, "abcd").await.expect("Request failed");

    let response = env.patch(&location, 0, "abcd").await.expect("Request failed");
    assert_eq!(response.status(), 409);
    assert_eq!(E2ETestEnv::header_u64(&response, "Upload-Offset"), Some(4));

    let response = env.head(&location).await.expect("Request failed");
    assert_eq!(E2ETestEnv::header_u64(&response, "Upload-Offset"), Some(4));
}

/// Test: Bytes beyond the declared length are refused with 413
#[tokio::test]
async fn test_append_past_declared_length() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");
    let location = env.create_location(3, "a.txt").await;

    let response = env.patch(&location, 0, "abcdef").await.expect("Request failed");
    assert_eq!(response.status(), 413);

    let response = env.head(&location).await.expect("Request failed");
    assert_eq!(E2ETestEnv::header_u64(&response, "Upload-Offset"), Some(0));
}

/// Test: Uploads above the configured maximum are refused at creation
#[tokio::test]
async fn test_create_above_max_size() {
    let env = E2ETestEnv::with_config(|config| config.server.max_size = Some(100))
        .await
        .expect("Failed to create test env");

    let response = env
        .client
        .request(reqwest::Method::OPTIONS, env.files_url())
        .send()
        .await
        .expect("Request failed");
    assert_eq!(E2ETestEnv::header_u64(&response, "Tus-Max-Size"), Some(100));

    let response = env.create(101, "big.bin").await.expect("Request failed");
    assert_eq!(response.status(), 413);
}

/// Test: Creation without a filename is a 400
#[tokio::test]
async fn test_missing_filename() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");

    let response = env
        .client
        .post(env.files_url())
        .header("Tus-Resumable", TUS_VERSION)
        .header("Upload-Length", 5)
        .header("Upload-Metadata", E2ETestEnv::metadata(&[("filetype", "text/plain")]))
        .send()
        .await
        .expect("Request failed");

    assert_eq!(response.status(), 400);
}

/// Test: Creation without any length is a 400
#[tokio::test]
async fn test_missing_length() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");

    let response = env
        .client
        .post(env.files_url())
        .header("Tus-Resumable", TUS_VERSION)
        .header("Upload-Metadata", E2ETestEnv::metadata(&[("filename", "a.txt")]))
        .send()
        .await
        .expect("Request failed");

    assert_eq!(response.status(), 400);
}

/// Test: Malformed metadata is a 400
#[tokio::test]
async fn test_malformed_metadata() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");

    let response = env
        .client
        .post(env.files_url())
        .header("Tus-Resumable", TUS_VERSION)
        .header("Upload-Length", 5)
        .header("Upload-Metadata", "filename !!!notbase64")
        .send()
        .await
        .expect("Request failed");

    assert_eq!(response.status(), 400);
}

/// Test: GET on an upload is not part of the protocol
#[tokio::test]
async fn test_get_not_allowed() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");
    let location = env.create_location(5, "a.txt").await;

    let response = env
        .client
        .get(env.url_for(&location))
        .header("Tus-Resumable", TUS_VERSION)
        .send()
        .await
        .expect("Request failed");

    assert_eq!(response.status(), 405);
}

/// Test: Negative offsets are rejected
#[tokio::test]
async fn test_negative_offset() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");
    let location = env.create_location(5, "a.txt").await;

    let response = env
        .client
        .patch(env.url_for(&location))
        .header("Tus-Resumable", TUS_VERSION)
        .header("Content-Type", OFFSET_OCTET_STREAM)
        .header("Upload-Offset", "-1")
        .body("a")
        .send()
        .await
        .expect("Request failed");

    assert_eq!(response.status(), 400);
}

/// Test: Uploads pointing at an unknown entity fail completion but keep bytes
#[tokio::test]
async fn test_unknown_entity_keeps_upload() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");

    let response = env
        .client
        .post(env.files_url())
        .header("Tus-Resumable", TUS_VERSION)
        .header("Upload-Length", 3)
        .header(
            "Upload-Metadata",
            E2ETestEnv::metadata(&[
                ("filename", "a.txt"),
                ("postid", "5f0e3a52-2c4e-4a0e-9d8f-6f2a1c2b3d4e"),
            ]),
        )
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), 201);
    let location = E2ETestEnv::location(&response);

    // Bytes are durable; processing failed and is left for reconciliation
    let response = env.patch(&location, 0, "abc").await.expect("Request failed");
    assert_eq!(response.status(), 204);
    assert_eq!(E2ETestEnv::header_u64(&response, "Upload-Offset"), Some(3));

    let response = env.head(&location).await.expect("Request failed");
    assert_eq!(response.status(), 200);
    assert!(env.records().await.is_empty());
}
