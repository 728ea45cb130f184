//! E2E Concatenation Tests
//!
//! Partial uploads are sent independently and joined into a final upload in
//! the order the final upload lists them.

use super::common::{E2ETestEnv, TUS_VERSION};

async fn create_partial(env: &E2ETestEnv, length: u64) -> String {
    let response = env
        .client
        .post(env.files_url())
        .header("Tus-Resumable", TUS_VERSION)
        .header("Upload-Length", length)
        .header("Upload-Concat", "partial")
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), 201);
    E2ETestEnv::location(&response)
}

async fn create_final(env: &E2ETestEnv, parts: &[&str], filename: &str) -> reqwest::Response {
    env.client
        .post(env.files_url())
        .header("Tus-Resumable", TUS_VERSION)
        .header("Upload-Concat", format!("final;{}", parts.join(" ")))
        .header("Upload-Metadata", E2ETestEnv::metadata(&[("filename", filename)]))
        .send()
        .await
        .expect("Request failed")
}

/// Test: Finished partials are merged in declared order on creation
#[tokio::test]
async fn test_final_upload_merges_in_order() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");

    let first = create_partial(&env, 6).await;
    let second = create_partial(&env, 5).await;

    // Send the second part first; order comes from the final upload
    env.patch(&second, 0, "world").await.expect("Request failed");
    env.patch(&first, 0, "hello ").await.expect("Request failed");

    // Partial uploads are never filed on their own
    assert!(env.records().await.is_empty());

    let response = create_final(&env, &[&first, &second], "joined.txt").await;
    assert_eq!(response.status(), 201);
    let location = E2ETestEnv::location(&response);

    let stored = std::fs::read(env.completed_dir().join("joined.txt")).unwrap();
    assert_eq!(stored, b"hello world");

    let response = env.head(&location).await.expect("Request failed");
    assert_eq!(E2ETestEnv::header_u64(&response, "Upload-Offset"), Some(11));
    let concat = response.headers()["Upload-Concat"].to_str().unwrap();
    assert_eq!(concat, format!("final;{} {}", first, second));

    let response = env.head(&first).await.expect("Request failed");
    assert_eq!(response.headers()["Upload-Concat"], "partial");
}

/// Test: Final upload created before its parts finish is merged on request
#[tokio::test]
async fn test_unfinished_concatenation() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");

    let first = create_partial(&env, 3).await;
    let second = create_partial(&env, 3).await;
    env.patch(&first, 0, "abc").await.expect("Request failed");

    let response = create_final(&env, &[&first, &second], "late.txt").await;
    assert_eq!(response.status(), 201);
    let location = E2ETestEnv::location(&response);

    // No meaningful offset until merged
    let response = env.head(&location).await.expect("Request failed");
    assert_eq!(response.status(), 200);
    assert!(!response.headers().contains_key("Upload-Offset"));

    let finalize = || {
        env.client
            .post(env.url_for(&location))
            .header("Tus-Resumable", TUS_VERSION)
            .send()
    };

    let response = finalize().await.expect("Request failed");
    assert_eq!(response.status(), 409);

    env.patch(&second, 0, "def").await.expect("Request failed");

    let response = finalize().await.expect("Request failed");
    assert_eq!(response.status(), 204);
    assert_eq!(E2ETestEnv::header_u64(&response, "Upload-Offset"), Some(6));

    let stored = std::fs::read(env.completed_dir().join("late.txt")).unwrap();
    assert_eq!(stored, b"abcdef");
    assert_eq!(env.records().await.len(), 1);
}

/// Test: Final uploads cannot be appended to
#[tokio::test]
async fn test_patch_on_final_forbidden() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");

    let part = create_partial(&env, 2).await;
    let response = create_final(&env, &[&part], "f.txt").await;
    let location = E2ETestEnv::location(&response);

    let response = env.patch(&location, 0, "ab").await.expect("Request failed");
    assert_eq!(response.status(), 403);
}

/// Test: Only partial uploads may be concatenated
#[tokio::test]
async fn test_final_with_regular_upload_rejected() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");

    let regular = env.create_location(3, "plain.txt").await;
    let response = create_final(&env, &[&regular], "f.txt").await;
    assert_eq!(response.status(), 400);

    let response = create_final(&env, &["/files/0000000000000000000000000000beef"], "f.txt").await;
    assert_eq!(response.status(), 400);
}
