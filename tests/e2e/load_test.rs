//! E2E Load Tests
//!
//! Many uploads in flight at once, and racing appends on a single upload.

use super::common::E2ETestEnv;
use std::sync::Arc;

/// Test: Concurrent uploads all complete with distinct files
#[tokio::test]
async fn test_concurrent_uploads() {
    let env = Arc::new(E2ETestEnv::new().await.expect("Failed to create test env"));
    let uploads = 20;

    let mut handles = Vec::new();
    for i in 0..uploads {
        let env = Arc::clone(&env);
        handles.push(tokio::spawn(async move {
            let payload = E2ETestEnv::random_payload(64 * 1024);
            let location = env
                .create_location(payload.len() as u64, &format!("file-{}.bin", i))
                .await;

            let mut offset = 0u64;
            for chunk in payload.chunks(16 * 1024) {
                let response = env
                    .patch(&location, offset, bytes::Bytes::copy_from_slice(chunk))
                    .await
                    .expect("Request failed");
                assert_eq!(response.status(), 204);
                offset = E2ETestEnv::header_u64(&response, "Upload-Offset").unwrap();
            }
            payload
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let payload = handle.await.unwrap();
        let stored = std::fs::read(env.completed_dir().join(format!("file-{}.bin", i))).unwrap();
        assert_eq!(stored, payload.to_vec());
    }

    assert_eq!(env.records().await.len(), uploads);
}

/// Test: Racing appends at the same offset; exactly one wins
#[tokio::test]
async fn test_racing_appends_single_winner() {
    let env = E2ETestEnv::new().await.expect("Failed to create test env");
    let location = env.create_location(8, "race.bin").await;

    let (a, b) = tokio::join!(
        env.patch(&location, 0, "aaaa"),
        env.patch(&location, 0, "bbbb")
    );
    let mut statuses = vec![a.unwrap().status().as_u16(), b.unwrap().status().as_u16()];
    statuses.sort();
    assert_eq!(statuses, vec![204, 409]);

    let response = env.head(&location).await.expect("Request failed");
    assert_eq!(E2ETestEnv::header_u64(&response, "Upload-Offset"), Some(4));
}
