//! E2E Authentication Tests
//!
//! With JWT auth enabled the `id` claim of the token becomes the owner of
//! the upload and is stored on its completion record.

use super::common::{E2ETestEnv, JWT_SECRET, TUS_VERSION};
use resumable_uploadr::config::{AuthConfig, JwtConfig};

fn jwt_auth(required: bool) -> AuthConfig {
    AuthConfig {
        enabled: true,
        required,
        jwt: Some(JwtConfig {
            secret: Some(JWT_SECRET.to_string()),
            algorithm: "HS256".to_string(),
            issuer: None,
            audience: None,
        }),
    }
}

async fn create_with_token(env: &E2ETestEnv, token: Option<&str>) -> reqwest::Response {
    let mut request = env
        .client
        .post(env.files_url())
        .header("Tus-Resumable", TUS_VERSION)
        .header("Upload-Length", 2)
        .header("Upload-Metadata", E2ETestEnv::metadata(&[("filename", "owned.txt")]));
    if let Some(token) = token {
        request = request.header("Authorization", format!("Bearer {}", token));
    }
    request.send().await.expect("Request failed")
}

/// Test: Token identity is recorded as the uploader
#[tokio::test]
async fn test_owner_recorded_from_token() {
    let env = E2ETestEnv::with_config(|config| config.auth = jwt_auth(true))
        .await
        .expect("Failed to create test env");

    let token = E2ETestEnv::generate_test_jwt("user-42", 3600);
    let response = create_with_token(&env, Some(&token)).await;
    assert_eq!(response.status(), 201);
    let location = E2ETestEnv::location(&response);

    let response = env
        .client
        .patch(env.url_for(&location))
        .header("Tus-Resumable", TUS_VERSION)
        .header("Content-Type", "application/offset+octet-stream")
        .header("Upload-Offset", 0)
        .header("Authorization", format!("Bearer {}", token))
        .body("ok")
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), 204);

    let records = env.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].uploaded_by.as_deref(), Some("user-42"));
}

/// Test: Missing token is a 401 when auth is required
#[tokio::test]
async fn test_missing_token_rejected_when_required() {
    let env = E2ETestEnv::with_config(|config| config.auth = jwt_auth(true))
        .await
        .expect("Failed to create test env");

    let response = create_with_token(&env, None).await;
    assert_eq!(response.status(), 401);
    assert!(response.headers().contains_key("WWW-Authenticate"));
}

/// Test: Missing token is anonymous when auth is optional
#[tokio::test]
async fn test_missing_token_allowed_when_optional() {
    let env = E2ETestEnv::with_config(|config| config.auth = jwt_auth(false))
        .await
        .expect("Failed to create test env");

    let response = create_with_token(&env, None).await;
    assert_eq!(response.status(), 201);
}

/// Test: Expired and forged tokens are rejected even when auth is optional
#[tokio::test]
async fn test_bad_tokens_rejected() {
    let env = E2ETestEnv::with_config(|config| config.auth = jwt_auth(false))
        .await
        .expect("Failed to create test env");

    let expired = E2ETestEnv::generate_test_jwt("user-42", -3600);
    let response = create_with_token(&env, Some(&expired)).await;
    assert_eq!(response.status(), 401);

    let response = create_with_token(&env, Some("not.a.jwt")).await;
    assert_eq!(response.status(), 401);
}

/// Test: OPTIONS and health stay public
#[tokio::test]
async fn test_public_endpoints_need_no_token() {
    let env = E2ETestEnv::with_config(|config| config.auth = jwt_auth(true))
        .await
        .expect("Failed to create test env");

    let response = env
        .client
        .request(reqwest::Method::OPTIONS, env.files_url())
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), 204);

    let response = env
        .client
        .get(format!("{}/health", env.base_url()))
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), 200);
}
