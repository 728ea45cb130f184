//! Authentication module
//!
//! Resolves the optional owner identity of a request from a JWT bearer token.
//! Uploads stay anonymous unless `auth.required` is set.

use crate::config::AuthConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub mod jwt;

pub use jwt::JwtAuthenticator;

/// Authentication errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Token carries no identity claim")]
    MissingIdentity,

    #[error("Authentication misconfigured: {0}")]
    Config(String),
}

/// Authentication result containing claims
#[derive(Debug, Clone)]
pub struct AuthResult {
    /// Identity recorded as the upload owner
    pub subject: String,
    pub claims: HashMap<String, serde_json::Value>,
}

/// Authenticator trait
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate a request
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthResult, AuthError>;
}

/// Authentication request context
#[derive(Debug)]
pub struct AuthRequest {
    /// Header names are lowercase
    pub headers: HashMap<String, String>,
    pub query: Option<String>,
    pub method: String,
    pub path: String,
}

/// Build the configured authenticator, or `None` when auth is disabled
pub fn from_config(config: &AuthConfig) -> Result<Option<Arc<dyn Authenticator>>, AuthError> {
    if !config.enabled {
        return Ok(None);
    }

    let jwt = config
        .jwt
        .as_ref()
        .ok_or_else(|| AuthError::Config("auth enabled without a jwt section".into()))?;
    let secret = jwt
        .secret
        .as_deref()
        .ok_or_else(|| AuthError::Config("jwt.secret is not set".into()))?;

    let mut authenticator = match jwt.algorithm.to_uppercase().as_str() {
        "HS256" => JwtAuthenticator::new_hs256(secret),
        "RS256" => JwtAuthenticator::new_rs256(secret)?,
        "ES256" => JwtAuthenticator::new_es256(secret)?,
        other => {
            return Err(AuthError::Config(format!(
                "unsupported JWT algorithm {}",
                other
            )))
        }
    };
    if let Some(issuer) = &jwt.issuer {
        authenticator = authenticator.with_issuer(issuer);
    }
    if let Some(audience) = &jwt.audience {
        authenticator = authenticator.with_audience(audience);
    }

    Ok(Some(Arc::new(authenticator)))
}
