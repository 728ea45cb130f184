//! JWT Authentication
//!
//! Supports HS256, RS256 and ES256. The owner identity is the `id` claim when
//! present, otherwise `sub`.

use super::{AuthError, AuthRequest, AuthResult, Authenticator};
use crate::metrics;
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// JWT Claims
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    /// Application user id; numeric or string
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    pub exp: usize,
    #[serde(default)]
    pub iat: Option<usize>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<String>,
}

impl Claims {
    /// Identity to record as upload owner
    pub fn identity(&self) -> Option<String> {
        let from_id = match &self.id {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        from_id.or_else(|| self.sub.clone().filter(|s| !s.is_empty()))
    }
}

/// JWT Authenticator
///
/// # Example
///
/// ```
/// use resumable_uploadr::auth::jwt::JwtAuthenticator;
///
/// let auth = JwtAuthenticator::new_hs256("my-secret")
///     .with_issuer("https://auth.example.com")
///     .with_audience("uploads");
/// ```
pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    /// Create a new JWT authenticator with a secret key (HS256)
    pub fn new_hs256(secret: &str) -> Self {
        Self::with_key(
            DecodingKey::from_secret(secret.as_bytes()),
            Algorithm::HS256,
        )
    }

    /// Create a new JWT authenticator with an RSA public key (RS256)
    pub fn new_rs256(public_key_pem: &str) -> Result<Self, AuthError> {
        let key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| AuthError::Config(e.to_string()))?;
        Ok(Self::with_key(key, Algorithm::RS256))
    }

    /// Create a new JWT authenticator with an EC P-256 public key (ES256)
    pub fn new_es256(public_key_pem: &str) -> Result<Self, AuthError> {
        let key = DecodingKey::from_ec_pem(public_key_pem.as_bytes())
            .map_err(|e| AuthError::Config(e.to_string()))?;
        Ok(Self::with_key(key, Algorithm::ES256))
    }

    fn with_key(decoding_key: DecodingKey, algorithm: Algorithm) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        validation.validate_aud = false; // Only validate aud when explicitly set
        Self {
            decoding_key,
            validation,
        }
    }

    /// Require this `iss` claim
    #[must_use]
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    /// Require this `aud` claim
    #[must_use]
    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }

    /// Bearer header first, then a `token` query parameter
    fn extract_token(&self, request: &AuthRequest) -> Option<String> {
        if let Some(auth) = request.headers.get("authorization") {
            if let Some(token) = auth.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }

        request
            .query
            .as_deref()?
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .map(str::to_string)
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    #[tracing::instrument(
        name = "auth.jwt",
        skip(self, request),
        fields(auth.token_present = %self.extract_token(request).is_some()),
        err
    )]
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthResult, AuthError> {
        let token = self.extract_token(request).ok_or(AuthError::MissingAuth)?;

        let token_data = decode::<Claims>(&token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                metrics::record_auth_attempt("jwt", false);
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                    jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                        AuthError::InvalidSignature
                    }
                    _ => AuthError::InvalidToken(e.to_string()),
                }
            })?;

        let subject = token_data
            .claims
            .identity()
            .ok_or(AuthError::MissingIdentity)?;

        let mut claims = HashMap::new();
        if let Some(iss) = &token_data.claims.iss {
            claims.insert("iss".into(), serde_json::Value::String(iss.clone()));
        }
        if let Some(aud) = &token_data.claims.aud {
            claims.insert("aud".into(), serde_json::Value::String(aud.clone()));
        }

        metrics::record_auth_attempt("jwt", true);
        tracing::debug!(subject = %subject, "JWT authentication successful");

        Ok(AuthResult { subject, claims })
    }
}
