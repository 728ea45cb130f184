//! Configuration module for Resumable Uploadr
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.

use crate::completion::folder::FolderDispatcherConfig;
use crate::session::SessionPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("MY_VAR", "value");
/// let result = expand_env_vars("prefix-${MY_VAR}-suffix");
/// assert_eq!(result, "prefix-value-suffix");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex_lite::Regex =
            regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
                .expect("env var pattern is valid");
    }

    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in ENV_VAR.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = &self.server.base_path;
        if !base.starts_with('/') || (base.len() > 1 && base.ends_with('/')) {
            return Err(ConfigError::ValidationError(format!(
                "base_path '{}' must start with '/' and not end with one",
                base
            )));
        }

        if self.server.write_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "write_buffer_size must be greater than zero".into(),
            ));
        }

        if self.server.max_size == Some(0) {
            return Err(ConfigError::ValidationError(
                "max_size must be greater than zero when set".into(),
            ));
        }

        if self.store.io_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "io_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.store.expiration_seconds == 0 || self.store.sweep_interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "expiration_seconds and sweep_interval_seconds must be greater than zero".into(),
            ));
        }

        if self.completion.filename_key.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "filename_key cannot be empty".into(),
            ));
        }

        if self.completion.max_collision_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "max_collision_attempts must be greater than zero".into(),
            ));
        }

        if self.auth.enabled {
            let jwt = self.auth.jwt.as_ref().ok_or_else(|| {
                ConfigError::ValidationError("auth is enabled but no jwt section is set".into())
            })?;
            if jwt.secret.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::ValidationError(
                    "jwt.secret is required when auth is enabled".into(),
                ));
            }
            match jwt.algorithm.to_uppercase().as_str() {
                "HS256" | "RS256" | "ES256" => {}
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "Unsupported JWT algorithm '{}': must be HS256, RS256 or ES256",
                        other
                    )))
                }
            }
        }

        Ok(())
    }

    /// Session rules derived from the server, store and completion sections
    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            required_metadata: self.completion.required_metadata.clone(),
            filename_key: self.completion.filename_key.clone(),
            entity_key: self.completion.entity_key.clone(),
            max_size: self.server.max_size,
            expiration: Duration::from_secs(self.store.expiration_seconds),
            io_timeout: Duration::from_secs(self.store.io_timeout_seconds),
            write_buffer_size: self.server.write_buffer_size,
        }
    }

    /// Dispatcher settings from the completion section
    pub fn dispatcher_config(&self) -> FolderDispatcherConfig {
        FolderDispatcherConfig {
            default_root: self.completion.completed_dir.clone(),
            filename_key: self.completion.filename_key.clone(),
            entity_key: self.completion.entity_key.clone(),
            max_collision_attempts: self.completion.max_collision_attempts,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address", deserialize_with = "deserialize_with_env")]
    pub address: String,
    /// Path the upload collection is served under
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Largest upload accepted, advertised as `Tus-Max-Size`
    #[serde(default)]
    pub max_size: Option<u64>,
    /// Body bytes buffered before each durable append
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            base_path: default_base_path(),
            max_size: None,
            write_buffer_size: default_write_buffer_size(),
        }
    }
}

fn default_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_base_path() -> String {
    "/files".to_string()
}

fn default_write_buffer_size() -> usize {
    8 * 1024 * 1024 // 8MB
}

/// Chunk store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding in-progress uploads
    #[serde(default = "default_store_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_io_timeout")]
    pub io_timeout_seconds: u64,
    /// Idle time before an unfinished upload is evicted
    #[serde(default = "default_expiration")]
    pub expiration_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: default_store_directory(),
            io_timeout_seconds: default_io_timeout(),
            expiration_seconds: default_expiration(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

fn default_store_directory() -> PathBuf {
    PathBuf::from("tusfiles")
}

fn default_io_timeout() -> u64 {
    30
}

fn default_expiration() -> u64 {
    86400 // 24h
}

fn default_sweep_interval() -> u64 {
    300
}

/// Completion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Root for uploads that name no owning entity
    #[serde(default = "default_completed_dir")]
    pub completed_dir: PathBuf,
    /// SQLite database holding owners and completion records
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default = "default_filename_key")]
    pub filename_key: String,
    /// Metadata key naming the owning entity; `null` files everything flat
    #[serde(default = "default_entity_key")]
    pub entity_key: Option<String>,
    #[serde(default = "default_required_metadata")]
    pub required_metadata: Vec<String>,
    #[serde(default = "default_max_collision_attempts")]
    pub max_collision_attempts: u32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            completed_dir: default_completed_dir(),
            database: default_database(),
            filename_key: default_filename_key(),
            entity_key: default_entity_key(),
            required_metadata: default_required_metadata(),
            max_collision_attempts: default_max_collision_attempts(),
        }
    }
}

fn default_completed_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_database() -> PathBuf {
    PathBuf::from("uploads.db")
}

fn default_filename_key() -> String {
    "filename".to_string()
}

fn default_entity_key() -> Option<String> {
    Some("postid".to_string())
}

fn default_required_metadata() -> Vec<String> {
    vec!["filename".to_string()]
}

fn default_max_collision_attempts() -> u32 {
    10_000
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Reject requests without a token; otherwise they proceed anonymously
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub jwt: Option<JwtConfig>,
}

/// JWT configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// HMAC secret, or PEM encoded public key for RS256/ES256
    #[serde(default, deserialize_with = "deserialize_opt_with_env")]
    pub secret: Option<String>,
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

/// Custom deserializer for strings with environment variable expansion.
fn deserialize_with_env<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(expand_env_vars(&s))
}

fn deserialize_opt_with_env<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    Ok(s.map(|s| expand_env_vars(&s)))
}
