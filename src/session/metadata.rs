//! Upload metadata
//!
//! Metadata travels in a single `Upload-Metadata` header as comma separated
//! pairs of `key base64(value)`. The value part may be omitted, which means an
//! empty value. Keys keep the order in which the client sent them.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metadata parse errors
#[derive(Error, Debug, PartialEq)]
pub enum MetadataError {
    #[error("Metadata key is empty")]
    EmptyKey,

    #[error("Invalid metadata key '{0}'")]
    InvalidKey(String),

    #[error("Duplicate metadata key '{0}'")]
    DuplicateKey(String),

    #[error("Metadata value for '{0}' is not valid base64")]
    InvalidValue(String),

    #[error("Malformed metadata pair '{0}'")]
    MalformedPair(String),
}

/// Ordered mapping of metadata keys to opaque byte values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Metadata {
    entries: Vec<(String, Vec<u8>)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an `Upload-Metadata` header value
    pub fn parse(header: &str) -> Result<Self, MetadataError> {
        let mut metadata = Metadata::new();
        if header.trim().is_empty() {
            return Ok(metadata);
        }

        for pair in header.split(',') {
            let pair = pair.trim();
            let mut parts = pair.split(' ').filter(|s| !s.is_empty());

            let key = parts.next().ok_or(MetadataError::EmptyKey)?;
            let value = match parts.next() {
                Some(encoded) => STANDARD
                    .decode(encoded)
                    .map_err(|_| MetadataError::InvalidValue(key.to_string()))?,
                None => Vec::new(),
            };
            if parts.next().is_some() {
                return Err(MetadataError::MalformedPair(pair.to_string()));
            }

            metadata.insert(key, value)?;
        }

        Ok(metadata)
    }

    /// Encode back into the header representation
    pub fn encode(&self) -> String {
        self.entries
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    key.clone()
                } else {
                    format!("{} {}", key, STANDARD.encode(value))
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Add a key. Keys must be unique and contain no spaces or commas.
    pub fn insert(&mut self, key: &str, value: impl Into<Vec<u8>>) -> Result<(), MetadataError> {
        if key.is_empty() {
            return Err(MetadataError::EmptyKey);
        }
        if key.chars().any(|c| c == ' ' || c == ',' || !c.is_ascii() || c.is_ascii_control()) {
            return Err(MetadataError::InvalidKey(key.to_string()));
        }
        if self.contains_key(key) {
            return Err(MetadataError::DuplicateKey(key.to_string()));
        }
        self.entries.push((key.to_string(), value.into()));
        Ok(())
    }

    /// Builder-style insert for callers that control the keys
    pub fn with(mut self, key: &str, value: impl Into<Vec<u8>>) -> Result<Self, MetadataError> {
        self.insert(key, value)?;
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Value decoded as UTF-8, if present and valid
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Whether `key` is absent or has an empty value
    pub fn has_empty_value(&self, key: &str) -> bool {
        self.get(key).map_or(true, |v| v.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TryFrom<String> for Metadata {
    type Error = MetadataError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Metadata::parse(&value)
    }
}

impl From<Metadata> for String {
    fn from(value: Metadata) -> Self {
        value.encode()
    }
}
