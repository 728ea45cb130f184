//! Protocol router
//!
//! Parses incoming requests into protocol operations. Header syntax is checked
//! here; session rules (offsets, lengths, concatenation) are left to the
//! session manager.

use crate::session::{ConcatRole, Metadata, MetadataError, UploadId};
use hyper::header::HeaderMap;
use hyper::Method;
use thiserror::Error;

/// Protocol version spoken by this server
pub const TUS_VERSION: &str = "1.0.0";

/// Extensions advertised on `OPTIONS`
pub const TUS_EXTENSIONS: &str = "creation,creation-defer-length,creation-with-upload,termination,concatenation,concatenation-unfinished,expiration";

/// Content type required on appended bytes
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

pub const TUS_RESUMABLE: &str = "tus-resumable";
pub const UPLOAD_OFFSET: &str = "upload-offset";
pub const UPLOAD_LENGTH: &str = "upload-length";
pub const UPLOAD_DEFER_LENGTH: &str = "upload-defer-length";
pub const UPLOAD_METADATA: &str = "upload-metadata";
pub const UPLOAD_CONCAT: &str = "upload-concat";
pub const METHOD_OVERRIDE: &str = "x-http-method-override";

/// Router errors
#[derive(Error, Debug, PartialEq)]
pub enum RouterError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid {name} header: {reason}")]
    InvalidHeader { name: &'static str, reason: String },

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("Unsupported content type: {0}")]
    UnsupportedMediaType(String),

    #[error("Invalid metadata: {0}")]
    Metadata(#[from] MetadataError),
}

/// Parameters of a creation request
#[derive(Debug, Clone, PartialEq)]
pub struct CreateRequest {
    pub upload_length: Option<u64>,
    pub defer_length: bool,
    pub metadata: Metadata,
    pub concat: ConcatRole,
    /// Body carries the first bytes of the upload (creation-with-upload)
    pub with_upload: bool,
}

/// Parameters of an append request
#[derive(Debug, Clone, PartialEq)]
pub struct AppendRequest {
    pub id: UploadId,
    pub offset: u64,
    /// Sets a deferred length
    pub upload_length: Option<u64>,
}

/// Protocol operation types
#[derive(Debug, Clone, PartialEq)]
pub enum TusOperation {
    /// OPTIONS {base}
    Options,
    /// POST {base}
    Create(CreateRequest),
    /// HEAD {base}/{id}
    Status { id: UploadId },
    /// PATCH {base}/{id}
    Append(AppendRequest),
    /// POST {base}/{id} on a final upload
    Finalize { id: UploadId },
    /// DELETE {base}/{id}
    Terminate { id: UploadId },
    /// GET /health
    Health,
    /// GET /metrics
    Metrics,
}

impl TusOperation {
    /// Short label used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            TusOperation::Options => "options",
            TusOperation::Create(_) => "create",
            TusOperation::Status { .. } => "status",
            TusOperation::Append(_) => "append",
            TusOperation::Finalize { .. } => "finalize",
            TusOperation::Terminate { .. } => "terminate",
            TusOperation::Health => "health",
            TusOperation::Metrics => "metrics",
        }
    }

    /// Answered without authentication
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            TusOperation::Options | TusOperation::Health | TusOperation::Metrics
        )
    }
}

/// Target of a request path
enum Target {
    Collection,
    Upload(UploadId),
}

/// Request parser
#[derive(Debug, Clone)]
pub struct TusRequestParser {
    base_path: String,
}

impl TusRequestParser {
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Parse an HTTP request into a protocol operation
    pub fn parse(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<TusOperation, RouterError> {
        let method = effective_method(method, headers)?;

        match (&method, path) {
            (&Method::GET, "/health") => return Ok(TusOperation::Health),
            (&Method::GET, "/metrics") => return Ok(TusOperation::Metrics),
            _ => {}
        }

        let target = self.target(path)?;

        if method == Method::OPTIONS {
            return Ok(TusOperation::Options);
        }

        check_version(headers)?;

        match (target, method) {
            (Target::Collection, Method::POST) => Self::parse_create(headers).map(TusOperation::Create),
            (Target::Upload(id), Method::HEAD) => Ok(TusOperation::Status { id }),
            (Target::Upload(id), Method::PATCH) => Self::parse_append(id, headers).map(TusOperation::Append),
            (Target::Upload(id), Method::POST) => Ok(TusOperation::Finalize { id }),
            (Target::Upload(id), Method::DELETE) => Ok(TusOperation::Terminate { id }),
            (_, method) => Err(RouterError::MethodNotAllowed(format!(
                "{} {}",
                method, path
            ))),
        }
    }

    fn target(&self, path: &str) -> Result<Target, RouterError> {
        let rest = path
            .strip_prefix(self.base_path.as_str())
            .ok_or_else(|| RouterError::NotFound(path.to_string()))?;

        match rest {
            "" | "/" => Ok(Target::Collection),
            _ => {
                let id = rest
                    .strip_prefix('/')
                    .filter(|id| !id.contains('/'))
                    .ok_or_else(|| RouterError::NotFound(path.to_string()))?;
                id.parse::<UploadId>()
                    .map(Target::Upload)
                    .map_err(|_| RouterError::NotFound(path.to_string()))
            }
        }
    }

    fn parse_create(headers: &HeaderMap) -> Result<CreateRequest, RouterError> {
        let upload_length = optional_u64(headers, UPLOAD_LENGTH)?;
        let defer_length = match header_str(headers, UPLOAD_DEFER_LENGTH)? {
            None => false,
            Some("1") => true,
            Some(other) => {
                return Err(RouterError::InvalidHeader {
                    name: UPLOAD_DEFER_LENGTH,
                    reason: format!("expected 1, got '{}'", other),
                })
            }
        };

        let concat = match header_str(headers, UPLOAD_CONCAT)? {
            Some(value) => parse_concat(value)?,
            None => ConcatRole::None,
        };

        match (upload_length.is_some(), defer_length) {
            (true, true) => {
                return Err(RouterError::InvalidHeader {
                    name: UPLOAD_DEFER_LENGTH,
                    reason: "cannot be combined with Upload-Length".into(),
                })
            }
            // Final uploads take their length from the parts
            (false, false) if !concat.is_final() => {
                return Err(RouterError::MissingHeader(UPLOAD_LENGTH))
            }
            _ => {}
        }

        let metadata = match header_str(headers, UPLOAD_METADATA)? {
            Some(value) => Metadata::parse(value)?,
            None => Metadata::new(),
        };

        Ok(CreateRequest {
            upload_length,
            defer_length,
            metadata,
            concat,
            with_upload: has_offset_content_type(headers),
        })
    }

    fn parse_append(id: UploadId, headers: &HeaderMap) -> Result<AppendRequest, RouterError> {
        match header_str(headers, "content-type")? {
            Some(ct) if is_offset_content_type(ct) => {}
            other => {
                return Err(RouterError::UnsupportedMediaType(
                    other.unwrap_or("none").to_string(),
                ))
            }
        }

        let offset =
            optional_u64(headers, UPLOAD_OFFSET)?.ok_or(RouterError::MissingHeader(UPLOAD_OFFSET))?;

        Ok(AppendRequest {
            id,
            offset,
            upload_length: optional_u64(headers, UPLOAD_LENGTH)?,
        })
    }
}

/// The method after applying `X-HTTP-Method-Override`
fn effective_method(method: &Method, headers: &HeaderMap) -> Result<Method, RouterError> {
    match header_str(headers, METHOD_OVERRIDE)? {
        Some(value) => Method::from_bytes(value.trim().to_uppercase().as_bytes()).map_err(|_| {
            RouterError::InvalidHeader {
                name: METHOD_OVERRIDE,
                reason: format!("'{}' is not a method", value),
            }
        }),
        None => Ok(method.clone()),
    }
}

fn check_version(headers: &HeaderMap) -> Result<(), RouterError> {
    match header_str(headers, TUS_RESUMABLE)? {
        Some(TUS_VERSION) => Ok(()),
        Some(other) => Err(RouterError::UnsupportedVersion(other.to_string())),
        None => Err(RouterError::UnsupportedVersion("none".into())),
    }
}

/// Parse `partial` or `final;<url> <url> ...`
pub fn parse_concat(value: &str) -> Result<ConcatRole, RouterError> {
    let value = value.trim();
    if value == "partial" {
        return Ok(ConcatRole::Partial);
    }

    let urls = value
        .strip_prefix("final;")
        .ok_or_else(|| RouterError::InvalidHeader {
            name: UPLOAD_CONCAT,
            reason: format!("unknown value '{}'", value),
        })?;

    let parts = urls
        .split_whitespace()
        .map(|url| {
            url.trim_end_matches('/')
                .rsplit('/')
                .next()
                .and_then(|segment| segment.parse::<UploadId>().ok())
                .ok_or_else(|| RouterError::InvalidHeader {
                    name: UPLOAD_CONCAT,
                    reason: format!("'{}' does not name an upload", url),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ConcatRole::Final(parts))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<Option<&'a str>, RouterError> {
    headers
        .get(name)
        .map(|v| {
            v.to_str().map_err(|_| RouterError::InvalidHeader {
                name,
                reason: "not visible ASCII".into(),
            })
        })
        .transpose()
}

/// Non-negative decimal integer; rejects signs and whitespace inside
fn optional_u64(headers: &HeaderMap, name: &'static str) -> Result<Option<u64>, RouterError> {
    let Some(raw) = header_str(headers, name)? else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RouterError::InvalidHeader {
            name,
            reason: format!("'{}' is not a non-negative integer", raw),
        });
    }
    raw.parse().map(Some).map_err(|_| RouterError::InvalidHeader {
        name,
        reason: format!("'{}' is out of range", raw),
    })
}

fn is_offset_content_type(value: &str) -> bool {
    value
        .split(';')
        .next()
        .map(|ct| ct.trim().eq_ignore_ascii_case(OFFSET_OCTET_STREAM))
        .unwrap_or(false)
}

fn has_offset_content_type(headers: &HeaderMap) -> bool {
    headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(is_offset_content_type)
        .unwrap_or(false)
}
