//! Protocol handler
//!
//! Maps parsed operations onto the session manager and renders the protocol
//! headers of each response.
//!
//! # Supported Endpoints
//!
//! * `OPTIONS {base}` - server capabilities
//! * `POST {base}` - create an upload, optionally with its first bytes
//! * `HEAD {base}/{id}` - current offset and upload state
//! * `PATCH {base}/{id}` - append bytes at `Upload-Offset`
//! * `POST {base}/{id}` - merge a final upload
//! * `DELETE {base}/{id}` - terminate an upload
//! * `GET /health`, `GET /metrics`

use super::AppState;
use crate::auth::{AuthError, AuthRequest};
use crate::metrics;
use crate::router::{
    AppendRequest, CreateRequest, RouterError, TusOperation, TUS_EXTENSIONS, TUS_VERSION,
};
use crate::session::{ConcatRole, NewSession, SessionError, UploadId};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use http_body_util::BodyStream;
use hyper::body::Incoming;
use hyper::http::response::Builder;
use hyper::{Request, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn, Instrument};

/// Handle one HTTP request
pub async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<String>, hyper::Error> {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let span = tracing::info_span!(
        "http.request",
        http.method = %method,
        http.target = %path,
        operation = tracing::field::Empty,
        http.status_code = tracing::field::Empty,
    );

    async move {
        let (operation, response) = match state.parser.parse(&method, &path, req.headers()) {
            Ok(op) => {
                let name = op.name();
                tracing::Span::current().record("operation", name);
                (name, execute(op, req, &state).await)
            }
            Err(e) => ("invalid", router_error_response(&e)),
        };

        let status = response.status().as_u16();
        tracing::Span::current().record("http.status_code", status);
        metrics::record_request(operation, status, start.elapsed().as_secs_f64());
        info!(
            status,
            duration_ms = start.elapsed().as_millis(),
            "Handled request"
        );

        Ok::<_, hyper::Error>(response)
    }
    .instrument(span)
    .await
}

async fn execute(op: TusOperation, req: Request<Incoming>, state: &AppState) -> Response<String> {
    let owner = if op.is_public() {
        None
    } else {
        match authenticate(&req, state).await {
            Ok(owner) => owner,
            Err(response) => return response,
        }
    };

    let result = match op {
        TusOperation::Health => {
            return respond(
                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain"),
                "ok".to_string(),
            )
        }
        TusOperation::Metrics => return metrics_response(state),
        TusOperation::Options => return options_response(state),
        TusOperation::Create(create) => handle_create(create, owner, req, state).await,
        TusOperation::Status { id } => handle_status(&id, state).await,
        TusOperation::Append(append) => handle_append(append, req, state).await,
        TusOperation::Finalize { id } => handle_finalize(&id, state).await,
        TusOperation::Terminate { id } => handle_terminate(&id, state).await,
    };

    result.unwrap_or_else(|e| session_error_response(&e))
}

async fn handle_create(
    create: CreateRequest,
    owner: Option<String>,
    req: Request<Incoming>,
    state: &AppState,
) -> Result<Response<String>, SessionError> {
    let status = state
        .manager
        .create(NewSession {
            declared_length: create.upload_length,
            metadata: create.metadata,
            concat: create.concat,
            owner,
        })
        .await?;

    let mut builder = tus_builder(StatusCode::CREATED)
        .header("Location", upload_url(state, &status.id));

    let mut offset = status.bytes_received;
    let mut expires_at = status.expires_at;
    if create.with_upload && !status.concat.is_final() && !status.complete {
        // The upload exists now; a failed first chunk is resumed like any other
        match state
            .manager
            .advance_stream(&status.id, 0, None, body_stream(req))
            .await
        {
            Ok(new_offset) => offset = new_offset,
            Err(e) => {
                warn!(upload_id = %status.id, error = %e, "Creation body not fully stored");
                if let Ok(current) = state.manager.status(&status.id).await {
                    offset = current.bytes_received;
                }
            }
        }
        if let Ok(current) = state.manager.status(&status.id).await {
            expires_at = current.expires_at;
        }
    }

    if create.with_upload || status.complete {
        builder = builder.header("Upload-Offset", offset);
    }
    builder = builder.header("Upload-Expires", http_date(expires_at));

    Ok(respond(builder, String::new()))
}

async fn handle_status(id: &UploadId, state: &AppState) -> Result<Response<String>, SessionError> {
    let status = state.manager.status(id).await?;

    let mut builder = tus_builder(StatusCode::OK).header("Cache-Control", "no-store");

    // An unmerged final upload has no meaningful offset yet
    if !(status.concat.is_final() && !status.complete) {
        builder = builder.header("Upload-Offset", status.bytes_received);
    }
    builder = match status.declared_length {
        Some(length) => builder.header("Upload-Length", length),
        None if !status.concat.is_final() => builder.header("Upload-Defer-Length", "1"),
        None => builder,
    };
    if !status.metadata.is_empty() {
        builder = builder.header("Upload-Metadata", status.metadata.encode());
    }
    if let Some(concat) = concat_header(state, &status.concat) {
        builder = builder.header("Upload-Concat", concat);
    }
    if !status.complete {
        builder = builder.header("Upload-Expires", http_date(status.expires_at));
    }

    Ok(respond(builder, String::new()))
}

async fn handle_append(
    append: AppendRequest,
    req: Request<Incoming>,
    state: &AppState,
) -> Result<Response<String>, SessionError> {
    let offset = state
        .manager
        .advance_stream(&append.id, append.offset, append.upload_length, body_stream(req))
        .await?;
    let status = state.manager.status(&append.id).await?;

    let mut builder = tus_builder(StatusCode::NO_CONTENT).header("Upload-Offset", offset);
    if !status.complete {
        builder = builder.header("Upload-Expires", http_date(status.expires_at));
    }
    Ok(respond(builder, String::new()))
}

async fn handle_finalize(id: &UploadId, state: &AppState) -> Result<Response<String>, SessionError> {
    let status = state.manager.finalize(id).await?;
    let mut builder =
        tus_builder(StatusCode::NO_CONTENT).header("Upload-Offset", status.bytes_received);
    if let Some(length) = status.declared_length {
        builder = builder.header("Upload-Length", length);
    }
    Ok(respond(builder, String::new()))
}

async fn handle_terminate(
    id: &UploadId,
    state: &AppState,
) -> Result<Response<String>, SessionError> {
    state.manager.terminate(id).await?;
    Ok(respond(tus_builder(StatusCode::NO_CONTENT), String::new()))
}

/// Resolve the requester's identity.
///
/// Requests without a token stay anonymous unless auth is required.
async fn authenticate(
    req: &Request<Incoming>,
    state: &AppState,
) -> Result<Option<String>, Response<String>> {
    let Some(authenticator) = &state.authenticator else {
        return Ok(None);
    };

    match authenticator.authenticate(&build_auth_request(req)).await {
        Ok(result) => Ok(Some(result.subject)),
        Err(AuthError::MissingAuth) if !state.auth_required => Ok(None),
        Err(e) => {
            warn!(error = %e, "Authentication failed");
            let challenge = match e {
                AuthError::MissingAuth => "Bearer",
                AuthError::TokenExpired => {
                    "Bearer error=\"invalid_token\", error_description=\"Token expired\""
                }
                _ => "Bearer error=\"invalid_token\"",
            };
            Err(respond(
                tus_builder(StatusCode::UNAUTHORIZED)
                    .header("Content-Type", "text/plain")
                    .header("WWW-Authenticate", challenge),
                e.to_string(),
            ))
        }
    }
}

/// Build AuthRequest from hyper Request headers
fn build_auth_request(req: &Request<Incoming>) -> AuthRequest {
    let mut headers = HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.as_str().to_lowercase(), v.to_string());
        }
    }

    AuthRequest {
        headers,
        query: req.uri().query().map(|q| q.to_string()),
        method: req.method().to_string(),
        path: req.uri().path().to_string(),
    }
}

/// Request body as a stream of data frames
fn body_stream(
    req: Request<Incoming>,
) -> impl futures::Stream<Item = Result<bytes::Bytes, hyper::Error>> + Send {
    BodyStream::new(req.into_body()).try_filter_map(|frame| async move { Ok(frame.into_data().ok()) })
}

fn options_response(state: &AppState) -> Response<String> {
    let mut builder = tus_builder(StatusCode::NO_CONTENT)
        .header("Tus-Version", TUS_VERSION)
        .header("Tus-Extension", TUS_EXTENSIONS);
    if let Some(max) = state.max_size {
        builder = builder.header("Tus-Max-Size", max);
    }
    respond(builder, String::new())
}

fn metrics_response(state: &AppState) -> Response<String> {
    if !state.metrics_enabled {
        return respond(
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .header("Content-Type", "text/plain"),
            "Not Found".to_string(),
        );
    }

    match metrics::render() {
        Ok((content_type, body)) => respond(
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", content_type),
            String::from_utf8_lossy(&body).into_owned(),
        ),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            respond(
                Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR),
                "Failed to encode metrics".to_string(),
            )
        }
    }
}

fn session_error_response(e: &SessionError) -> Response<String> {
    let status = match e {
        SessionError::Validation(_) | SessionError::InvalidConcat(_) => StatusCode::BAD_REQUEST,
        SessionError::Interrupted(_) => StatusCode::BAD_REQUEST,
        SessionError::OffsetMismatch { .. } | SessionError::IncompleteDependency(_) => {
            StatusCode::CONFLICT
        }
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::Forbidden(_) => StatusCode::FORBIDDEN,
        SessionError::ExceedsLength { .. } | SessionError::TooLarge { .. } => {
            StatusCode::PAYLOAD_TOO_LARGE
        }
        SessionError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
    };

    if status.is_server_error() {
        error!(error = %e, "Upload request failed");
        metrics::record_error("store");
    } else {
        warn!(error = %e, status = status.as_u16(), "Upload request rejected");
    }

    let mut builder = tus_builder(status).header("Content-Type", "text/plain");
    if let SessionError::OffsetMismatch { actual, .. } = e {
        builder = builder.header("Upload-Offset", *actual);
    }
    respond(builder, e.to_string())
}

fn router_error_response(e: &RouterError) -> Response<String> {
    let status = match e {
        RouterError::NotFound(_) => StatusCode::NOT_FOUND,
        RouterError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
        RouterError::MissingHeader(_)
        | RouterError::InvalidHeader { .. }
        | RouterError::Metadata(_) => StatusCode::BAD_REQUEST,
        RouterError::UnsupportedVersion(_) => StatusCode::PRECONDITION_FAILED,
        RouterError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
    };
    info!(error = %e, status = status.as_u16(), "Rejected request");

    let mut builder = tus_builder(status).header("Content-Type", "text/plain");
    if matches!(e, RouterError::UnsupportedVersion(_)) {
        builder = builder.header("Tus-Version", TUS_VERSION);
    }
    respond(builder, e.to_string())
}

fn tus_builder(status: StatusCode) -> Builder {
    Response::builder()
        .status(status)
        .header("Tus-Resumable", TUS_VERSION)
}

/// Finish a response, degrading to a bare 500 if a header value was invalid
fn respond(builder: Builder, body: String) -> Response<String> {
    builder.body(body).unwrap_or_else(|e| {
        error!(error = %e, "Failed to build response");
        let mut response = Response::new(String::new());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}

fn upload_url(state: &AppState, id: &UploadId) -> String {
    format!("{}/{}", state.parser.base_path(), id)
}

fn concat_header(state: &AppState, concat: &ConcatRole) -> Option<String> {
    match concat {
        ConcatRole::None => None,
        ConcatRole::Partial => Some("partial".to_string()),
        ConcatRole::Final(parts) => Some(format!(
            "final;{}",
            parts
                .iter()
                .map(|id| upload_url(state, id))
                .collect::<Vec<_>>()
                .join(" ")
        )),
    }
}

/// RFC 7231 HTTP-date
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
