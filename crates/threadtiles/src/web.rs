//! HTTP API.
//!
//! Capture endpoints under `/sessions`, viewer endpoints under `/threads`.
//! A thread id is the id of the session that produced it.
//!
//! Deep Zoom viewers get `/threads/{id}.dzi` and
//! `/threads/{id}_files/{level}/{col}_{row}.{ext}` as well.

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tilestore::{StoredTile, TileAddress};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::frames::FrameError;
use crate::session::{
    CompletionDetails, FrameUpload, SessionError, SessionManager, SessionStatus, StateKind,
    UploadReceipt,
};
use crate::telemetry;
use crate::tiles::{TileError, TileServer};
use crate::types::{Platform, SessionId};

/// Seconds a viewer should wait before asking again for a pyramid that is
/// still being built.
const RETRY_AFTER_SECS: u64 = 2;

const TILE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// Shared state for web handlers
#[derive(Clone)]
pub struct WebState {
    pub sessions: SessionManager,
    pub tiles: Arc<TileServer>,
    pub max_request_bytes: usize,
    pub started_at: Instant,
}

pub fn router(state: WebState) -> Router {
    let body_limit = state.max_request_bytes;
    Router::new()
        .route("/", get(serve_root))
        .route("/health", get(health))
        .route("/sessions", post(create_session))
        .route("/sessions/{id}", get(session_status))
        .route("/sessions/{id}/frames", post(upload_frame))
        .route("/sessions/{id}/complete", post(complete_session))
        .route("/threads/{id}/manifest", get(thread_manifest))
        .route("/threads/{id}/tiles/{level}/{tile}", get(thread_tile))
        .route("/threads/{id}", get(dzi_descriptor))
        .route("/threads/{id}/{level}/{tile}", get(dzi_tile))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Request span, continuing the client's trace when it sends `traceparent`.
fn request_span(request: &Request) -> tracing::Span {
    let span = tracing::info_span!(
        "http.request",
        method = %request.method(),
        uri = %request.uri(),
    );
    let traceparent = request
        .headers()
        .get("traceparent")
        .and_then(|v| v.to_str().ok());
    if let Some(parent) = telemetry::parse_traceparent(traceparent) {
        span.set_parent(parent);
    }
    span
}

// --- Errors ---

/// JSON error body: `{"error": true, "error_code", "message", "details"}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retry_after: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: serde_json::Value::Null,
            retry_after: None,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": true,
            "error_code": self.code,
            "message": self.message,
            "details": self.details,
        }));
        let mut response = (self.status, body).into_response();
        if let Some(secs) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let message = err.to_string();
        match err {
            SessionError::NotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "session_not_found", message)
            }
            SessionError::AlreadyCompleted { state, .. } => {
                Self::new(StatusCode::CONFLICT, "session_already_completed", message)
                    .with_details(serde_json::json!({ "state": state }))
            }
            SessionError::Expired(_) => Self::new(StatusCode::GONE, "session_expired", message),
            SessionError::InvalidTransition { from, operation, .. } => {
                Self::new(StatusCode::CONFLICT, "invalid_transition", message).with_details(
                    serde_json::json!({ "state": from, "operation": operation }),
                )
            }
            SessionError::Frame(frame) => match frame {
                FrameError::InvalidIndex { index, max } => {
                    Self::new(StatusCode::BAD_REQUEST, "invalid_frame_index", message)
                        .with_details(serde_json::json!({ "frame_number": index, "max": max }))
                }
                FrameError::Empty { index } => {
                    Self::new(StatusCode::BAD_REQUEST, "empty_frame", message)
                        .with_details(serde_json::json!({ "frame_number": index }))
                }
                FrameError::TooLarge { index, size, max } => {
                    Self::new(StatusCode::PAYLOAD_TOO_LARGE, "frame_too_large", message)
                        .with_details(serde_json::json!({
                            "frame_number": index,
                            "size": size,
                            "max": max,
                        }))
                }
            },
        }
    }
}

impl From<TileError> for ApiError {
    fn from(err: TileError) -> Self {
        let message = err.to_string();
        match err {
            TileError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "thread_not_found", message),
            TileError::NotReady(_) => Self {
                retry_after: Some(RETRY_AFTER_SECS),
                ..Self::new(StatusCode::SERVICE_UNAVAILABLE, "thread_not_ready", message)
            },
            TileError::OutOfRange { address, .. } => {
                Self::new(StatusCode::NOT_FOUND, "tile_out_of_range", message).with_details(
                    serde_json::json!({
                        "level": address.level,
                        "row": address.row,
                        "col": address.col,
                    }),
                )
            }
            TileError::Missing { .. } => {
                Self::new(StatusCode::NOT_FOUND, "tile_not_found", message)
            }
            TileError::Storage(_) => {
                tracing::error!(error = %message, "Tile storage failure");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage_error",
                    "tile storage is unavailable",
                )
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), "invalid_request", rejection.body_text())
    }
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| SessionError::NotFound(raw.to_string()).into())
}

// --- Discovery ---

/// Serve root discovery endpoint
async fn serve_root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "threadtiles",
        "version": env!("CARGO_PKG_VERSION"),
        "links": {
            "sessions": "/sessions",
            "health": "/health",
            "manifest": "/threads/{id}/manifest",
            "tiles": "/threads/{id}/tiles/{level}/{col}_{row}.{ext}",
            "dzi": "/threads/{id}.dzi",
        }
    }))
}

async fn health(State(state): State<WebState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions.stats(),
        "frames": state.sessions.frame_stats(),
        "jobs": state.sessions.jobs().stats(),
    }))
}

// --- Capture ---

#[tracing::instrument(name = "http.sessions.create", skip(state))]
async fn create_session(State(state): State<WebState>) -> (StatusCode, Json<SessionStatus>) {
    (StatusCode::CREATED, Json(state.sessions.create()))
}

#[tracing::instrument(name = "http.sessions.status", skip(state))]
async fn session_status(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    let id = parse_session_id(&id)?;
    Ok(Json(state.sessions.status(id)?))
}

/// Capture timestamps arrive either as RFC 3339 strings or as epoch
/// milliseconds (`Date.now()`).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClientTimestamp {
    Rfc3339(DateTime<Utc>),
    Millis(i64),
}

impl ClientTimestamp {
    fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Rfc3339(at) => Some(*at),
            Self::Millis(ms) => DateTime::from_timestamp_millis(*ms),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FrameRequest {
    frame_number: u32,
    image_base64: String,
    /// CSS pixels; browsers report fractional values at some zoom levels.
    viewport_height: f64,
    #[serde(default)]
    scroll_position: f64,
    #[serde(default)]
    timestamp: Option<ClientTimestamp>,
}

fn css_pixels(value: f64) -> u32 {
    value.max(0.0).round().min(f64::from(u32::MAX)) as u32
}

/// Decode a frame payload, with or without a `data:image/...;base64,` prefix.
fn decode_image(payload: &str) -> Result<Vec<u8>, ApiError> {
    let encoded = match payload.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => payload,
    };
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                "invalid_base64",
                format!("image_base64 is not valid base64: {e}"),
            )
        })
}

#[tracing::instrument(name = "http.sessions.upload_frame", skip(state, payload))]
async fn upload_frame(
    State(state): State<WebState>,
    Path(id): Path<String>,
    payload: Result<Json<FrameRequest>, JsonRejection>,
) -> Result<Json<UploadReceipt>, ApiError> {
    let id = parse_session_id(&id)?;
    let Json(request) = payload?;
    let bytes = decode_image(&request.image_base64)?;

    let receipt = state.sessions.upload_frame(
        id,
        FrameUpload {
            index: request.frame_number,
            bytes,
            viewport_height: css_pixels(request.viewport_height),
            scroll_position: css_pixels(request.scroll_position),
            captured_at: request.timestamp.as_ref().and_then(ClientTimestamp::to_utc),
        },
    )?;
    Ok(Json(receipt))
}

fn default_wait() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    total_frames: u32,
    #[serde(default)]
    platform: Platform,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    analyze: bool,
    #[serde(default = "default_wait")]
    wait: bool,
}

#[tracing::instrument(name = "http.sessions.complete", skip(state, payload))]
async fn complete_session(
    State(state): State<WebState>,
    Path(id): Path<String>,
    payload: Result<Json<CompleteRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SessionStatus>), ApiError> {
    let id = parse_session_id(&id)?;
    let Json(request) = payload?;

    let status = state
        .sessions
        .complete(
            id,
            CompletionDetails {
                total_frames: request.total_frames,
                platform: request.platform,
                source_url: request.url,
                analyze: request.analyze,
            },
            request.wait,
        )
        .await?;

    let code = match status.state {
        StateKind::Failed => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::OK,
    };
    Ok((code, Json(status)))
}

// --- Viewer ---

#[tracing::instrument(name = "http.threads.manifest", skip(state))]
async fn thread_manifest(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = TileServer::parse_id(&id)?;
    let manifest = state.tiles.get_manifest(id)?;
    Ok(Json(manifest.as_ref().clone()).into_response())
}

/// Parse `{col}_{row}.{ext}`.
fn parse_tile_name(name: &str) -> Option<(u32, u32, &str)> {
    let (stem, ext) = name.rsplit_once('.')?;
    let (col, row) = stem.split_once('_')?;
    Some((col.parse().ok()?, row.parse().ok()?, ext))
}

#[tracing::instrument(name = "http.threads.tile", skip(state, headers))]
async fn thread_tile(
    State(state): State<WebState>,
    Path((id, level, tile)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let id = TileServer::parse_id(&id)?;
    let parsed = level.parse::<u32>().ok().zip(parse_tile_name(&tile));
    let Some((level_num, (col, row, ext))) = parsed else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_tile_name",
            "tiles are addressed as {level}/{col}_{row}.{ext}",
        )
        .with_details(serde_json::json!({ "level": level, "tile": tile })));
    };

    let stored = state
        .tiles
        .get_tile(id, TileAddress::new(level_num, row, col), ext)?;
    Ok(tile_response(stored, &headers))
}

/// `/threads/{id}.dzi`
#[tracing::instrument(name = "http.threads.dzi", skip(state))]
async fn dzi_descriptor(
    State(state): State<WebState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let Some(raw) = name.strip_suffix(".dzi") else {
        return Err(TileError::NotFound(name).into());
    };
    let id = TileServer::parse_id(raw)?;
    let manifest = state.tiles.get_manifest(id)?;
    Ok((
        [(header::CONTENT_TYPE, "application/xml")],
        manifest.dzi_xml(),
    )
        .into_response())
}

/// `/threads/{id}_files/{level}/{col}_{row}.{ext}`, levels counted from 1x1.
#[tracing::instrument(name = "http.threads.dzi_tile", skip(state, headers))]
async fn dzi_tile(
    State(state): State<WebState>,
    Path((name, level, tile)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let Some(raw) = name.strip_suffix("_files") else {
        return Err(TileError::NotFound(name).into());
    };
    let id = TileServer::parse_id(raw)?;
    let parsed = level.parse::<u32>().ok().zip(parse_tile_name(&tile));
    let Some((level_num, (col, row, ext))) = parsed else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_tile_name",
            "Deep Zoom tiles are addressed as {id}_files/{level}/{col}_{row}.{ext}",
        )
        .with_details(serde_json::json!({ "level": level, "tile": tile })));
    };

    let stored = state.tiles.get_dzi_tile(id, level_num, col, row, ext)?;
    Ok(tile_response(stored, &headers))
}

/// Tile body with its ETag, or a bare 304 when the client already has it.
fn tile_response(stored: StoredTile, request_headers: &HeaderMap) -> Response {
    let etag = stored.hash.etag();

    let not_modified = request_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|tag| tag.trim() == etag));

    let mut response = if not_modified {
        StatusCode::NOT_MODIFIED.into_response()
    } else {
        (
            [(header::CONTENT_TYPE, stored.mime_type.clone())],
            stored.bytes,
        )
            .into_response()
    };

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&etag) {
        headers.insert(header::ETAG, value);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(TILE_CACHE_CONTROL),
    );
    response
}
