#![forbid(unsafe_code)]

//! HTTP surface consumed by the mobile client.

use std::{io::SeekFrom, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::{
    jobs::{Job, JobStatus},
    resolver::{ResolveError, ResolvedMedia, Resolver},
    runner::{JobRunner, SubmitError},
};

const STREAM_CHUNK_SIZE: usize = 8 * 1024;
const FALLBACK_FILENAME: &str = "video.mp4";
const DOWNLOAD_NOT_FOUND: &str = "Download not found";
const FILE_NOT_FOUND: &str = "File not found on server";

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<Resolver>,
    pub runner: JobRunner,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/resolve", post(resolve_media))
        .route("/download", post(start_download))
        .route("/progress/{id}", get(download_progress))
        .route("/file/{id}", get(download_file))
        .fallback(unknown_endpoint)
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    job_status: Option<JobStatus>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            job_status: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    /// 400 carrying the job's current status so clients can keep polling.
    fn not_ready(status: JobStatus) -> Self {
        Self {
            job_status: Some(status),
            ..Self::bad_request("Download not ready")
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({ "error": self.message });
        if let Some(status) = self.job_status {
            body["status"] = serde_json::json!(status);
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct ResolveBody {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DownloadBody {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    format_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct DownloadAccepted {
    download_id: String,
    status: JobStatus,
}

async fn unknown_endpoint() -> ApiError {
    ApiError::not_found("endpoint not found")
}

async fn resolve_media(
    State(state): State<AppState>,
    body: Result<Json<ResolveBody>, JsonRejection>,
) -> ApiResult<Json<ResolvedMedia>> {
    let Json(body) = body?;
    let url = body.url.unwrap_or_default();
    match state.resolver.resolve(&url).await {
        Ok(media) => Ok(Json(media)),
        Err(err @ ResolveError::MissingUrl) => Err(ApiError::bad_request(err.to_string())),
        Err(err) => {
            warn!(%url, error = %err, "metadata lookup failed");
            Err(ApiError::internal(err.to_string()))
        }
    }
}

async fn start_download(
    State(state): State<AppState>,
    body: Result<Json<DownloadBody>, JsonRejection>,
) -> ApiResult<Json<DownloadAccepted>> {
    let Json(body) = body?;
    let url = body
        .url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request(ResolveError::MissingUrl.to_string()))?;
    let format = body.format_id.filter(|format| !format.trim().is_empty());

    let download_id = state.runner.submit(url, format).map_err(|err| match err {
        SubmitError::QueueFull => ApiError::unavailable(err.to_string()),
        SubmitError::Closed => ApiError::internal(err.to_string()),
    })?;

    Ok(Json(DownloadAccepted {
        download_id,
        status: JobStatus::Queued,
    }))
}

async fn download_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    state
        .runner
        .store()
        .snapshot(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(DOWNLOAD_NOT_FOUND))
}

async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let job = state
        .runner
        .store()
        .snapshot(&id)
        .ok_or_else(|| ApiError::not_found(DOWNLOAD_NOT_FOUND))?;
    let path = match job.filepath() {
        Some(path) if job.status() == JobStatus::Completed => path,
        _ => return Err(ApiError::not_ready(job.status())),
    };
    if !path.is_file() {
        return Err(ApiError::not_found(FILE_NOT_FOUND));
    }

    stream_file(path, &headers).await
}

async fn stream_file(path: &std::path::Path, request_headers: &HeaderMap) -> ApiResult<Response> {
    let mut file = File::open(path)
        .await
        .map_err(|_| ApiError::not_found(FILE_NOT_FOUND))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found(FILE_NOT_FOUND))?
        .len();
    let disposition = header_value(&format!(
        "attachment; filename=\"{}\"",
        attachment_name(path)
    ))?;

    let range = request_headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(&format!("bytes */{size}"))?);
            response
        }
        Some((start, end)) => {
            let end = end.min(size - 1);
            let length = end - start + 1;
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|err| ApiError::internal(err.to_string()))?;
            let stream = ReaderStream::with_capacity(file.take(length), STREAM_CHUNK_SIZE);
            let mut response = Response::new(Body::from_stream(stream));
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_RANGE,
                header_value(&format!("bytes {start}-{end}/{size}"))?,
            );
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            headers.insert(header::CONTENT_DISPOSITION, disposition);
            response
        }
        None => {
            let stream = ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE);
            let mut response = Response::new(Body::from_stream(stream));
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            headers.insert(header::CONTENT_DISPOSITION, disposition);
            response
        }
    };

    let headers = response.headers_mut();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    Ok(response)
}

fn header_value(value: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|err| ApiError::internal(err.to_string()))
}

/// Download name offered to the client: ASCII letters, digits and `._- `
/// survive, everything else becomes `_`.
fn attachment_name(path: &std::path::Path) -> String {
    let name: String = path
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        name
    }
}

/// Parses a single `bytes=` range. Anything unsupported is treated as absent
/// and answered with the whole file.
fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let ranges = value.to_str().ok()?.trim().strip_prefix("bytes=")?.trim();
    if ranges.contains(',') {
        return None;
    }
    let (start, end) = ranges.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        let suffix: u64 = end.parse().ok()?;
        if suffix == 0 || size == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix), size - 1));
    }

    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() {
        size.saturating_sub(1)
    } else {
        end.parse().ok()?
    };
    (end >= start).then_some((start, end))
}
