use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tunedrop::services::{ServiceError, StoreError};

use crate::state::AppState;

#[derive(Deserialize)]
pub struct ConvertBody {
    url: Option<String>,
}

#[derive(Serialize)]
pub struct ConvertResponse {
    title: String,
    thumbnail: Option<String>,
    file: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    code: String,
    message: String,
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let body = ErrorResponse {
        error: ErrorDetail {
            code: code.to_string(),
            message: message.to_string(),
        },
    };
    (status, Json(body)).into_response()
}

/// Client-caused errors carry their message; server-side ones stay generic.
fn service_error_response(err: &ServiceError) -> Response {
    match err {
        ServiceError::InvalidRequest(msg) => {
            error_response(StatusCode::BAD_REQUEST, "bad_request", msg)
        },
        ServiceError::SourceUnavailable(_) => error_response(
            StatusCode::BAD_REQUEST,
            "source_unavailable",
            "Invalid URL or the source is unavailable.",
        ),
        ServiceError::ExtractionFailed(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "extraction_failed",
            "The audio could not be converted.",
        ),
        _ => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "An internal error occurred.",
        ),
    }
}

fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "mp3" => "audio/mpeg",
        "m4a" | "aac" => "audio/mp4",
        "opus" | "ogg" | "vorbis" => "audio/ogg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "artifacts": state.store.len().await,
    }))
}

async fn convert(
    State(state): State<AppState>,
    body: Result<Json<ConvertBody>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => {
            tracing::debug!("Rejected convert body: {}", rejection);
            return error_response(
                StatusCode::BAD_REQUEST,
                "bad_request",
                "Request body must be JSON with a \"url\" field.",
            );
        },
    };

    let url = body.url.unwrap_or_default();
    match state.conversions.convert(&url).await {
        Ok(record) => Json(ConvertResponse {
            title: record.display_title().to_string(),
            thumbnail: record.thumbnail_url.clone(),
            file: format!("/download/{}", state.store.file_name(&record.id)),
        })
        .into_response(),
        Err(e) => {
            match &e {
                ServiceError::InvalidRequest(_) | ServiceError::SourceUnavailable(_) => {
                    tracing::info!("Conversion of {} rejected: {}", url, e)
                },
                _ => tracing::error!("Conversion of {} failed: {}", url, e),
            }
            service_error_response(&e)
        },
    }
}

/// Catch-all route so multi-segment traversal payloads reach the handler
/// instead of falling through to the static files.
async fn download(State(state): State<AppState>, Path(filename): Path<String>) -> Response {
    let id = match state.store.resolve_download(&filename) {
        Ok(id) => id,
        Err(StoreError::InvalidIdentifier(_)) => {
            tracing::warn!("Rejected download path {:?}", filename);
            return error_response(StatusCode::BAD_REQUEST, "bad_request", "Invalid filename.");
        },
        Err(_) => return not_found(),
    };

    let (record, file) = match state.store.open_file(&id).await {
        Ok(found) => found,
        Err(StoreError::NotFound(_)) => return not_found(),
        Err(e) => {
            tracing::error!("Failed to open artifact {}: {}", id, e);
            return service_error_response(&ServiceError::from(e));
        },
    };

    let file_name = state.store.file_name(&record.id);
    let disposition = format!("attachment; filename=\"{}\"", file_name);
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(state.store.extension())),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(record.size));
    match HeaderValue::from_str(&disposition) {
        Ok(value) => {
            headers.insert(header::CONTENT_DISPOSITION, value);
        },
        Err(e) => tracing::warn!("Unrepresentable file name {}: {}", file_name, e),
    }
    response
}

fn not_found() -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "not_found",
        "File not found. It may have expired.",
    )
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/convert", post(convert))
        .route("/download/{*filename}", get(download));

    if let Some(dir) = &state.config.server.static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
