use crate::{error::AppError, state::AppState};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::path::Path as FsPath;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::debug;

const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

/// Content type for the files the encoder writes
pub fn hls_content_type(file: &str) -> &'static str {
    match FsPath::new(file).extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        _ => "application/octet-stream",
    }
}

/// Only plain file names inside the segment directory are served
pub fn is_safe_file_name(file: &str) -> bool {
    !file.is_empty()
        && file != "."
        && file != ".."
        && !file.contains('/')
        && !file.contains('\\')
        && !file.contains('\0')
}

pub async fn serve_hls(State(state): State<AppState>, Path(file): Path<String>) -> Result<Response, AppError> {
    if !is_safe_file_name(&file) {
        debug!("Rejected HLS request for {:?}", file);
        return Err(AppError::NotFound);
    }

    let path = state.segment_dir.join(&file);
    let file_handle = match File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(AppError::NotFound),
        Err(e) => return Err(AppError::Io(e)),
    };
    let metadata = file_handle.metadata().await?;
    if !metadata.is_file() {
        return Err(AppError::NotFound);
    }

    let stream = ReaderStream::with_capacity(file_handle, 64 * 1024);
    let body = Body::from_stream(stream);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, hls_content_type(&file))
        .header(header::CONTENT_LENGTH, metadata.len())
        .header(header::CACHE_CONTROL, NO_CACHE)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(body)?)
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let viewers = state.registry.len().await;
    let playing = state.engine.is_playing().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "viewers": viewers,
        "playing": playing,
    }))
}
