#![forbid(unsafe_code)]

//! HTTP routes and the state they share.

use std::{path::Path, sync::Arc};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::{
    download::{DEFAULT_FORMAT, Downloader},
    error::{ServiceError, ServiceResult},
    extract::Extractor,
    response::{DisplayOverrides, build_response},
};

#[derive(Clone)]
pub struct AppState {
    pub extractor: Arc<Extractor>,
    pub downloader: Arc<Downloader>,
    pub engine_available: bool,
    /// Bounds concurrent downloads so metadata requests keep flowing.
    pub download_slots: Arc<Semaphore>,
}

impl AppState {
    pub fn new(
        extractor: Extractor,
        downloader: Downloader,
        engine_available: bool,
        max_downloads: usize,
    ) -> Self {
        Self {
            extractor: Arc::new(extractor),
            downloader: Arc::new(downloader),
            engine_available,
            download_slots: Arc::new(Semaphore::new(max_downloads.max(1))),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ping", get(ping))
        .route("/disk-space", get(disk_space))
        .route("/info", get(info))
        .route("/download", get(download))
        .route("/playlist-info", get(playlist_info))
        .route("/download-playlist", get(download_playlist))
        .fallback(not_found)
        .with_state(state)
}

/// Success payloads carry `success: true` next to their own fields.
#[derive(Serialize)]
struct Success<T> {
    success: bool,
    #[serde(flatten)]
    payload: T,
}

impl<T: Serialize> Success<T> {
    fn new(payload: T) -> Json<Self> {
        Json(Self {
            success: true,
            payload,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UrlQuery {
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    pub url: Option<String>,
    pub format: Option<String>,
    pub title: Option<String>,
    pub channel: Option<String>,
    pub resolution: Option<String>,
    pub codec: Option<String>,
    pub subtitles: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PlaylistDownloadQuery {
    pub url: Option<String>,
    pub format: Option<String>,
    pub playlist_title: Option<String>,
    pub resolution: Option<String>,
    pub subtitles: Option<String>,
}

fn require_url(url: Option<String>) -> ServiceResult<String> {
    url.map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ServiceError::validation("URL parameter is required"))
}

fn format_or_default(format: Option<String>) -> String {
    format
        .map(|format| format.trim().to_string())
        .filter(|format| !format.is_empty())
        .unwrap_or_else(|| DEFAULT_FORMAT.to_string())
}

/// Runs engine, transcoder and filesystem work off the async workers.
async fn run_blocking<T, F>(work: F) -> ServiceResult<T>
where
    F: FnOnce() -> ServiceResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| ServiceError::internal(format!("worker task failed: {err}")))?
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "engine_available": state.engine_available,
        "transcoder_available": state.downloader.transcoder().available(),
    }))
}

async fn ping() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
pub struct DiskSpace {
    pub free_bytes: u64,
    pub free_human: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

pub fn human_size(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    let value = bytes as f64;
    if value >= KIB * KIB * KIB {
        format!("{:.1} GB", value / (KIB * KIB * KIB))
    } else if value >= KIB * KIB {
        format!("{:.1} MB", value / (KIB * KIB))
    } else {
        format!("{:.1} KB", value / KIB)
    }
}

fn disk_usage(path: &Path) -> std::io::Result<DiskSpace> {
    let stats = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
    let fragment = stats.fragment_size() as u64;
    let total_bytes = stats.blocks() as u64 * fragment;
    let free_bytes = stats.blocks_available() as u64 * fragment;
    let used_bytes = total_bytes.saturating_sub(stats.blocks_free() as u64 * fragment);
    Ok(DiskSpace {
        free_bytes,
        free_human: human_size(free_bytes),
        total_bytes,
        used_bytes,
    })
}

async fn disk_space(State(state): State<AppState>) -> ServiceResult<Json<DiskSpace>> {
    let root = state.downloader.workspace_root().to_path_buf();
    let usage = run_blocking(move || Ok(disk_usage(&root)?)).await?;
    Ok(Json(usage))
}

async fn info(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> ServiceResult<Response> {
    let url = require_url(query.url)?;
    let extractor = Arc::clone(&state.extractor);
    let record = run_blocking(move || extractor.fetch_info(&url)).await?;
    Ok(Success::new(&*record).into_response())
}

async fn playlist_info(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> ServiceResult<Response> {
    let url = require_url(query.url)?;
    let extractor = Arc::clone(&state.extractor);
    let summary = run_blocking(move || extractor.playlist_info(&url)).await?;
    Ok(Success::new(summary).into_response())
}

async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> ServiceResult<Response> {
    let url = require_url(query.url)?;
    let format = format_or_default(query.format);
    let subtitles = query.subtitles;
    let permit = Arc::clone(&state.download_slots)
        .acquire_owned()
        .await
        .map_err(|err| ServiceError::internal(err.to_string()))?;

    info!(url, format, "download requested");
    let downloader = Arc::clone(&state.downloader);
    let session = run_blocking(move || {
        let _permit = permit;
        downloader.download(&url, &format, subtitles.as_deref())
    })
    .await?;

    let overrides = DisplayOverrides {
        title: query.title,
        channel: query.channel,
        resolution: query.resolution,
        codec: query.codec,
    };
    build_response(session, &overrides, headers.get(header::RANGE)).await
}

async fn download_playlist(
    State(state): State<AppState>,
    Query(query): Query<PlaylistDownloadQuery>,
    headers: HeaderMap,
) -> ServiceResult<Response> {
    let url = require_url(query.url)?;
    let format = format_or_default(query.format);
    let subtitles = query.subtitles;
    let title = query.playlist_title;
    let permit = Arc::clone(&state.download_slots)
        .acquire_owned()
        .await
        .map_err(|err| ServiceError::internal(err.to_string()))?;

    info!(url, format, "playlist download requested");
    let downloader = Arc::clone(&state.downloader);
    let session = run_blocking(move || {
        let _permit = permit;
        downloader.download_playlist(&url, &format, subtitles.as_deref(), title.as_deref())
    })
    .await?;

    let overrides = DisplayOverrides {
        resolution: query.resolution,
        ..DisplayOverrides::default()
    };
    build_response(session, &overrides, headers.get(header::RANGE)).await
}

async fn not_found(uri: axum::http::Uri) -> ServiceError {
    warn!(path = uri.path(), "unknown endpoint");
    ServiceError::NotFound("endpoint not found".to_string())
}
