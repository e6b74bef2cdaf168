#![forbid(unsafe_code)]

//! Turns a finished [`DownloadSession`] into a streaming HTTP response.

use std::{
    io,
    path::Path,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::{Body, Bytes},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::Stream;
use mime_guess::{MimeGuess, mime};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, Take},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::{
    download::{DownloadSession, SessionKind},
    error::{ServiceError, ServiceResult},
    workspace::Workspace,
};

pub const CHUNK_SIZE: usize = 64 * 1024;
const ARCHIVE_EXTENSION: &str = ".tar.gz";

/// Name parts supplied by the client. Each one wins over what the engine
/// reported.
#[derive(Debug, Clone, Default)]
pub struct DisplayOverrides {
    pub title: Option<String>,
    pub channel: Option<String>,
    pub resolution: Option<String>,
    pub codec: Option<String>,
}

/// Keeps letters, digits, spaces, `-` and `_`, then trims.
pub fn sanitize_component(value: &str) -> String {
    value
        .chars()
        .filter(|ch| ch.is_alphanumeric() || matches!(ch, ' ' | '-' | '_'))
        .collect::<String>()
        .trim()
        .to_string()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn sanitized(value: Option<&str>) -> Option<String> {
    value
        .map(sanitize_component)
        .filter(|value| !value.is_empty())
}

/// `Title - Channel (Resolution, Codec).ext`, shedding the trailing parts
/// that are missing.
pub fn video_filename(
    title: Option<&str>,
    channel: Option<&str>,
    resolution: Option<&str>,
    codec: Option<&str>,
    ext: &str,
) -> String {
    let title = Some(sanitize_component(title.unwrap_or("")))
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| "video".to_string());
    let channel = sanitize_component(channel.unwrap_or(""));
    match (channel.is_empty(), sanitized(resolution), sanitized(codec)) {
        (false, Some(resolution), Some(codec)) => {
            format!("{title} - {channel} ({resolution}, {codec}){ext}")
        }
        (false, Some(resolution), None) => format!("{title} - {channel} ({resolution}){ext}"),
        (false, None, _) => format!("{title} - {channel}{ext}"),
        (true, _, _) => format!("{title}{ext}"),
    }
}

/// `Title (Resolution).ext` or `Title.ext`.
pub fn playlist_filename(title: Option<&str>, resolution: Option<&str>, ext: &str) -> String {
    let title = Some(sanitize_component(title.unwrap_or("")))
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| "playlist".to_string());
    match sanitized(resolution) {
        Some(resolution) => format!("{title} ({resolution}){ext}"),
        None => format!("{title}{ext}"),
    }
}

/// Dotted extension of `path`, treating `.tar.gz` as one unit.
fn dotted_extension(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.to_ascii_lowercase().ends_with(ARCHIVE_EXTENSION) {
        return Some(ARCHIVE_EXTENSION.to_string());
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
}

pub fn ascii_fallback(filename: &str) -> String {
    filename
        .chars()
        .map(|ch| if ch.is_ascii() { ch } else { '_' })
        .collect()
}

/// `attachment` disposition with an ASCII fallback and the RFC 5987 UTF-8 form.
pub fn content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii_fallback(filename),
        urlencoding::encode(filename)
    )
}

pub fn content_type(path: &Path) -> String {
    let known = match dotted_extension(path).as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some(".mp4") => Some("video/mp4"),
        Some(".webm") => Some("video/webm"),
        Some(".mkv") => Some("video/x-matroska"),
        Some(".mp3") => Some("audio/mpeg"),
        Some(".m4a") => Some("audio/mp4"),
        Some(".opus") => Some("audio/opus"),
        Some(ARCHIVE_EXTENSION) => Some("application/gzip"),
        _ => None,
    };
    match known {
        Some(known) => known.to_string(),
        None => MimeGuess::from_path(path)
            .first()
            .unwrap_or(mime::APPLICATION_OCTET_STREAM)
            .to_string(),
    }
}

/// Parses a single `bytes=` range. Suffix ranges are clamped to the file.
pub fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let (unit, range) = value.split_once('=')?;
    if unit.trim() != "bytes" {
        return None;
    }
    let range = range.trim();
    // Multi-range requests are served in full.
    if range.is_empty() || range.contains(',') {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;
    let (start_str, end_str) = (start_str.trim(), end_str.trim());

    if start_str.is_empty() {
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 || size == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix_len), size - 1));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

/// Response body that owns the request workspace. The workspace is removed
/// when the file has been read to the end, when a read fails, or when the
/// body is dropped early because the client went away.
pub struct CleanupStream {
    inner: ReaderStream<Take<File>>,
    workspace: Option<Workspace>,
}

impl CleanupStream {
    pub fn new(file: Take<File>, workspace: Workspace) -> Self {
        Self {
            inner: ReaderStream::with_capacity(file, CHUNK_SIZE),
            workspace: Some(workspace),
        }
    }

    fn finish(&mut self) {
        if let Some(mut workspace) = self.workspace.take() {
            workspace.cleanup_in_background();
            debug!("response stream finished; workspace released");
        }
    }
}

impl Drop for CleanupStream {
    fn drop(&mut self) {
        self.finish();
    }
}

impl Stream for CleanupStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_next(cx);
        if matches!(poll, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            this.finish();
        }
        poll
    }
}

fn header_value(value: impl AsRef<str>) -> ServiceResult<HeaderValue> {
    HeaderValue::from_str(value.as_ref())
        .map_err(|err| ServiceError::internal(format!("invalid header value: {err}")))
}

fn response_filename(session: &DownloadSession, overrides: &DisplayOverrides) -> String {
    let hints = &session.hints;
    let pick = |client: &Option<String>, engine: &Option<String>| {
        non_blank(client.as_deref())
            .or_else(|| non_blank(engine.as_deref()))
            .map(str::to_string)
    };
    let title = pick(&overrides.title, &hints.title);
    let resolution = pick(&overrides.resolution, &hints.resolution);
    match session.kind {
        SessionKind::Single => {
            let ext = dotted_extension(&session.result_file).unwrap_or_else(|| ".mp4".to_string());
            video_filename(
                title.as_deref(),
                pick(&overrides.channel, &hints.channel).as_deref(),
                resolution.as_deref(),
                pick(&overrides.codec, &hints.codec).as_deref(),
                &ext,
            )
        }
        SessionKind::Playlist => {
            playlist_filename(title.as_deref(), resolution.as_deref(), ARCHIVE_EXTENSION)
        }
    }
}

struct Prepared {
    file: File,
    status: StatusCode,
    start: u64,
    length: u64,
    size: u64,
}

/// Opens `path` and settles the status and byte window. `Err(size)` in the
/// inner result means the requested range starts past the end.
async fn prepare(
    path: &Path,
    range: Option<&HeaderValue>,
) -> ServiceResult<Result<Prepared, u64>> {
    let mut file = File::open(path).await?;
    let size = file.metadata().await?.len();

    let (status, start, length) = match range.map(|value| parse_range_header(value, size)) {
        Some(Some((start, _))) if start >= size => return Ok(Err(size)),
        Some(Some((start, end))) => {
            let end = end.min(size - 1);
            (StatusCode::PARTIAL_CONTENT, start, end - start + 1)
        }
        _ => (StatusCode::OK, 0, size),
    };
    if start > 0 {
        file.seek(io::SeekFrom::Start(start)).await?;
    }
    Ok(Ok(Prepared {
        file,
        status,
        start,
        length,
        size,
    }))
}

/// Streams the session's result file. The session's workspace moves into the
/// body; on every early return it is released here.
pub async fn build_response(
    session: DownloadSession,
    overrides: &DisplayOverrides,
    range: Option<&HeaderValue>,
) -> ServiceResult<Response> {
    let filename = response_filename(&session, overrides);
    let DownloadSession {
        mut workspace,
        result_file,
        ..
    } = session;

    let opened = async {
        let disposition = header_value(content_disposition(&filename))?;
        let mime = header_value(content_type(&result_file))?;
        let prepared = prepare(&result_file, range).await?;
        Ok::<_, ServiceError>((disposition, mime, prepared))
    }
    .await;
    let (disposition, mime, prepared) = match opened {
        Ok((disposition, mime, Ok(prepared))) => (disposition, mime, prepared),
        Ok((_, _, Err(size))) => {
            workspace.cleanup_in_background();
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            return Ok(response);
        }
        Err(err) => {
            workspace.cleanup_in_background();
            return Err(err);
        }
    };
    let Prepared {
        file,
        status,
        start,
        length,
        size,
    } = prepared;

    info!(filename, size, status = status.as_u16(), "streaming download");
    let body = Body::from_stream(CleanupStream::new(file.take(length), workspace));

    let mut response = (status, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    headers.insert(header::CONTENT_TYPE, mime);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if status == StatusCode::PARTIAL_CONTENT {
        headers.insert(
            header::CONTENT_RANGE,
            header_value(format!("bytes {}-{}/{}", start, start + length - 1, size))?,
        );
    }
    Ok(response)
}
