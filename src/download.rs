#![forbid(unsafe_code)]

//! Download orchestration.
//!
//! Each call creates its own [`Workspace`], runs the engine with downloads
//! enabled, locates what it wrote and, for playlists, packs everything into a
//! single archive. The workspace travels inside the returned
//! [`DownloadSession`]; any error before that point drops the guard and the
//! directory goes with it.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use flate2::{Compression, write::GzEncoder};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::{
    chapters,
    engine::{EngineOptions, ExtractionEngine, PlaylistMode, PostProcessor, RawInfo, SubtitleRequest},
    error::{ServiceError, ServiceResult},
    extract::normalize_url,
    metadata::{classify_codec, extract_chapters},
    tools::Transcoder,
    workspace::Workspace,
};

pub const DEFAULT_FORMAT: &str = "best";
pub const ARCHIVE_NAME: &str = "playlist.tar.gz";
const SINGLE_TEMPLATE: &str = "%(title)s.%(ext)s";
const PLAYLIST_TEMPLATE: &str = "%(playlist_index)02d - %(title)s.%(ext)s";
const SUBTITLE_FORMAT: &str = "srt/vtt/best";
const AUTO_SUBTITLE_LANGUAGES: &[&str] = &["en", "en-orig", "en-US", "en-GB"];

const SIDECAR_EXTENSIONS: &[&str] = &["vtt", "srt", "ass"];
const PARTIAL_EXTENSIONS: &[&str] = &["part", "ytdl"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Single,
    Playlist,
}

/// Name parts the engine reported for the downloaded item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayHints {
    pub title: Option<String>,
    pub channel: Option<String>,
    pub resolution: Option<String>,
    pub codec: Option<String>,
}

impl DisplayHints {
    pub fn from_info(info: &RawInfo) -> Self {
        let video = info
            .requested_formats
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find_map(|format| Some((format.height?, format.video_codec()?)))
            .or_else(|| {
                let codec = info
                    .vcodec
                    .as_deref()
                    .filter(|codec| !codec.is_empty() && !codec.eq_ignore_ascii_case("none"))?;
                Some((info.height?, codec))
            });

        Self {
            title: info.title.clone(),
            channel: Some(
                info.channel
                    .clone()
                    .or_else(|| info.uploader.clone())
                    .unwrap_or_else(|| "Unknown".to_string()),
            ),
            resolution: video.map(|(height, _)| format!("{height}p")),
            codec: video.map(|(_, codec)| classify_codec(codec).as_str().to_string()),
        }
    }
}

/// Everything a response needs from a finished download. Owns the workspace,
/// so dropping the session removes every file it lists.
#[derive(Debug)]
pub struct DownloadSession {
    pub kind: SessionKind,
    pub workspace: Workspace,
    pub requested_format: String,
    pub output_files: Vec<PathBuf>,
    pub result_file: PathBuf,
    pub hints: DisplayHints,
}

/// Expands a subtitle request into engine options. `auto` means English.
pub fn subtitle_request(code: &str) -> Option<SubtitleRequest> {
    let code = code.trim();
    if code.is_empty() {
        return None;
    }
    let languages = if code.eq_ignore_ascii_case("auto") {
        AUTO_SUBTITLE_LANGUAGES.iter().map(|lang| lang.to_string()).collect()
    } else {
        vec![
            code.to_string(),
            format!("{code}-orig"),
            format!("{code}-US"),
            format!("{code}-GB"),
        ]
    };
    Some(SubtitleRequest {
        languages,
        format: SUBTITLE_FORMAT.to_string(),
        include_automatic: true,
    })
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn has_extension(path: &Path, set: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| set.iter().any(|candidate| ext.eq_ignore_ascii_case(candidate)))
}

fn is_media_file(path: &Path) -> bool {
    !has_extension(path, SIDECAR_EXTENSIONS) && !has_extension(path, PARTIAL_EXTENSIONS)
}

/// First media file directly inside `dir`, by name.
fn locate_single(dir: &Path) -> io::Result<Option<PathBuf>> {
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() && is_media_file(entry.path()) {
            return Ok(Some(entry.into_path()));
        }
    }
    Ok(None)
}

/// Every media file directly inside `dir`, by name.
fn collect_media(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() && is_media_file(entry.path()) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Writes `files` into a gzip-compressed tar at `archive`, each entry under
/// its base name.
pub fn package_archive(archive: &Path, files: &[PathBuf]) -> io::Result<()> {
    let encoder = GzEncoder::new(File::create(archive)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for file in files {
        let name = file
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "file without a name"))?;
        builder.append_path_with_name(file, name)?;
    }
    builder.into_inner()?.finish()?.sync_all()
}

/// Runs downloads into per-request workspaces.
pub struct Downloader {
    engine: Arc<dyn ExtractionEngine>,
    transcoder: Transcoder,
    workspace_root: PathBuf,
}

impl Downloader {
    pub fn new(
        engine: Arc<dyn ExtractionEngine>,
        transcoder: Transcoder,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            transcoder,
            workspace_root: workspace_root.into(),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn transcoder(&self) -> &Transcoder {
        &self.transcoder
    }

    fn options(&self, format: &str, template: PathBuf, subtitles: Option<&str>) -> EngineOptions {
        let mut options = EngineOptions::download(format, template, self.transcoder.available());
        options.subtitles = subtitles.and_then(subtitle_request);
        if options.subtitles.is_some() && self.transcoder.available() {
            options.post_processors.push(PostProcessor::EmbedSubtitles);
        }
        options
    }

    /// Downloads one video. Blocks until the engine and the optional chapter
    /// step are done.
    pub fn download(
        &self,
        url: &str,
        format: &str,
        subtitles: Option<&str>,
    ) -> ServiceResult<DownloadSession> {
        let workspace = Workspace::create(&self.workspace_root)?;
        let url = normalize_url(url).url;
        let options = self.options(format, workspace.path().join(SINGLE_TEMPLATE), subtitles);

        info!(url, format, workspace = %workspace.path().display(), "starting download");
        let raw = self.engine.extract(&url, &options)?;

        let file = locate_single(workspace.path())?.ok_or_else(|| {
            ServiceError::DownloadFailed("Download completed but file not found".to_string())
        })?;
        let file = match extract_chapters(raw.chapters.as_deref().unwrap_or_default()) {
            Some(chapters) => chapters::embed(&self.transcoder, &file, &chapters, workspace.path()),
            None => file,
        };

        info!(file = %file.display(), "download finished");
        Ok(DownloadSession {
            kind: SessionKind::Single,
            output_files: vec![file.clone()],
            result_file: file,
            requested_format: format.to_string(),
            hints: DisplayHints::from_info(&raw),
            workspace,
        })
    }

    /// Downloads every playlist entry and packs the results into one archive.
    /// Entries that fail are skipped as long as at least one file arrives.
    pub fn download_playlist(
        &self,
        url: &str,
        format: &str,
        subtitles: Option<&str>,
        playlist_title: Option<&str>,
    ) -> ServiceResult<DownloadSession> {
        let workspace = Workspace::create(&self.workspace_root)?;
        let url = url.trim();
        let mut options = self.options(format, workspace.path().join(PLAYLIST_TEMPLATE), subtitles);
        options.playlist = PlaylistMode::Full;
        options.ignore_errors = true;

        info!(url, format, workspace = %workspace.path().display(), "starting playlist download");
        let raw = self.engine.extract(url, &options)?;

        let files = collect_media(workspace.path())?;
        if files.is_empty() {
            return Err(ServiceError::DownloadFailed(
                "No videos were downloaded from the playlist".to_string(),
            ));
        }
        if let Some(entries) = &raw.entries {
            let missing = entries.iter().filter(|entry| entry.is_none()).count();
            if missing > 0 {
                warn!(missing, "some playlist entries failed to download");
            }
        }

        let archive = workspace.path().join(ARCHIVE_NAME);
        package_archive(&archive, &files)?;
        info!(files = files.len(), archive = %archive.display(), "playlist packaged");

        let title = non_blank(raw.title.as_deref())
            .or_else(|| non_blank(playlist_title))
            .map(str::to_string);
        Ok(DownloadSession {
            kind: SessionKind::Playlist,
            output_files: files,
            result_file: archive,
            requested_format: format.to_string(),
            hints: DisplayHints {
                title,
                ..DisplayHints::default()
            },
            workspace,
        })
    }
}
