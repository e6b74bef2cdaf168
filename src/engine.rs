#![forbid(unsafe_code)]

//! Boundary to the external extraction engine (yt-dlp).
//!
//! Every option the service hands to yt-dlp is spelled out in
//! [`EngineOptions`] and rendered into command-line flags in exactly one
//! place, [`EngineOptions::to_args`]. The [`ExtractionEngine`] trait is the
//! seam the rest of the crate talks to; [`YtDlp`] is the production
//! implementation and tests plug in an in-process stub.

use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HTTP_CHUNK_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_FORMAT_SORT: &[&str] = &["ext:mp4:m4a", "res"];

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Failed(String),
    #[error("could not parse extractor output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Whether the engine only resolves metadata or also writes media files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    InfoOnly,
    WithDownload,
}

/// How playlists are walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistMode {
    /// Only the single video referenced by the URL.
    SingleItem,
    /// Every playlist entry, fully resolved.
    Full,
    /// Playlist entries listed but not resolved.
    Flat,
}

/// Post-processing steps yt-dlp runs through the transcoder after download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostProcessor {
    ExtractAudio { codec: String, quality: String },
    EmbedSubtitles,
}

/// Subtitle selection forwarded to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleRequest {
    pub languages: Vec<String>,
    pub format: String,
    pub include_automatic: bool,
}

/// Complete, typed description of one engine invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub mode: ExtractMode,
    pub quiet: bool,
    pub retries: u32,
    pub fragment_retries: u32,
    pub file_access_retries: u32,
    pub socket_timeout: Duration,
    pub http_chunk_size: u64,
    pub playlist: PlaylistMode,
    pub playlist_end: Option<u32>,
    pub ignore_errors: bool,
    pub skip_dash_manifest: bool,
    pub format: Option<String>,
    pub format_sort: Vec<String>,
    pub merge_output_format: Option<String>,
    pub output_template: Option<PathBuf>,
    pub subtitles: Option<SubtitleRequest>,
    pub post_processors: Vec<PostProcessor>,
}

impl EngineOptions {
    /// Baseline options: quiet, fail fast, and for info requests skip every
    /// piece of work that only matters when files are written.
    pub fn new(mode: ExtractMode) -> Self {
        Self {
            mode,
            quiet: true,
            retries: DEFAULT_RETRIES,
            fragment_retries: DEFAULT_RETRIES,
            file_access_retries: DEFAULT_RETRIES,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            http_chunk_size: DEFAULT_HTTP_CHUNK_SIZE,
            playlist: PlaylistMode::SingleItem,
            playlist_end: None,
            ignore_errors: false,
            skip_dash_manifest: mode == ExtractMode::InfoOnly,
            format: None,
            format_sort: Vec::new(),
            merge_output_format: None,
            output_template: None,
            subtitles: None,
            post_processors: Vec::new(),
        }
    }

    /// Options for a download run. `transcoder_available` gates everything
    /// that needs ffmpeg.
    pub fn download(format: &str, output_template: PathBuf, transcoder_available: bool) -> Self {
        let mut options = Self::new(ExtractMode::WithDownload);
        options.format = Some(format.to_string());
        options.format_sort = DEFAULT_FORMAT_SORT.iter().map(|s| s.to_string()).collect();
        options.output_template = Some(output_template);
        if transcoder_available {
            options.merge_output_format = Some("mp4".to_string());
            if is_audio_only_selector(format) {
                options.post_processors.push(PostProcessor::ExtractAudio {
                    codec: "mp3".to_string(),
                    quality: "192".to_string(),
                });
            }
        }
        options
    }

    pub fn downloads_files(&self) -> bool {
        self.mode == ExtractMode::WithDownload
    }

    /// Renders the options as yt-dlp flags. The URL is appended by the caller.
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["--dump-single-json".into()];
        match self.mode {
            ExtractMode::InfoOnly => {
                args.extend(
                    [
                        "--skip-download",
                        "--no-write-subs",
                        "--no-write-auto-subs",
                        "--no-write-thumbnail",
                        "--no-write-info-json",
                    ]
                    .map(String::from),
                );
            }
            // -J implies simulation; this turns the download back on.
            ExtractMode::WithDownload => args.push("--no-simulate".into()),
        }
        if self.quiet {
            args.extend(["--quiet", "--no-warnings", "--no-progress"].map(String::from));
        }

        push_flag(&mut args, "--retries", self.retries);
        push_flag(&mut args, "--fragment-retries", self.fragment_retries);
        push_flag(&mut args, "--file-access-retries", self.file_access_retries);
        push_flag(&mut args, "--socket-timeout", self.socket_timeout.as_secs());
        push_flag(&mut args, "--http-chunk-size", self.http_chunk_size);

        match self.playlist {
            PlaylistMode::SingleItem => args.push("--no-playlist".into()),
            PlaylistMode::Full => args.push("--yes-playlist".into()),
            PlaylistMode::Flat => {
                args.push("--yes-playlist".into());
                args.push("--flat-playlist".into());
            }
        }
        if let Some(end) = self.playlist_end {
            push_flag(&mut args, "--playlist-end", end);
        }
        if self.ignore_errors {
            args.push("--ignore-errors".into());
        }
        if self.skip_dash_manifest {
            push_flag(&mut args, "--extractor-args", "youtube:skip=dash");
        }

        if let Some(format) = &self.format {
            push_flag(&mut args, "--format", format);
        }
        if !self.format_sort.is_empty() {
            push_flag(&mut args, "--format-sort", self.format_sort.join(","));
        }
        if let Some(container) = &self.merge_output_format {
            push_flag(&mut args, "--merge-output-format", container);
        }
        if let Some(template) = &self.output_template {
            push_flag(&mut args, "--output", template.to_string_lossy());
        }

        if let Some(subtitles) = &self.subtitles {
            args.push("--write-subs".into());
            if subtitles.include_automatic {
                args.push("--write-auto-subs".into());
            }
            push_flag(&mut args, "--sub-langs", subtitles.languages.join(","));
            push_flag(&mut args, "--sub-format", &subtitles.format);
        }

        for processor in &self.post_processors {
            match processor {
                PostProcessor::ExtractAudio { codec, quality } => {
                    args.push("--extract-audio".into());
                    push_flag(&mut args, "--audio-format", codec);
                    push_flag(&mut args, "--audio-quality", format!("{quality}K"));
                }
                PostProcessor::EmbedSubtitles => args.push("--embed-subs".into()),
            }
        }

        args
    }
}

fn push_flag(args: &mut Vec<String>, flag: &str, value: impl ToString) {
    args.push(flag.to_string());
    args.push(value.to_string());
}

/// Audio-only selectors trigger the mp3 extraction step.
pub fn is_audio_only_selector(format: &str) -> bool {
    matches!(format, "bestaudio" | "bestaudio/best")
}

/// Anything that can turn a URL plus options into engine metadata.
///
/// When `options.downloads_files()` is true the implementation also writes
/// the media into the directory named by `options.output_template`.
pub trait ExtractionEngine: Send + Sync {
    fn extract(&self, url: &str, options: &EngineOptions) -> Result<RawInfo, EngineError>;
}

/// Production engine: spawns the yt-dlp executable.
#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    ffmpeg_location: Option<PathBuf>,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            ffmpeg_location: None,
        }
    }

    /// Points yt-dlp at a specific transcoder binary for merges and
    /// post-processing.
    pub fn with_ffmpeg_location(mut self, location: Option<PathBuf>) -> Self {
        self.ffmpeg_location = location;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self, url: &str, options: &EngineOptions) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(options.to_args());
        if let Some(location) = &self.ffmpeg_location {
            command.arg("--ffmpeg-location").arg(location);
        }
        command.arg("--").arg(url);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

impl ExtractionEngine for YtDlp {
    fn extract(&self, url: &str, options: &EngineOptions) -> Result<RawInfo, EngineError> {
        debug!(args = ?options.to_args(), url, "invoking yt-dlp");
        let output = self
            .command(url, options)
            .output()
            .map_err(|source| EngineError::Launch {
                program: self.binary.display().to_string(),
                source,
            })?;

        let parsed = parse_single_json(&output.stdout);
        match (output.status.success(), parsed) {
            (true, Ok(info)) => Ok(info),
            // With --ignore-errors a playlist with a few broken entries still
            // exits non-zero after printing the result for the rest.
            (false, Ok(info)) if options.ignore_errors => Ok(info),
            (true, Err(err)) => Err(err),
            (false, _) => Err(EngineError::Failed(failure_message(&output.stderr))),
        }
    }
}

fn parse_single_json(stdout: &[u8]) -> Result<RawInfo, EngineError> {
    // -J prints one JSON document on the last non-empty line.
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("");
    Ok(serde_json::from_str(line)?)
}

/// The last non-empty stderr line is where yt-dlp puts the actual `ERROR:`.
pub fn failure_message(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("extractor exited without output")
        .to_string()
}

/// Subset of yt-dlp's `--dump-single-json` payload the service reads.
/// Everything is optional because extractors differ wildly in what they fill.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawInfo {
    #[serde(default, rename = "_type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub thumbnails: Option<Vec<RawThumbnail>>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub view_count: Option<i64>,
    #[serde(default)]
    pub upload_date: Option<String>,
    #[serde(default)]
    pub height: Option<i64>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub formats: Option<Vec<RawFormat>>,
    #[serde(default)]
    pub requested_formats: Option<Vec<RawFormat>>,
    #[serde(default)]
    pub chapters: Option<Vec<RawChapter>>,
    #[serde(default)]
    pub entries: Option<Vec<Option<serde_json::Value>>>,
    #[serde(default)]
    pub playlist_count: Option<i64>,
}

impl RawInfo {
    pub fn is_playlist(&self) -> bool {
        self.kind.as_deref() == Some("playlist")
            || self.entries.as_ref().is_some_and(|entries| !entries.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    #[serde(default)]
    pub format_id: Option<String>,
    #[serde(default)]
    pub height: Option<i64>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub filesize: Option<f64>,
    #[serde(default)]
    pub filesize_approx: Option<f64>,
}

impl RawFormat {
    /// A usable video stream has a height and a codec other than `none`.
    pub fn video_codec(&self) -> Option<&str> {
        self.vcodec
            .as_deref()
            .map(str::trim)
            .filter(|codec| !codec.is_empty() && !codec.eq_ignore_ascii_case("none"))
    }

    pub fn best_filesize(&self) -> Option<f64> {
        self.filesize
            .or(self.filesize_approx)
            .filter(|size| *size > 0.0)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawChapter {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub end_time: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawThumbnail {
    #[serde(default)]
    pub url: Option<String>,
}
