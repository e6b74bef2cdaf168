#![forbid(unsafe_code)]

//! Normalized metadata records returned by the API.
//!
//! The engine hands back a loosely typed payload ([`RawInfo`]); the structs in
//! this module are what clients actually see. Field names on the wire keep the
//! snake_case layout existing clients already parse.

use std::collections::HashMap;

use serde::{Serialize, Serializer};

use crate::engine::{RawChapter, RawFormat, RawInfo};

/// Extra bytes added to a video-only filesize to account for the audio track.
const AUDIO_SIZE_ALLOWANCE: f64 = 1.1;

/// Display family of a video codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecFamily {
    H264,
    H265,
    Vp9,
    Av1,
    Other(String),
}

impl CodecFamily {
    pub fn as_str(&self) -> &str {
        match self {
            Self::H264 => "h264",
            Self::H265 => "h265",
            Self::Vp9 => "vp9",
            Self::Av1 => "av1",
            Self::Other(label) => label,
        }
    }
}

impl Serialize for CodecFamily {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// Checked top to bottom; the first token found in the lowercased codec wins.
const CODEC_TOKENS: &[(&str, CodecFamily)] = &[
    ("avc", CodecFamily::H264),
    ("h264", CodecFamily::H264),
    ("hevc", CodecFamily::H265),
    ("hev", CodecFamily::H265),
    ("hvc", CodecFamily::H265),
    ("h265", CodecFamily::H265),
    ("vp09", CodecFamily::Vp9),
    ("vp9", CodecFamily::Vp9),
    ("av01", CodecFamily::Av1),
    ("av1", CodecFamily::Av1),
];

/// Maps a raw codec string such as `avc1.64001f` to its display family.
pub fn classify_codec(raw: &str) -> CodecFamily {
    let lowered = raw.trim().to_ascii_lowercase();
    if let Some((_, family)) = CODEC_TOKENS
        .iter()
        .find(|(token, _)| lowered.contains(token))
    {
        return family.clone();
    }
    let base = lowered.split('.').next().unwrap_or("").trim();
    if base.is_empty() {
        CodecFamily::Other("unknown".to_string())
    } else {
        CodecFamily::Other(base.to_string())
    }
}

/// One selectable vertical resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quality {
    pub height: i64,
    pub label: String,
    #[serde(rename = "codec")]
    pub codec_family: CodecFamily,
    #[serde(rename = "vcodec")]
    pub raw_codec: String,
    #[serde(rename = "filesize", skip_serializing_if = "Option::is_none")]
    pub estimated_bytes: Option<u64>,
}

/// Chapter boundaries in seconds plus pre-rendered timestamps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chapter {
    pub index: usize,
    pub title: String,
    #[serde(rename = "start_time")]
    pub start_seconds: f64,
    #[serde(rename = "end_time")]
    pub end_seconds: f64,
    pub start_formatted: String,
    pub end_formatted: String,
    #[serde(rename = "duration")]
    pub duration_seconds: f64,
    pub duration_formatted: String,
}

/// Compatibility summary kept for older clients that read `formats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatSummary {
    pub format_id: String,
    pub ext: String,
    pub resolution: String,
    pub height: i64,
    pub vcodec: String,
    pub acodec: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataRecord {
    pub id: Option<String>,
    pub title: Option<String>,
    #[serde(rename = "thumbnail")]
    pub thumbnail_url: Option<String>,
    #[serde(rename = "duration")]
    pub duration_seconds: Option<f64>,
    pub channel: Option<String>,
    pub view_count: Option<i64>,
    pub upload_date: Option<String>,
    pub formats: Vec<FormatSummary>,
    #[serde(rename = "available_qualities")]
    pub qualities: Vec<Quality>,
    pub chapters: Option<Vec<Chapter>>,
}

impl MetadataRecord {
    pub fn from_info(info: &RawInfo) -> Self {
        let qualities = collect_qualities(info.formats.as_deref().unwrap_or_default());
        let formats = qualities
            .first()
            .map(|top| {
                vec![FormatSummary {
                    format_id: "best".to_string(),
                    ext: "mp4".to_string(),
                    resolution: format!("{}p", top.height),
                    height: top.height,
                    vcodec: "h264".to_string(),
                    acodec: "aac".to_string(),
                }]
            })
            .unwrap_or_default();

        Self {
            id: info.id.clone(),
            title: info.title.clone(),
            thumbnail_url: info.thumbnail.clone(),
            duration_seconds: info.duration,
            channel: info.channel.clone(),
            view_count: info.view_count,
            upload_date: info.upload_date.clone(),
            formats,
            qualities,
            chapters: extract_chapters(info.chapters.as_deref().unwrap_or_default()),
        }
    }
}

/// Header data for a playlist, resolved without visiting each entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaylistSummary {
    pub id: Option<String>,
    pub title: String,
    pub channel: String,
    pub video_count: usize,
    pub thumbnail: Option<String>,
}

impl PlaylistSummary {
    pub fn from_info(info: &RawInfo) -> Self {
        let video_count = match &info.entries {
            Some(entries) => entries.iter().filter(|entry| entry.is_some()).count(),
            None => info.playlist_count.unwrap_or(0).max(0) as usize,
        };
        let thumbnail = info
            .thumbnails
            .as_ref()
            .and_then(|thumbnails| thumbnails.first())
            .and_then(|thumbnail| thumbnail.url.clone())
            .or_else(|| info.thumbnail.clone());

        Self {
            id: info.id.clone(),
            title: info
                .title
                .clone()
                .unwrap_or_else(|| "Unknown Playlist".to_string()),
            channel: info
                .channel
                .clone()
                .or_else(|| info.uploader.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            video_count,
            thumbnail,
        }
    }
}

/// One entry per distinct height, tallest first. The first format seen at a
/// height decides the codec; the size estimate tracks the largest file seen.
pub fn collect_qualities(formats: &[RawFormat]) -> Vec<Quality> {
    let mut qualities: Vec<Quality> = Vec::new();
    let mut slot_by_height: HashMap<i64, usize> = HashMap::new();
    let mut best_size: HashMap<i64, f64> = HashMap::new();

    for format in formats {
        let (Some(height), Some(codec)) = (format.height, format.video_codec()) else {
            continue;
        };
        if let Some(size) = format.best_filesize() {
            let best = best_size.entry(height).or_insert(size);
            if size > *best {
                *best = size;
            }
        }
        if slot_by_height.contains_key(&height) {
            continue;
        }
        slot_by_height.insert(height, qualities.len());
        qualities.push(Quality {
            height,
            label: format!("{height}p"),
            codec_family: classify_codec(codec),
            raw_codec: codec.to_string(),
            estimated_bytes: None,
        });
    }

    for quality in &mut qualities {
        quality.estimated_bytes = best_size
            .get(&quality.height)
            .map(|size| (size * AUDIO_SIZE_ALLOWANCE) as u64);
    }
    // sort_by is stable, so equal heights keep their discovery order.
    qualities.sort_by(|a, b| b.height.cmp(&a.height));
    qualities
}

/// `None` when the source has no chapters.
pub fn extract_chapters(raw: &[RawChapter]) -> Option<Vec<Chapter>> {
    if raw.is_empty() {
        return None;
    }
    let chapters = raw
        .iter()
        .enumerate()
        .map(|(index, chapter)| {
            let start = chapter.start_time.unwrap_or(0.0);
            let end = chapter.end_time.unwrap_or(0.0);
            let duration = end - start;
            Chapter {
                index,
                title: chapter
                    .title
                    .clone()
                    .unwrap_or_else(|| format!("Chapter {}", index + 1)),
                start_seconds: start,
                end_seconds: end,
                start_formatted: format_timestamp(chapter.start_time),
                end_formatted: format_timestamp(chapter.end_time),
                duration_seconds: duration,
                duration_formatted: format_timestamp(Some(duration)),
            }
        })
        .collect();
    Some(chapters)
}

/// Renders seconds as `HH:MM:SS`, or `MM:SS` below one hour.
pub fn format_timestamp(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds else {
        return "00:00".to_string();
    };
    let total = seconds.max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn format(height: i64, vcodec: &str, filesize: Option<f64>) -> RawFormat {
        RawFormat {
            format_id: Some(format!("{height}-{vcodec}")),
            height: Some(height),
            vcodec: Some(vcodec.into()),
            filesize,
            filesize_approx: None,
        }
    }

    #[test]
    fn classify_codec_known_families() {
        let cases = [
            ("avc1.64001f", CodecFamily::H264),
            ("hev1.1.6.L93.90", CodecFamily::H265),
            ("vp09.00.10.08", CodecFamily::Vp9),
            ("av01.0.04M.08", CodecFamily::Av1),
            ("theora", CodecFamily::Other("theora".into())),
        ];
        for (raw, expected) in cases {
            assert_eq!(classify_codec(raw), expected, "{raw}");
            assert_eq!(classify_codec(&raw.to_uppercase()), expected, "{raw} uppercase");
        }
    }

    #[test]
    fn classify_codec_fallbacks() {
        assert_eq!(classify_codec("HVC1.2.4.L120"), CodecFamily::H265);
        assert_eq!(classify_codec("vp9"), CodecFamily::Vp9);
        assert_eq!(classify_codec(""), CodecFamily::Other("unknown".into()));
        assert_eq!(classify_codec("mp4v.20.3").as_str(), "mp4v");
    }

    #[test]
    fn qualities_dedupe_by_height() {
        let formats = vec![
            format(1080, "avc1.640028", Some(1000.0)),
            format(720, "avc1.4d401f", None),
            format(1080, "vp9", Some(3000.0)),
            format(480, "vp9", Some(100.0)),
        ];
        let qualities = collect_qualities(&formats);
        let heights: Vec<i64> = qualities.iter().map(|q| q.height).collect();
        assert_eq!(heights, vec![1080, 720, 480]);
        assert_eq!(qualities[0].codec_family, CodecFamily::H264);
        assert_eq!(qualities[0].estimated_bytes, Some(3300));
        assert_eq!(qualities[1].estimated_bytes, None);
        assert_eq!(qualities[0].label, "1080p");
    }

    #[test]
    fn qualities_skip_audio_and_heightless_streams() {
        let mut audio = format(0, "none", Some(10.0));
        audio.height = None;
        let formats = vec![
            audio,
            format(360, "none", None),
            RawFormat {
                height: Some(240),
                vcodec: None,
                ..RawFormat::default()
            },
            format(144, "avc1", None),
        ];
        let qualities = collect_qualities(&formats);
        assert_eq!(qualities.len(), 1);
        assert_eq!(qualities[0].height, 144);
    }

    #[test]
    fn qualities_sorted_descending_from_unsorted_input() {
        let formats = vec![
            format(144, "avc1", None),
            format(2160, "vp9", None),
            format(720, "av01.0.08M.08", None),
        ];
        let heights: Vec<i64> = collect_qualities(&formats)
            .iter()
            .map(|q| q.height)
            .collect();
        assert_eq!(heights, vec![2160, 720, 144]);
    }

    #[test]
    fn format_timestamp_cases() {
        assert_eq!(format_timestamp(Some(125.0)), "02:05");
        assert_eq!(format_timestamp(Some(3725.0)), "01:02:05");
        assert_eq!(format_timestamp(None), "00:00");
        assert_eq!(format_timestamp(Some(59.9)), "00:59");
    }

    #[test]
    fn chapters_default_missing_fields() {
        let raw = vec![
            RawChapter {
                title: Some("Intro".into()),
                start_time: Some(0.0),
                end_time: Some(65.0),
            },
            RawChapter {
                title: None,
                start_time: Some(65.0),
                end_time: None,
            },
        ];
        let chapters = extract_chapters(&raw).unwrap();
        assert_eq!(chapters[0].duration_formatted, "01:05");
        assert_eq!(chapters[1].title, "Chapter 2");
        assert_eq!(chapters[1].end_seconds, 0.0);
        assert_eq!(chapters[1].end_formatted, "00:00");
        assert!(extract_chapters(&[]).is_none());
    }

    #[test]
    fn record_serializes_with_wire_names() {
        let info: RawInfo = serde_json::from_value(json!({
            "id": "abc123",
            "title": "Title",
            "thumbnail": "https://img.test/t.jpg",
            "duration": 90,
            "channel": "Chan",
            "view_count": 7,
            "upload_date": "20240101",
            "formats": [{"height": 720, "vcodec": "avc1.4d401f", "filesize": 1000}]
        }))
        .unwrap();
        let value = serde_json::to_value(MetadataRecord::from_info(&info)).unwrap();
        assert_eq!(value["thumbnail"], "https://img.test/t.jpg");
        assert_eq!(value["available_qualities"][0]["codec"], "h264");
        assert_eq!(value["available_qualities"][0]["filesize"], 1100);
        assert_eq!(value["formats"][0]["resolution"], "720p");
        assert!(value["chapters"].is_null());
    }

    #[test]
    fn playlist_summary_counts_present_entries() {
        let info: RawInfo = serde_json::from_value(json!({
            "_type": "playlist",
            "id": "PL1",
            "uploader": "Someone",
            "thumbnails": [{"url": "https://img.test/p.jpg"}],
            "entries": [{"id": "a"}, null, {"id": "b"}]
        }))
        .unwrap();
        let summary = PlaylistSummary::from_info(&info);
        assert_eq!(summary.video_count, 2);
        assert_eq!(summary.title, "Unknown Playlist");
        assert_eq!(summary.channel, "Someone");
        assert_eq!(summary.thumbnail.as_deref(), Some("https://img.test/p.jpg"));
    }
}
