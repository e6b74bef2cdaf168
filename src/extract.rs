#![forbid(unsafe_code)]

//! Metadata lookups: URL normalization, cache, engine call, normalization.

use std::sync::Arc;

use tracing::{debug, info};
use url::Url;

use crate::{
    cache::TtlCache,
    engine::{EngineOptions, ExtractMode, ExtractionEngine, PlaylistMode},
    error::{ServiceError, ServiceResult},
    metadata::{MetadataRecord, PlaylistSummary},
};

const CANONICAL_WATCH: &str = "https://www.youtube.com/watch";

/// A URL after normalization plus the content ID it resolved to, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedUrl {
    pub url: String,
    pub content_id: Option<String>,
}

enum Host {
    YouTube,
    ShortLink,
}

fn recognized_host(url: &Url) -> Option<Host> {
    let host = url.host_str()?.to_ascii_lowercase();
    let bare = ["www.", "m.", "music."]
        .iter()
        .find_map(|prefix| host.strip_prefix(prefix))
        .unwrap_or(host.as_str());
    match bare {
        "youtube.com" => Some(Host::YouTube),
        "youtu.be" => Some(Host::ShortLink),
        _ => None,
    }
}

fn valid_id(candidate: &str) -> Option<String> {
    let candidate = candidate.trim();
    let ok = !candidate.is_empty()
        && candidate
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    ok.then(|| candidate.to_string())
}

fn video_id(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?.filter(|segment| !segment.is_empty());
    match recognized_host(url)? {
        Host::ShortLink => valid_id(segments.next()?),
        Host::YouTube => match segments.next()? {
            "watch" => url
                .query_pairs()
                .find(|(key, _)| key == "v")
                .and_then(|(_, value)| valid_id(&value)),
            "shorts" => valid_id(segments.next()?),
            _ => None,
        },
    }
}

/// Canonicalizes recognized video URLs to `https://www.youtube.com/watch?v=<id>`,
/// dropping every other query parameter. Anything else is returned unchanged.
pub fn normalize_url(raw: &str) -> NormalizedUrl {
    let raw = raw.trim();
    let Ok(parsed) = Url::parse(raw) else {
        return NormalizedUrl {
            url: raw.to_string(),
            content_id: None,
        };
    };
    match video_id(&parsed) {
        Some(id) => {
            let mut canonical = Url::parse(CANONICAL_WATCH).unwrap_or(parsed);
            canonical.set_path("/watch");
            canonical.set_fragment(None);
            canonical.query_pairs_mut().clear().append_pair("v", &id);
            NormalizedUrl {
                url: canonical.into(),
                content_id: Some(id),
            }
        }
        None => NormalizedUrl {
            url: raw.to_string(),
            content_id: None,
        },
    }
}

/// Engine front-end for metadata-only requests.
pub struct Extractor {
    engine: Arc<dyn ExtractionEngine>,
    cache: TtlCache<Arc<MetadataRecord>>,
}

impl Extractor {
    pub fn new(engine: Arc<dyn ExtractionEngine>, cache: TtlCache<Arc<MetadataRecord>>) -> Self {
        Self { engine, cache }
    }

    pub fn engine(&self) -> Arc<dyn ExtractionEngine> {
        Arc::clone(&self.engine)
    }

    pub fn cache(&self) -> &TtlCache<Arc<MetadataRecord>> {
        &self.cache
    }

    /// Resolves a single video. Blocks while the engine runs.
    pub fn fetch_info(&self, url: &str) -> ServiceResult<Arc<MetadataRecord>> {
        let normalized = normalize_url(url);
        if let Some(id) = &normalized.content_id {
            if let Some(record) = self.cache.get(id) {
                debug!(id, "metadata cache hit");
                return Ok(record);
            }
        }

        let options = EngineOptions::new(ExtractMode::InfoOnly);
        let raw = self.engine.extract(&normalized.url, &options)?;
        let record = Arc::new(MetadataRecord::from_info(&raw));
        info!(
            url = %normalized.url,
            qualities = record.qualities.len(),
            "extracted metadata"
        );
        if let Some(id) = normalized.content_id {
            self.cache.set(id, Arc::clone(&record));
        }
        Ok(record)
    }

    /// Resolves playlist header data from a flat listing.
    pub fn playlist_info(&self, url: &str) -> ServiceResult<PlaylistSummary> {
        let mut options = EngineOptions::new(ExtractMode::InfoOnly);
        options.playlist = PlaylistMode::Flat;
        let raw = self.engine.extract(url.trim(), &options)?;
        if !raw.is_playlist() {
            return Err(ServiceError::validation("Not a playlist URL"));
        }
        let summary = PlaylistSummary::from_info(&raw);
        info!(url = url.trim(), videos = summary.video_count, "extracted playlist summary");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubEngine;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn normalizes_watch_urls() {
        let normalized = normalize_url("https://m.youtube.com/watch?v=abc123&list=PL1&t=42#frag");
        assert_eq!(normalized.url, "https://www.youtube.com/watch?v=abc123");
        assert_eq!(normalized.content_id.as_deref(), Some("abc123"));

        let music = normalize_url("https://music.youtube.com/watch?feature=share&v=XyZ_-9");
        assert_eq!(music.url, "https://www.youtube.com/watch?v=XyZ_-9");
    }

    #[test]
    fn normalizes_short_links_and_shorts() {
        let short = normalize_url("https://youtu.be/abc123?si=tracking");
        assert_eq!(short.url, "https://www.youtube.com/watch?v=abc123");
        assert_eq!(short.content_id.as_deref(), Some("abc123"));

        let shorts = normalize_url("https://www.youtube.com/shorts/def456");
        assert_eq!(shorts.url, "https://www.youtube.com/watch?v=def456");
    }

    #[test]
    fn unrecognized_urls_pass_through() {
        for raw in [
            "https://vimeo.com/12345",
            "https://www.youtube.com/playlist?list=PL1",
            "https://www.youtube.com/watch?list=PL1",
            "not a url",
            "https://notyoutube.com/watch?v=abc",
        ] {
            let normalized = normalize_url(raw);
            assert_eq!(normalized.url, raw);
            assert_eq!(normalized.content_id, None, "{raw}");
        }
    }

    fn extractor(stub: Arc<StubEngine>) -> Extractor {
        Extractor::new(stub, TtlCache::new(Duration::from_secs(60), 8))
    }

    #[test]
    fn fetch_info_caches_by_content_id() {
        let stub = Arc::new(StubEngine::new(json!({
            "id": "abc123",
            "title": "Clip",
            "formats": [{"height": 720, "vcodec": "avc1"}]
        })));
        let extractor = extractor(Arc::clone(&stub));

        let first = extractor.fetch_info("https://youtu.be/abc123").unwrap();
        let second = extractor
            .fetch_info("https://www.youtube.com/watch?v=abc123&t=5")
            .unwrap();
        assert_eq!(stub.calls(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            stub.last_url().as_deref(),
            Some("https://www.youtube.com/watch?v=abc123")
        );
        let options = stub.last_options().unwrap();
        assert_eq!(options.mode, ExtractMode::InfoOnly);
        assert_eq!(options.playlist, PlaylistMode::SingleItem);
    }

    #[test]
    fn urls_without_content_id_bypass_cache() {
        let stub = Arc::new(StubEngine::new(json!({"id": "v1", "title": "Other"})));
        let extractor = extractor(Arc::clone(&stub));
        extractor.fetch_info("https://vimeo.com/1").unwrap();
        extractor.fetch_info("https://vimeo.com/1").unwrap();
        assert_eq!(stub.calls(), 2);
        assert!(extractor.cache().is_empty());
    }

    #[test]
    fn engine_failure_is_not_cached() {
        let stub = Arc::new(StubEngine::failing("ERROR: Private video"));
        let extractor = extractor(Arc::clone(&stub));
        let err = extractor.fetch_info("https://youtu.be/abc123").unwrap_err();
        assert!(matches!(err, ServiceError::Extraction(ref msg) if msg == "ERROR: Private video"));
        assert!(extractor.cache().is_empty());
    }

    #[test]
    fn playlist_info_uses_flat_listing() {
        let stub = Arc::new(StubEngine::new(json!({
            "_type": "playlist",
            "id": "PL1",
            "title": "Mix",
            "channel": "Chan",
            "entries": [{"id": "a"}, {"id": "b"}, {"id": "c"}]
        })));
        let extractor = extractor(Arc::clone(&stub));
        let summary = extractor
            .playlist_info("https://www.youtube.com/playlist?list=PL1")
            .unwrap();
        assert_eq!(summary.video_count, 3);
        assert_eq!(summary.title, "Mix");
        assert_eq!(stub.last_options().unwrap().playlist, PlaylistMode::Flat);
    }

    #[test]
    fn playlist_info_rejects_single_videos() {
        let stub = Arc::new(StubEngine::new(json!({"id": "abc", "title": "Single"})));
        let err = extractor(stub)
            .playlist_info("https://youtu.be/abc")
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ref msg) if msg == "Not a playlist URL"));
    }
}
