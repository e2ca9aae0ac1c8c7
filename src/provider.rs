//! Upstream metadata and stream provider.
//!
//! The rest of the crate only sees the [`MediaProvider`] trait; the
//! production implementation talks to the innertube player endpoint with the
//! ANDROID client context, which hands back direct stream URLs.

use std::pin::Pin;
use std::sync::LazyLock;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use regex::Regex;
use serde::Deserialize;

use crate::error::DownloadError;

/// Outbound identity used for every upstream request. A compatibility shim
/// against consent interstitials and bot heuristics, not a security control.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64)";
pub const CONSENT_COOKIE: &str = "CONSENT=YES+1";

const PLAYER_ENDPOINT: &str = "https://www.youtube.com/youtubei/v1/player";
const CLIENT_NAME: &str = "ANDROID";
const CLIENT_VERSION: &str = "19.09.37";

static VIDEO_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:youtube\.com/(?:watch\?(?:[^#]*&)?v=|shorts/|embed/)|youtu\.be/)([A-Za-z0-9_-]{11})(?:[^A-Za-z0-9_-]|$)",
    )
    .unwrap()
});

/// Extracts the 11-character video id from the caller-supplied URL.
/// Purely syntactic; performs no network access.
pub fn extract_video_id(identifier: &str) -> Option<String> {
    VIDEO_ID_RE
        .captures(identifier)
        .map(|caps| caps[1].to_string())
}

/// One quality/container variant of the resource as reported upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFormat {
    pub itag: u32,
    pub quality_label: Option<String>,
    pub audio_quality: Option<String>,
    pub mime_type: Option<String>,
    pub content_length: Option<u64>,
    pub url: Option<String>,
}

impl StreamFormat {
    /// Short container tag derived from the mime type, e.g. "mp4".
    pub fn container(&self) -> &str {
        self.mime_type
            .as_deref()
            .and_then(|mime| mime.split(';').next())
            .and_then(|kind| kind.split('/').nth(1))
            .unwrap_or("mp4")
    }
}

#[derive(Debug, Clone)]
pub struct VideoInfo {
    pub title: String,
    pub formats: Vec<StreamFormat>,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, DownloadError>> + Send>>;

/// Black-box boundary to the remote resource service.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Syntactic identifier check; must not touch the network.
    fn validate(&self, identifier: &str) -> bool;

    /// Title plus candidate encoding list.
    async fn basic_info(&self, identifier: &str) -> Result<VideoInfo, DownloadError>;

    /// Full metadata, used when a download needs the exact format entry.
    async fn full_info(&self, identifier: &str) -> Result<VideoInfo, DownloadError>;

    /// Opens the byte stream for a chosen format.
    async fn open_stream(&self, format: &StreamFormat) -> Result<ByteStream, DownloadError>;
}

// Wire shapes of the player response; only the fields we consume.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerResponse {
    video_details: Option<VideoDetails>,
    streaming_data: Option<StreamingData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoDetails {
    title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamingData {
    #[serde(default)]
    formats: Vec<RawFormat>,
    #[serde(default)]
    adaptive_formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFormat {
    itag: u32,
    mime_type: Option<String>,
    quality_label: Option<String>,
    audio_quality: Option<String>,
    // The player endpoint reports byte counts as decimal strings.
    content_length: Option<String>,
    url: Option<String>,
}

impl From<RawFormat> for StreamFormat {
    fn from(raw: RawFormat) -> Self {
        StreamFormat {
            itag: raw.itag,
            quality_label: raw.quality_label,
            audio_quality: raw.audio_quality,
            mime_type: raw.mime_type,
            content_length: raw.content_length.and_then(|len| len.parse().ok()),
            url: raw.url,
        }
    }
}

/// Normalizes the two shapes the provider may return into one list: the
/// muxed format list when present, otherwise the adaptive fallback.
fn normalize(response: PlayerResponse) -> Result<VideoInfo, DownloadError> {
    let title = response
        .video_details
        .map(|details| details.title)
        .unwrap_or_default();
    let streaming = response
        .streaming_data
        .ok_or_else(|| DownloadError::UpstreamUnavailable("no streaming data".into()))?;
    let raw = if streaming.formats.is_empty() {
        streaming.adaptive_formats
    } else {
        streaming.formats
    };
    Ok(VideoInfo {
        title,
        formats: raw.into_iter().map(StreamFormat::from).collect(),
    })
}

pub struct InnertubeProvider {
    client: reqwest::Client,
}

impl InnertubeProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn fetch_player(&self, video_id: &str) -> Result<VideoInfo, DownloadError> {
        let body = serde_json::json!({
            "context": {
                "client": {
                    "clientName": CLIENT_NAME,
                    "clientVersion": CLIENT_VERSION,
                    "androidSdkVersion": 30,
                    "hl": "en",
                }
            },
            "videoId": video_id,
            "contentCheckOk": true,
            "racyCheckOk": true,
        });

        let response = self
            .client
            .post(PLAYER_ENDPOINT)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::COOKIE, CONSENT_COOKIE)
            .json(&body)
            .send()
            .await
            .map_err(|err| DownloadError::UpstreamUnavailable(err.to_string()))?
            .error_for_status()
            .map_err(|err| DownloadError::UpstreamUnavailable(err.to_string()))?;

        let parsed: PlayerResponse = response
            .json()
            .await
            .map_err(|err| DownloadError::UpstreamUnavailable(err.to_string()))?;
        normalize(parsed)
    }
}

impl Default for InnertubeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaProvider for InnertubeProvider {
    fn validate(&self, identifier: &str) -> bool {
        extract_video_id(identifier).is_some()
    }

    async fn basic_info(&self, identifier: &str) -> Result<VideoInfo, DownloadError> {
        let video_id = extract_video_id(identifier).ok_or(DownloadError::InvalidIdentifier)?;
        self.fetch_player(&video_id).await
    }

    async fn full_info(&self, identifier: &str) -> Result<VideoInfo, DownloadError> {
        // The player endpoint returns everything in one call; full metadata
        // is the same fetch, kept as a separate operation for the seam.
        self.basic_info(identifier).await
    }

    async fn open_stream(&self, format: &StreamFormat) -> Result<ByteStream, DownloadError> {
        let url = format
            .url
            .clone()
            .ok_or_else(|| DownloadError::UpstreamUnavailable("format has no url".into()))?;

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::COOKIE, CONSENT_COOKIE)
            .send()
            .await
            .map_err(|err| DownloadError::UpstreamUnavailable(err.to_string()))?
            .error_for_status()
            .map_err(|err| DownloadError::UpstreamUnavailable(err.to_string()))?;

        let stream = response
            .bytes_stream()
            .map_err(|err| DownloadError::UpstreamStream(err.to_string()));
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_id_from_watch_urls() {
        assert_eq!(
            extract_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            Some("dQw4w9WgXcQ".to_string())
        );
        assert_eq!(
            extract_video_id("https://www.youtube.com/watch?list=PL1&v=dQw4w9WgXcQ&t=1s"),
            Some("dQw4w9WgXcQ".to_string())
        );
    }

    #[test]
    fn extracts_id_from_short_urls() {
        assert_eq!(
            extract_video_id("https://youtu.be/dQw4w9WgXcQ"),
            Some("dQw4w9WgXcQ".to_string())
        );
        assert_eq!(
            extract_video_id("https://www.youtube.com/shorts/dQw4w9WgXcQ"),
            Some("dQw4w9WgXcQ".to_string())
        );
        assert_eq!(
            extract_video_id("https://www.youtube.com/embed/dQw4w9WgXcQ"),
            Some("dQw4w9WgXcQ".to_string())
        );
    }

    #[test]
    fn rejects_malformed_identifiers() {
        assert_eq!(extract_video_id("not a url"), None);
        assert_eq!(extract_video_id("https://example.com/watch?v=dQw4w9WgXcQ"), None);
        assert_eq!(extract_video_id("https://youtu.be/short"), None);
        assert_eq!(extract_video_id(""), None);
    }

    #[test]
    fn container_is_derived_from_mime_type() {
        let format = StreamFormat {
            itag: 18,
            quality_label: Some("360p".into()),
            audio_quality: None,
            mime_type: Some("video/webm; codecs=\"vp9\"".into()),
            content_length: Some(1),
            url: None,
        };
        assert_eq!(format.container(), "webm");
    }

    #[test]
    fn normalize_prefers_muxed_formats() {
        let response: PlayerResponse = serde_json::from_value(serde_json::json!({
            "videoDetails": { "title": "clip" },
            "streamingData": {
                "formats": [
                    { "itag": 18, "mimeType": "video/mp4", "qualityLabel": "360p",
                      "contentLength": "5242880", "url": "https://cdn/18" }
                ],
                "adaptiveFormats": [
                    { "itag": 137, "mimeType": "video/mp4", "qualityLabel": "1080p",
                      "contentLength": "99", "url": "https://cdn/137" }
                ]
            }
        }))
        .unwrap();

        let info = normalize(response).unwrap();
        assert_eq!(info.title, "clip");
        assert_eq!(info.formats.len(), 1);
        assert_eq!(info.formats[0].itag, 18);
        assert_eq!(info.formats[0].content_length, Some(5_242_880));
    }

    #[test]
    fn normalize_falls_back_to_adaptive_formats() {
        let response: PlayerResponse = serde_json::from_value(serde_json::json!({
            "videoDetails": { "title": "clip" },
            "streamingData": {
                "adaptiveFormats": [
                    { "itag": 140, "mimeType": "audio/mp4", "audioQuality": "AUDIO_QUALITY_MEDIUM",
                      "contentLength": "1024", "url": "https://cdn/140" }
                ]
            }
        }))
        .unwrap();

        let info = normalize(response).unwrap();
        assert_eq!(info.formats.len(), 1);
        assert_eq!(info.formats[0].itag, 140);
        assert_eq!(
            info.formats[0].audio_quality.as_deref(),
            Some("AUDIO_QUALITY_MEDIUM")
        );
    }

    #[test]
    fn normalize_without_streaming_data_is_upstream_failure() {
        let response: PlayerResponse =
            serde_json::from_value(serde_json::json!({ "videoDetails": { "title": "gone" } }))
                .unwrap();
        assert!(matches!(
            normalize(response),
            Err(DownloadError::UpstreamUnavailable(_))
        ));
    }
}
