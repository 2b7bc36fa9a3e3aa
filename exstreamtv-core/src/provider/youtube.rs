// YouTube resolution
//
// Stream URLs come from an external extractor service (yt-dlp behind HTTP);
// the returned URLs are short-lived, so the expiry is propagated for the
// facade's refresh-on-demand cache.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::models::MediaRef;

use super::config::ServerSourceConfig;
use super::error::{ResolveError, Result};
use super::{ResolvedSource, SourceResolver, SourceUriKind};

/// Extractor response: one resolved format.
#[derive(Debug, Deserialize)]
struct ExtractorResponse {
    url: String,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    vcodec: Option<String>,
    #[serde(default)]
    acodec: Option<String>,
    /// Unix seconds when the URL expires.
    #[serde(default)]
    expires: Option<i64>,
    #[serde(default)]
    is_live: bool,
}

/// Resolves `MediaRef::YouTube` video ids through the configured extractor.
pub struct YouTubeResolver {
    config: ServerSourceConfig,
    client: reqwest::Client,
}

impl YouTubeResolver {
    #[must_use]
    pub fn new(config: ServerSourceConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn extract_url(&self, video_id: &str) -> String {
        format!(
            "{}/extract?id={}",
            self.config.base_url.trim_end_matches('/'),
            video_id
        )
    }
}

fn expiry_to_wall(expires: Option<i64>) -> Option<DateTime<Utc>> {
    expires.and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

#[async_trait]
impl SourceResolver for YouTubeResolver {
    fn kind(&self) -> &'static str {
        "youtube"
    }

    async fn resolve(&self, media_ref: &MediaRef) -> Result<ResolvedSource> {
        let MediaRef::YouTube { handle } = media_ref else {
            return Err(ResolveError::Ambiguous(format!(
                "youtube resolver given {} ref",
                media_ref.kind_str()
            )));
        };

        let response = self
            .client
            .get(self.extract_url(handle))
            .send()
            .await
            .map_err(|e| ResolveError::from_http("youtube", &e))?
            .error_for_status()
            .map_err(|e| ResolveError::from_http("youtube", &e))?;
        let extracted: ExtractorResponse = response
            .json()
            .await
            .map_err(|e| ResolveError::from_http("youtube", &e))?;

        Ok(ResolvedSource {
            primary_uri: extracted.url,
            kind: if extracted.is_live {
                SourceUriKind::HttpLive
            } else {
                SourceUriKind::Http
            },
            duration_known: extracted.duration,
            container_hint: extracted.ext,
            video_codec: extracted.vcodec,
            audio_codec: extracted.acodec,
            subtitles: Vec::new(),
            audio_streams: Vec::new(),
            picks: super::StreamPicks::default(),
            direct_play_candidate: false,
            expires_at: expiry_to_wall(extracted.expires),
        })
    }
}
