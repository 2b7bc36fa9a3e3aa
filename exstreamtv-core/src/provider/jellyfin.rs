// Jellyfin media server resolution

use async_trait::async_trait;
use serde_json::Value;

use crate::models::MediaRef;

use super::config::ServerSourceConfig;
use super::error::{ResolveError, Result};
use super::picks::{AudioStream, SubtitleStream};
use super::{ResolvedSource, SourceResolver, SourceUriKind};

/// Resolves `MediaRef::Jellyfin` item ids to static stream URLs.
pub struct JellyfinResolver {
    config: ServerSourceConfig,
    client: reqwest::Client,
}

impl JellyfinResolver {
    #[must_use]
    pub fn new(config: ServerSourceConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn item_url(&self, item_id: &str) -> String {
        format!(
            "{}/Items/{}?api_key={}",
            self.config.base_url.trim_end_matches('/'),
            item_id,
            self.config.token
        )
    }

    fn stream_url(&self, item_id: &str) -> String {
        format!(
            "{}/Videos/{}/stream?static=true&api_key={}",
            self.config.base_url.trim_end_matches('/'),
            item_id,
            self.config.token
        )
    }
}

/// Ticks are 100ns units in the Jellyfin/Emby API surface.
pub(crate) fn ticks_to_secs(ticks: i64) -> f64 {
    ticks as f64 / 10_000_000.0
}

/// Parse a Jellyfin/Emby MediaStreams array into pickable streams.
pub(crate) fn parse_media_streams(item: &Value) -> (Vec<SubtitleStream>, Vec<AudioStream>) {
    let mut subtitles = Vec::new();
    let mut audio = Vec::new();
    let streams = item["MediaStreams"].as_array().cloned().unwrap_or_default();
    for s in streams {
        let index = s["Index"].as_u64().unwrap_or(0) as u32;
        let language = s["Language"].as_str().map(String::from);
        let codec = s["Codec"].as_str().unwrap_or_default().to_string();
        let default = s["IsDefault"].as_bool().unwrap_or(false);
        match s["Type"].as_str() {
            Some("Audio") => audio.push(AudioStream {
                index,
                language,
                codec,
                channels: s["Channels"].as_u64().unwrap_or(2) as u32,
                default,
            }),
            Some("Subtitle") => subtitles.push(SubtitleStream {
                index,
                language,
                is_text: s["IsTextSubtitleStream"].as_bool().unwrap_or(false),
                codec,
                default,
            }),
            _ => {}
        }
    }
    (subtitles, audio)
}

#[async_trait]
impl SourceResolver for JellyfinResolver {
    fn kind(&self) -> &'static str {
        "jellyfin"
    }

    async fn resolve(&self, media_ref: &MediaRef) -> Result<ResolvedSource> {
        let MediaRef::Jellyfin { handle } = media_ref else {
            return Err(ResolveError::Ambiguous(format!(
                "jellyfin resolver given {} ref",
                media_ref.kind_str()
            )));
        };

        let response = self
            .client
            .get(self.item_url(handle))
            .send()
            .await
            .map_err(|e| ResolveError::from_http("jellyfin", &e))?
            .error_for_status()
            .map_err(|e| ResolveError::from_http("jellyfin", &e))?;
        let item: Value = response
            .json()
            .await
            .map_err(|e| ResolveError::from_http("jellyfin", &e))?;

        if item["Id"].is_null() {
            return Err(ResolveError::NotFound(format!("jellyfin item {handle}")));
        }

        let (subtitles, audio_streams) = parse_media_streams(&item);
        let video_codec = item["MediaStreams"]
            .as_array()
            .and_then(|streams| {
                streams
                    .iter()
                    .find(|s| s["Type"].as_str() == Some("Video"))
                    .and_then(|s| s["Codec"].as_str())
            })
            .map(String::from);

        Ok(ResolvedSource {
            primary_uri: self.stream_url(handle),
            kind: SourceUriKind::Http,
            duration_known: item["RunTimeTicks"].as_i64().map(ticks_to_secs),
            container_hint: item["Container"].as_str().map(String::from),
            direct_play_candidate: matches!(video_codec.as_deref(), Some("h264" | "hevc")),
            video_codec,
            audio_codec: audio_streams.first().map(|a| a.codec.clone()),
            subtitles,
            audio_streams,
            picks: super::StreamPicks::default(),
            expires_at: None,
        })
    }
}
