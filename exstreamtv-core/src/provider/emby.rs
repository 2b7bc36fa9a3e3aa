// Emby media server resolution
//
// Emby shares the Jellyfin API shape but mounts it under /emby.

use async_trait::async_trait;
use serde_json::Value;

use crate::models::MediaRef;

use super::config::ServerSourceConfig;
use super::error::{ResolveError, Result};
use super::jellyfin::{parse_media_streams, ticks_to_secs};
use super::{ResolvedSource, SourceResolver, SourceUriKind};

/// Resolves `MediaRef::Emby` item ids to static stream URLs.
pub struct EmbyResolver {
    config: ServerSourceConfig,
    client: reqwest::Client,
}

impl EmbyResolver {
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
            "{}/emby/Items/{}?api_key={}",
            self.config.base_url.trim_end_matches('/'),
            item_id,
            self.config.token
        )
    }

    fn stream_url(&self, item_id: &str) -> String {
        format!(
            "{}/emby/Videos/{}/stream?static=true&api_key={}",
            self.config.base_url.trim_end_matches('/'),
            item_id,
            self.config.token
        )
    }
}

#[async_trait]
impl SourceResolver for EmbyResolver {
    fn kind(&self) -> &'static str {
        "emby"
    }

    async fn resolve(&self, media_ref: &MediaRef) -> Result<ResolvedSource> {
        let MediaRef::Emby { handle } = media_ref else {
            return Err(ResolveError::Ambiguous(format!(
                "emby resolver given {} ref",
                media_ref.kind_str()
            )));
        };

        let response = self
            .client
            .get(self.item_url(handle))
            .send()
            .await
            .map_err(|e| ResolveError::from_http("emby", &e))?
            .error_for_status()
            .map_err(|e| ResolveError::from_http("emby", &e))?;
        let item: Value = response
            .json()
            .await
            .map_err(|e| ResolveError::from_http("emby", &e))?;

        if item["Id"].is_null() {
            return Err(ResolveError::NotFound(format!("emby item {handle}")));
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
