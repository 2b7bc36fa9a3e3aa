// Plex media server resolution

use async_trait::async_trait;
use serde_json::Value;

use crate::models::MediaRef;

use super::config::ServerSourceConfig;
use super::error::{ResolveError, Result};
use super::picks::{AudioStream, SubtitleStream};
use super::{ResolvedSource, SourceResolver, SourceUriKind};

/// Resolves `MediaRef::Plex` handles (library rating keys) to direct-part
/// stream URLs.
pub struct PlexResolver {
    config: ServerSourceConfig,
    client: reqwest::Client,
}

impl PlexResolver {
    #[must_use]
    pub fn new(config: ServerSourceConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn metadata_url(&self, rating_key: &str) -> String {
        format!(
            "{}/library/metadata/{}?X-Plex-Token={}",
            self.config.base_url.trim_end_matches('/'),
            rating_key,
            self.config.token
        )
    }

    fn stream_url(&self, part_key: &str) -> String {
        format!(
            "{}{}?X-Plex-Token={}",
            self.config.base_url.trim_end_matches('/'),
            part_key,
            self.config.token
        )
    }
}

/// Extract streams from a Plex part: streamType 2 = audio, 3 = subtitle.
fn parse_streams(part: &Value) -> (Vec<SubtitleStream>, Vec<AudioStream>) {
    let mut subtitles = Vec::new();
    let mut audio = Vec::new();
    let streams = part["Stream"].as_array().cloned().unwrap_or_default();
    for s in streams {
        let index = s["index"].as_u64().unwrap_or(0) as u32;
        let language = s["languageTag"].as_str().map(String::from);
        let codec = s["codec"].as_str().unwrap_or_default().to_string();
        let default = s["default"].as_bool().unwrap_or(false);
        match s["streamType"].as_u64() {
            Some(2) => audio.push(AudioStream {
                index,
                language,
                codec,
                channels: s["channels"].as_u64().unwrap_or(2) as u32,
                default,
            }),
            Some(3) => subtitles.push(SubtitleStream {
                index,
                language,
                is_text: matches!(codec.as_str(), "srt" | "subrip" | "ass" | "webvtt"),
                codec,
                default,
            }),
            _ => {}
        }
    }
    (subtitles, audio)
}

#[async_trait]
impl SourceResolver for PlexResolver {
    fn kind(&self) -> &'static str {
        "plex"
    }

    async fn resolve(&self, media_ref: &MediaRef) -> Result<ResolvedSource> {
        let MediaRef::Plex { handle } = media_ref else {
            return Err(ResolveError::Ambiguous(format!(
                "plex resolver given {} ref",
                media_ref.kind_str()
            )));
        };

        let response = self
            .client
            .get(self.metadata_url(handle))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ResolveError::from_http("plex", &e))?;
        let response = response
            .error_for_status()
            .map_err(|e| ResolveError::from_http("plex", &e))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ResolveError::from_http("plex", &e))?;

        let metadata = &body["MediaContainer"]["Metadata"][0];
        if metadata.is_null() {
            return Err(ResolveError::NotFound(format!("plex item {handle}")));
        }
        let media = &metadata["Media"][0];
        let part = &media["Part"][0];
        let part_key = part["key"]
            .as_str()
            .ok_or_else(|| ResolveError::Ambiguous(format!("plex item {handle} has no part")))?;

        let (subtitles, audio_streams) = parse_streams(part);

        Ok(ResolvedSource {
            primary_uri: self.stream_url(part_key),
            kind: SourceUriKind::Http,
            duration_known: media["duration"].as_f64().map(|ms| ms / 1000.0),
            container_hint: part["container"].as_str().map(String::from),
            video_codec: media["videoCodec"].as_str().map(String::from),
            audio_codec: media["audioCodec"].as_str().map(String::from),
            subtitles,
            audio_streams,
            picks: super::StreamPicks::default(),
            direct_play_candidate: matches!(
                media["videoCodec"].as_str(),
                Some("h264" | "hevc")
            ),
            expires_at: None,
        })
    }
}
