// Media resolution
//
// Turns a MediaRef into a concrete playable source plus subtitle/audio picks.
// One resolver per source kind behind a single facade; the streaming core
// never interprets resolver handles.

pub mod archive_org;
pub mod config;
pub mod emby;
pub mod error;
pub mod jellyfin;
pub mod local;
pub mod picks;
pub mod plex;
pub mod resolver;
pub mod youtube;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::MediaRef;

pub use config::ProvidersConfig;
pub use error::{ResolveError, Result};
pub use picks::{pick_streams, AudioStream, StreamPicks, SubtitleStream};
pub use resolver::MediaResolver;

/// How the primary URI is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceUriKind {
    /// Seekable local file.
    File,
    /// Seekable HTTP VOD.
    Http,
    /// Non-seekable live HTTP; resume offsets do not apply.
    HttpLive,
}

impl SourceUriKind {
    #[must_use]
    pub fn is_seekable(self) -> bool {
        !matches!(self, Self::HttpLive)
    }

    #[must_use]
    pub fn is_http(self) -> bool {
        matches!(self, Self::Http | Self::HttpLive)
    }
}

/// A concrete playable source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub primary_uri: String,
    pub kind: SourceUriKind,
    /// Seconds, where the source kind can know it.
    pub duration_known: Option<f64>,
    pub container_hint: Option<String>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    #[serde(default)]
    pub subtitles: Vec<SubtitleStream>,
    #[serde(default)]
    pub audio_streams: Vec<AudioStream>,
    /// Filled by the facade from the stream lists.
    #[serde(default)]
    pub picks: StreamPicks,
    pub direct_play_candidate: bool,
    /// Short-lived URLs carry their expiry; the facade refreshes on demand.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ResolvedSource {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// One source kind's resolution backend.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Kind discriminator; must match [`MediaRef::kind_str`].
    fn kind(&self) -> &'static str;

    async fn resolve(&self, media_ref: &MediaRef) -> Result<ResolvedSource>;

    /// Refresh expired credentials. Called at most once per resolve attempt.
    async fn refresh_auth(&self) -> Result<()> {
        Ok(())
    }
}
