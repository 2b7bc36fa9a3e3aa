// Resolver configuration

use serde::{Deserialize, Serialize};

/// Media source configuration for the resolver facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Preferred subtitle/audio language (ISO 639-1).
    pub preferred_language: Option<String>,
    /// Root for relative local media paths.
    pub media_root: String,
    /// Root directory holding filler presets (one subdirectory per preset).
    pub filler_root: String,
    /// TTL for cached resolutions without an explicit expiry (seconds).
    pub url_cache_seconds: u64,
    pub plex: Option<ServerSourceConfig>,
    pub jellyfin: Option<ServerSourceConfig>,
    pub emby: Option<ServerSourceConfig>,
    /// yt-dlp extractor service endpoint; the token field may stay empty.
    pub youtube: Option<ServerSourceConfig>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            preferred_language: None,
            media_root: "./media".to_string(),
            filler_root: "./media/filler".to_string(),
            url_cache_seconds: 300,
            plex: None,
            jellyfin: None,
            emby: None,
            youtube: None,
        }
    }
}

/// Connection settings for a Plex/Jellyfin/Emby style media server.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerSourceConfig {
    pub base_url: String,
    pub token: String,
    /// Request timeout (seconds).
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_timeout() -> u64 {
    15
}

impl std::fmt::Debug for ServerSourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSourceConfig")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}
