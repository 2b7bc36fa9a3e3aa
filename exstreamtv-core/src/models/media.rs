use serde::{Deserialize, Serialize};

/// Closed set of media source kinds.
///
/// The opaque `handle` is interpreted only by the matching resolver; the
/// streaming core passes it through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaRef {
    Local { path: String },
    Plex { handle: String },
    Jellyfin { handle: String },
    Emby { handle: String },
    ArchiveOrg { handle: String },
    YouTube { handle: String },
    Filler { preset: String },
}

impl MediaRef {
    #[must_use]
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::Plex { .. } => "plex",
            Self::Jellyfin { .. } => "jellyfin",
            Self::Emby { .. } => "emby",
            Self::ArchiveOrg { .. } => "archive_org",
            Self::YouTube { .. } => "youtube",
            Self::Filler { .. } => "filler",
        }
    }

    /// HTTP-backed kinds resolve to short-lived URLs that may need refresh.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::Local { .. } | Self::Filler { .. })
    }
}

/// Library item as read from the media library (read-only for the core).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub media_ref: MediaRef,
    pub title: String,
    /// Seconds; fillers and live items may not know theirs.
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub video_codec: Option<String>,
    #[serde(default)]
    pub audio_codec: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    /// Codecs + container already compatible with MPEG-TS stream copy.
    #[serde(default)]
    pub direct_play_friendly: bool,
    #[serde(default)]
    pub description: Option<String>,
    /// "S01E04"-style hint for the guide, where known.
    #[serde(default)]
    pub episode: Option<String>,
    /// Part index within a multi-part episode group, 1-based.
    #[serde(default)]
    pub multi_part_group: Option<String>,
}
