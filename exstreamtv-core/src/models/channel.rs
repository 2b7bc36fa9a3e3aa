use serde::{Deserialize, Serialize};

use super::id::ChannelId;

/// Which client surfaces list this channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    Iptv,
    Hdhomerun,
    #[default]
    Both,
}

impl StreamingMode {
    #[must_use]
    pub fn serves_iptv(self) -> bool {
        matches!(self, Self::Iptv | Self::Both)
    }

    #[must_use]
    pub fn serves_hdhomerun(self) -> bool {
        matches!(self, Self::Hdhomerun | Self::Both)
    }
}

/// Throttler mode for a channel's byte delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleMode {
    #[default]
    Realtime,
    Burst,
    Adaptive,
    Disabled,
}

/// Per-channel throttler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlerConfig {
    pub mode: ThrottleMode,
    pub target_bitrate_bps: u64,
    /// Credit headroom for burst mode, in seconds of target bitrate.
    pub burst_headroom_seconds: u64,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            mode: ThrottleMode::Realtime,
            target_bitrate_bps: 8_000_000,
            burst_headroom_seconds: 10,
        }
    }
}

/// A virtual TV channel as defined by the administration surface.
///
/// The streaming core never mutates channel records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    /// Display number, unique across the lineup.
    pub number: u32,
    /// 8-hex slot used by the HDHomeRun surface.
    pub device_slot: String,
    pub name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub streaming_mode: StreamingMode,
    #[serde(default)]
    pub transcode_profile: Option<String>,
    #[serde(default)]
    pub fallback_filler: Option<String>,
    #[serde(default)]
    pub throttler: ThrottlerConfig,
    /// Keep the runtime alive with no subscribers.
    #[serde(default)]
    pub always_on: bool,
}

fn default_enabled() -> bool {
    true
}

impl Channel {
    /// Stable guide identifier shared by M3U, XMLTV and the lineup.
    #[must_use]
    pub fn guide_id(&self) -> String {
        format!("exstream-{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_mode_surface_filters() {
        assert!(StreamingMode::Both.serves_iptv());
        assert!(StreamingMode::Both.serves_hdhomerun());
        assert!(StreamingMode::Iptv.serves_iptv());
        assert!(!StreamingMode::Iptv.serves_hdhomerun());
        assert!(!StreamingMode::Hdhomerun.serves_iptv());
    }

    #[test]
    fn guide_id_uses_stable_channel_id() {
        let channel = Channel {
            id: ChannelId::from("abc123"),
            number: 5,
            device_slot: "0A1B2C3D".to_string(),
            name: "Movies".to_string(),
            group: "Film".to_string(),
            enabled: true,
            streaming_mode: StreamingMode::Both,
            transcode_profile: None,
            fallback_filler: None,
            throttler: ThrottlerConfig::default(),
            always_on: false,
        };
        assert_eq!(channel.guide_id(), "exstream-abc123");
    }
}
