//! The unified lineup view.
//!
//! M3U, XMLTV and the HDHomeRun lineup are all projections of this one view
//! over enabled channels; none of them queries channels independently, which
//! keeps their ids and ordering from drifting apart.

use exstreamtv_core::models::Channel;

/// One channel as every client-facing document sees it.
#[derive(Debug, Clone)]
pub struct LineupEntry {
    pub channel: Channel,
    /// Shared stable id: `tvg-id` in M3U, `channel/@id` in XMLTV.
    pub guide_id: String,
    /// Channel number as a string: `GuideNumber` in lineup.json.
    pub guide_number: String,
    /// Absolute MPEG-TS URL.
    pub stream_url: String,
}

/// Build the lineup from enabled channels, ordered by channel number.
#[must_use]
pub fn build_lineup<'a>(
    channels: impl Iterator<Item = &'a Channel>,
    base_url: &str,
) -> Vec<LineupEntry> {
    let base = base_url.trim_end_matches('/');
    let mut entries: Vec<LineupEntry> = channels
        .filter(|c| c.enabled)
        .map(|channel| LineupEntry {
            guide_id: channel.guide_id(),
            guide_number: channel.number.to_string(),
            stream_url: format!("{base}/iptv/channel/{}.ts", channel.number),
            channel: channel.clone(),
        })
        .collect();
    entries.sort_by_key(|e| e.channel.number);
    entries
}


#[cfg(test)]
mod tests {
    use super::test_support::channel;
    use super::*;

    #[test]
    fn lineup_orders_by_number_and_skips_disabled() {
        let mut disabled = channel("x", 3, "Off");
        disabled.enabled = false;
        let channels = vec![channel("b", 9, "Nine"), disabled, channel("a", 2, "Two")];

        let lineup = build_lineup(channels.iter(), "http://10.0.0.5:5004/");
        assert_eq!(lineup.len(), 2);
        assert_eq!(lineup[0].channel.number, 2);
        assert_eq!(lineup[1].channel.number, 9);
        assert_eq!(lineup[0].stream_url, "http://10.0.0.5:5004/iptv/channel/2.ts");
    }

    #[test]
    fn guide_id_matches_channel_guide_id() {
        let c = channel("abc", 5, "Five");
        let lineup = build_lineup(std::iter::once(&c), "http://h");
        assert_eq!(lineup[0].guide_id, "exstream-abc");
        assert_eq!(lineup[0].guide_number, "5");
    }
}
