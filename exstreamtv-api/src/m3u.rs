//! Extended M3U playlist generation.

use crate::lineup::LineupEntry;

/// Render the IPTV playlist for the lineup.
#[must_use]
pub fn render_playlist(lineup: &[LineupEntry]) -> String {
    let mut out = String::with_capacity(64 + lineup.len() * 160);
    out.push_str("#EXTM3U\n");
    for entry in lineup {
        if !entry.channel.streaming_mode.serves_iptv() {
            continue;
        }
        out.push_str(&format!(
            "#EXTINF:-1 tvg-id=\"{}\" tvg-chno=\"{}\" tvg-name=\"{}\" group-title=\"{}\",{}\n",
            entry.guide_id,
            entry.channel.number,
            escape_attr(&entry.channel.name),
            escape_attr(&entry.channel.group),
            entry.channel.name,
        ));
        out.push_str(&entry.stream_url);
        out.push('\n');
    }
    out
}

/// Double quotes would terminate the attribute early; drop them.
fn escape_attr(value: &str) -> String {
    value.replace('"', "'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineup::{build_lineup, test_support::channel};
    use exstreamtv_core::models::StreamingMode;

    #[test]
    fn playlist_has_header_and_one_entry_per_channel() {
        let channels = vec![channel("a", 2, "News"), channel("b", 5, "Movies")];
        let lineup = build_lineup(channels.iter(), "http://10.0.0.5:5004");
        let playlist = render_playlist(&lineup);

        assert!(playlist.starts_with("#EXTM3U\n"));
        assert_eq!(playlist.matches("#EXTINF:-1").count(), 2);
        assert!(playlist.contains(
            "#EXTINF:-1 tvg-id=\"exstream-a\" tvg-chno=\"2\" tvg-name=\"News\" group-title=\"General\",News"
        ));
        assert!(playlist.contains("http://10.0.0.5:5004/iptv/channel/5.ts"));
    }

    #[test]
    fn hdhomerun_only_channels_are_excluded() {
        let mut c = channel("a", 2, "DVR Only");
        c.streaming_mode = StreamingMode::Hdhomerun;
        let lineup = build_lineup(std::iter::once(&c), "http://h");
        let playlist = render_playlist(&lineup);
        assert_eq!(playlist, "#EXTM3U\n");
    }

    #[test]
    fn quotes_in_names_do_not_break_attributes() {
        let c = channel("a", 2, "The \"Best\" Channel");
        let lineup = build_lineup(std::iter::once(&c), "http://h");
        let playlist = render_playlist(&lineup);
        assert!(playlist.contains("tvg-name=\"The 'Best' Channel\""));
    }
}
