//! Subtitle and audio stream selection.
//!
//! Fixed priority: exact language match with preferred type (text > image),
//! then exact language any type, then default-flagged stream, then first
//! stream. Downmix is requested only when the chosen audio layout exceeds the
//! profile target.

use serde::{Deserialize, Serialize};

/// One subtitle stream of a resolved source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleStream {
    pub index: u32,
    pub language: Option<String>,
    pub codec: String,
    /// Text-based (srt, ass, webvtt) as opposed to bitmap (pgs, dvdsub).
    pub is_text: bool,
    pub default: bool,
}

/// One audio stream of a resolved source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioStream {
    pub index: u32,
    pub language: Option<String>,
    pub codec: String,
    pub channels: u32,
    pub default: bool,
}

/// Selected stream indices plus the downmix decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamPicks {
    pub subtitle_index: Option<u32>,
    pub audio_index: Option<u32>,
    pub downmix: bool,
}

fn lang_matches(stream_lang: Option<&String>, wanted: &str) -> bool {
    stream_lang.is_some_and(|l| l.eq_ignore_ascii_case(wanted))
}

/// Pick a subtitle stream for the preferred language.
#[must_use]
pub fn pick_subtitle(streams: &[SubtitleStream], preferred_lang: Option<&str>) -> Option<u32> {
    if streams.is_empty() {
        return None;
    }
    if let Some(lang) = preferred_lang {
        if let Some(s) = streams.iter().find(|s| lang_matches(s.language.as_ref(), lang) && s.is_text) {
            return Some(s.index);
        }
        if let Some(s) = streams.iter().find(|s| lang_matches(s.language.as_ref(), lang)) {
            return Some(s.index);
        }
    }
    if let Some(s) = streams.iter().find(|s| s.default) {
        return Some(s.index);
    }
    streams.first().map(|s| s.index)
}

/// Pick an audio stream for the preferred language.
#[must_use]
pub fn pick_audio<'a>(streams: &'a [AudioStream], preferred_lang: Option<&str>) -> Option<&'a AudioStream> {
    if streams.is_empty() {
        return None;
    }
    if let Some(lang) = preferred_lang {
        if let Some(s) = streams.iter().find(|s| lang_matches(s.language.as_ref(), lang)) {
            return Some(s);
        }
    }
    streams.iter().find(|s| s.default).or_else(|| streams.first())
}

/// Apply both picks against a profile's audio channel target.
#[must_use]
pub fn pick_streams(
    subtitles: &[SubtitleStream],
    audio: &[AudioStream],
    preferred_lang: Option<&str>,
    max_audio_channels: u32,
) -> StreamPicks {
    let chosen_audio = pick_audio(audio, preferred_lang);
    StreamPicks {
        subtitle_index: pick_subtitle(subtitles, preferred_lang),
        audio_index: chosen_audio.map(|s| s.index),
        downmix: chosen_audio.is_some_and(|s| s.channels > max_audio_channels),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(index: u32, lang: Option<&str>, is_text: bool, default: bool) -> SubtitleStream {
        SubtitleStream {
            index,
            language: lang.map(String::from),
            codec: if is_text { "subrip" } else { "hdmv_pgs_subtitle" }.into(),
            is_text,
            default,
        }
    }

    fn aud(index: u32, lang: Option<&str>, channels: u32, default: bool) -> AudioStream {
        AudioStream {
            index,
            language: lang.map(String::from),
            codec: "aac".into(),
            channels,
            default,
        }
    }

    #[test]
    fn exact_language_text_beats_image() {
        let subs = vec![
            sub(0, Some("en"), false, true),
            sub(1, Some("en"), true, false),
        ];
        assert_eq!(pick_subtitle(&subs, Some("en")), Some(1));
    }

    #[test]
    fn exact_language_any_type_beats_default() {
        let subs = vec![
            sub(0, Some("fr"), true, true),
            sub(1, Some("en"), false, false),
        ];
        assert_eq!(pick_subtitle(&subs, Some("en")), Some(1));
    }

    #[test]
    fn default_flag_beats_first() {
        let subs = vec![sub(0, Some("fr"), true, false), sub(1, Some("de"), true, true)];
        assert_eq!(pick_subtitle(&subs, Some("en")), Some(1));
    }

    #[test]
    fn first_stream_is_the_last_resort() {
        let subs = vec![sub(3, Some("fr"), true, false), sub(4, Some("de"), true, false)];
        assert_eq!(pick_subtitle(&subs, Some("en")), Some(3));
    }

    #[test]
    fn no_streams_picks_nothing() {
        assert_eq!(pick_subtitle(&[], Some("en")), None);
        assert!(pick_audio(&[], Some("en")).is_none());
    }

    #[test]
    fn downmix_only_above_channel_target() {
        let audio = vec![aud(0, Some("en"), 6, true)];
        let picks = pick_streams(&[], &audio, Some("en"), 2);
        assert_eq!(picks.audio_index, Some(0));
        assert!(picks.downmix);

        let audio = vec![aud(0, Some("en"), 2, true)];
        let picks = pick_streams(&[], &audio, Some("en"), 2);
        assert!(!picks.downmix);
    }
}
