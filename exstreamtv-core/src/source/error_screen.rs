//! Error-screen fallback source.
//!
//! Synthesizes an unbounded MPEG-TS stream from lavfi generators so a broken
//! channel keeps emitting valid bytes. The command is spawned through the
//! process pool like any other source and counts against the global budget.

use serde::{Deserialize, Serialize};

use super::builder::TranscodeCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VisualMode {
    #[default]
    Text,
    Static,
    TestPattern,
    Slate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioMode {
    #[default]
    Silent,
    Sine,
    WhiteNoise,
    Beep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorScreenConfig {
    pub visual: VisualMode,
    pub audio: AudioMode,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl Default for ErrorScreenConfig {
    fn default() -> Self {
        Self {
            visual: VisualMode::Text,
            audio: AudioMode::Silent,
            width: 1280,
            height: 720,
            framerate: 25,
        }
    }
}

impl ErrorScreenConfig {
    /// Build the lavfi command emitting the fallback stream.
    ///
    /// `caption` is the diagnostic line rendered on text/slate visuals;
    /// single quotes are stripped rather than escaped to keep the filter
    /// graph well-formed.
    #[must_use]
    pub fn build_command(&self, ffmpeg_path: &str, caption: &str) -> TranscodeCommand {
        let size = format!("{}x{}", self.width, self.height);
        let rate = self.framerate;
        let caption = sanitize_caption(caption);

        let video_src = match self.visual {
            VisualMode::Text => format!(
                "color=c=black:s={size}:r={rate},\
                 drawtext=text='{caption}':fontcolor=white:fontsize=36:\
                 x=(w-text_w)/2:y=(h-text_h)/2"
            ),
            VisualMode::Static => format!(
                "nullsrc=s={size}:r={rate},geq=random(1)*255:128:128"
            ),
            VisualMode::TestPattern => format!("smptehdbars=s={size}:r={rate}"),
            VisualMode::Slate => format!(
                "color=c=0x102040:s={size}:r={rate},\
                 drawtext=text='{caption}':fontcolor=white:fontsize=28:\
                 x=(w-text_w)/2:y=h-80"
            ),
        };

        let audio_src = match self.audio {
            AudioMode::Silent => "anullsrc=channel_layout=stereo:sample_rate=48000".to_string(),
            AudioMode::Sine => "sine=frequency=440:sample_rate=48000".to_string(),
            AudioMode::WhiteNoise => "anoisesrc=colour=white:sample_rate=48000:amplitude=0.1".to_string(),
            AudioMode::Beep => "sine=frequency=880:beep_factor=4:sample_rate=48000".to_string(),
        };

        let mut cmd = TranscodeCommand::new(ffmpeg_path);
        cmd.args.extend(
            [
                "-hide_banner", "-loglevel", "warning",
                "-re", "-f", "lavfi", "-i",
            ]
            .map(String::from),
        );
        cmd.args.push(video_src);
        cmd.args.extend(["-f", "lavfi", "-i"].map(String::from));
        cmd.args.push(audio_src);
        cmd.args.extend(
            [
                "-c:v", "libx264", "-preset", "ultrafast", "-tune", "zerolatency",
                "-pix_fmt", "yuv420p", "-g", "50",
                "-c:a", "aac", "-b:a", "128k",
                "-muxdelay", "0", "-muxpreload", "0",
                "-f", "mpegts", "-mpegts_flags", "+resend_headers", "pipe:1",
            ]
            .map(String::from),
        );
        cmd
    }
}

fn sanitize_caption(caption: &str) -> String {
    caption
        .chars()
        .filter(|c| *c != '\'' && *c != '\\' && !c.is_control())
        .take(120)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_mode_renders_caption() {
        let cmd = ErrorScreenConfig::default().build_command("ffmpeg", "channel 5 unavailable");
        let graph = cmd.args.join(" ");
        assert!(graph.contains("drawtext"));
        assert!(graph.contains("channel 5 unavailable"));
        assert!(graph.ends_with("pipe:1"));
    }

    #[test]
    fn caption_quotes_are_stripped() {
        let cmd = ErrorScreenConfig::default().build_command("ffmpeg", "it's 'broken'");
        let graph = cmd.args.join(" ");
        assert!(!graph.contains('\''), "unexpected quote in: {graph}");
    }

    #[test]
    fn every_mode_pair_produces_mpegts_output() {
        for visual in [VisualMode::Text, VisualMode::Static, VisualMode::TestPattern, VisualMode::Slate] {
            for audio in [AudioMode::Silent, AudioMode::Sine, AudioMode::WhiteNoise, AudioMode::Beep] {
                let config = ErrorScreenConfig { visual, audio, ..Default::default() };
                let cmd = config.build_command("ffmpeg", "x");
                let s = cmd.args.join(" ");
                assert!(s.contains("-f mpegts"), "{visual:?}/{audio:?}");
                assert_eq!(cmd.args.iter().filter(|a| *a == "-i").count(), 2);
            }
        }
    }

    #[test]
    fn test_pattern_uses_bars() {
        let config = ErrorScreenConfig { visual: VisualMode::TestPattern, ..Default::default() };
        let cmd = config.build_command("ffmpeg", "");
        assert!(cmd.args.join(" ").contains("smptehdbars"));
    }
}
