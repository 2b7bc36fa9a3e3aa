//! Transcoder command construction.
//!
//! Pure: turns a resolved source plus a transcode profile into the argument
//! list for an MPEG-TS-on-stdout ffmpeg invocation. Performs no I/O.

use serde::{Deserialize, Serialize};

use crate::config::{HwAccel, TranscodeConfig};
use crate::provider::{ResolvedSource, SourceUriKind};

/// A fully built transcoder invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl TranscodeCommand {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    fn push(&mut self, args: &[&str]) {
        self.args.extend(args.iter().map(|s| (*s).to_string()));
    }

    fn push_owned(&mut self, arg: String) {
        self.args.push(arg);
    }
}

/// Codecs that MPEG-TS can carry without re-encoding.
fn copy_compatible(resolved: &ResolvedSource) -> bool {
    matches!(resolved.video_codec.as_deref(), Some("h264" | "hevc" | "mpeg2video"))
}

/// Whether the picks force a CPU-side filter graph (text subtitle burn-in),
/// which rules out both stream copy and hardware-only encoding.
fn needs_cpu_filter(resolved: &ResolvedSource) -> bool {
    resolved.picks.subtitle_index.is_some()
        && resolved
            .subtitles
            .iter()
            .any(|s| Some(s.index) == resolved.picks.subtitle_index && s.is_text)
}

/// Build the transcoder command line.
///
/// Decision order: stream copy when the item is direct-play friendly and the
/// profile allows it; otherwise the configured hardware encoder; software
/// x264 as the final fallback. Output is always MPEG-TS on stdout.
#[must_use]
pub fn build_command(
    ffmpeg_path: &str,
    resolved: &ResolvedSource,
    profile: &TranscodeConfig,
    resume_offset_secs: f64,
    in_point_secs: f64,
) -> TranscodeCommand {
    // stdin stays attached: the pool's graceful stop writes 'q' to it.
    let mut cmd = TranscodeCommand::new(ffmpeg_path);
    cmd.push(&["-hide_banner", "-loglevel", "warning"]);

    // Tolerate damaged input by default.
    cmd.push(&["-fflags", "+genpts+discardcorrupt", "-err_detect", "ignore_err"]);
    cmd.push(&["-avoid_negative_ts", "make_zero"]);

    let seekable = resolved.kind.is_seekable();
    let live = matches!(resolved.kind, SourceUriKind::HttpLive);

    // Realtime-paced output for pre-recorded content.
    if !live {
        cmd.push(&["-re"]);
    }

    if resolved.kind.is_http() {
        cmd.push(&[
            "-reconnect", "1",
            "-reconnect_streamed", "1",
            "-reconnect_delay_max", "5",
        ]);
    }

    // Seek before input; for non-seekable live HTTP the offset is ignored and
    // the caller resets its elapsed accounting instead.
    let start = in_point_secs + resume_offset_secs;
    if seekable && start > 0.0 {
        cmd.push(&["-ss"]);
        cmd.push_owned(format!("{start:.3}"));
    }

    cmd.push(&["-i"]);
    cmd.push_owned(resolved.primary_uri.clone());

    // Stream mapping: first video, picked (or first) audio; drop data tracks.
    cmd.push(&["-map", "0:v:0"]);
    match resolved.picks.audio_index {
        Some(idx) => {
            cmd.push(&["-map"]);
            cmd.push_owned(format!("0:{idx}"));
        }
        None => cmd.push(&["-map", "0:a:0?"]),
    }
    cmd.push(&["-sn", "-dn"]);

    let copy = profile.allow_copy
        && resolved.direct_play_candidate
        && copy_compatible(resolved)
        && !needs_cpu_filter(resolved);

    if copy {
        cmd.push(&["-c:v", "copy", "-c:a", "copy"]);
        // Annex-B conversion + timestamp regeneration for the TS mux.
        if resolved.video_codec.as_deref() == Some("h264") {
            cmd.push(&["-bsf:v", "h264_mp4toannexb"]);
        } else if resolved.video_codec.as_deref() == Some("hevc") {
            cmd.push(&["-bsf:v", "hevc_mp4toannexb"]);
        }
    } else {
        let software_only = needs_cpu_filter(resolved);
        push_video_encoder(&mut cmd, profile, software_only);
        push_audio_encoder(&mut cmd, profile, resolved);
    }

    // MPEG-TS on stdout, never to disk.
    cmd.push(&["-muxdelay", "0", "-muxpreload", "0"]);
    cmd.push(&["-f", "mpegts", "-mpegts_flags", "+resend_headers", "pipe:1"]);
    cmd
}

fn push_video_encoder(cmd: &mut TranscodeCommand, profile: &TranscodeConfig, software_only: bool) {
    let hwaccel = if software_only { HwAccel::None } else { profile.hwaccel };
    match hwaccel {
        HwAccel::VideoToolbox => cmd.push(&["-c:v", "h264_videotoolbox"]),
        HwAccel::Nvenc => cmd.push(&["-c:v", "h264_nvenc", "-preset", "p4"]),
        HwAccel::Qsv => cmd.push(&["-c:v", "h264_qsv"]),
        HwAccel::Vaapi => {
            cmd.push(&["-vaapi_device"]);
            cmd.push_owned(profile.vaapi_device.clone());
            cmd.push(&["-vf", "format=nv12,hwupload", "-c:v", "h264_vaapi"]);
        }
        HwAccel::Amf => cmd.push(&["-c:v", "h264_amf"]),
        HwAccel::None => {
            cmd.push(&["-c:v", "libx264", "-preset", "veryfast", "-pix_fmt", "yuv420p"]);
        }
    }
    cmd.push(&["-b:v"]);
    cmd.push_owned(format!("{}k", profile.video_bitrate_kbps));
    cmd.push(&["-maxrate"]);
    cmd.push_owned(format!("{}k", profile.video_bitrate_kbps));
    cmd.push(&["-bufsize"]);
    cmd.push_owned(format!("{}k", profile.video_bitrate_kbps * 2));
    // Predictable keyframes keep TS segmenting downstream sane.
    cmd.push(&["-g", "50", "-sc_threshold", "0"]);
}

fn push_audio_encoder(
    cmd: &mut TranscodeCommand,
    profile: &TranscodeConfig,
    resolved: &ResolvedSource,
) {
    cmd.push(&["-c:a", "aac"]);
    cmd.push(&["-b:a"]);
    cmd.push_owned(format!("{}k", profile.audio_bitrate_kbps));
    if resolved.picks.downmix {
        cmd.push(&["-ac"]);
        cmd.push_owned(profile.max_audio_channels.to_string());
    }
}
