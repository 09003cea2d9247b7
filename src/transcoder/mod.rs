use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::clock::location_seconds;
use crate::error::AppError;
use crate::playlist::PlaylistItem;

pub mod ffmpeg;
pub mod sweeper;

pub use ffmpeg::FfmpegEncoder;

/// x264 presets accepted by the settings update
pub const VALID_PRESETS: [&str; 9] = [
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];

/// Marker the encoder prints when the subtitle burn-in filter cannot find a track
pub const SUBTITLE_FAILURE_SIGNATURE: &str = "Error initializing filter 'subtitles' with args";

/// Encoder settings shared by every viewer.
///
/// Replaced wholesale by a settings update, never merged field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscoderSettings {
    /// Output width, height follows the aspect ratio
    #[serde(rename = "scale")]
    pub scale_width: u32,
    /// Max video bitrate in kbit/s
    #[serde(rename = "maxrate")]
    pub max_rate: u32,
    pub preset: String,
    /// Source stream indices mapped into the output
    pub streams: Vec<u32>,
    /// `H:M:S` offset for the next run, empty for none
    #[serde(default)]
    pub seek: String,
    /// Burn in the first subtitle track
    pub subs: bool,
}

impl Default for TranscoderSettings {
    fn default() -> Self {
        Self {
            scale_width: 1280,
            max_rate: 2000,
            preset: "veryfast".to_string(),
            streams: vec![0, 1],
            seek: String::new(),
            subs: true,
        }
    }
}

/// Check that `preset` is exactly one of the known presets
pub fn validate_preset(preset: &str) -> Result<(), AppError> {
    if VALID_PRESETS.contains(&preset) {
        Ok(())
    } else {
        Err(AppError::Validation(
            "Invalid preset, check for typos and spaces at the beginning or end".to_string(),
        ))
    }
}

/// Everything one encoder run needs
#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub item: PlaylistItem,
    pub settings: TranscoderSettings,
    /// Whether to burn subtitles in; may be off even when the settings ask for them
    pub subtitles: bool,
    /// First HLS segment number of this run
    pub segment_base: u64,
}

impl EncodeJob {
    /// Seek offset in seconds, zero when none applies
    pub fn seek_seconds(&self) -> u64 {
        if self.settings.seek.is_empty() {
            0
        } else {
            location_seconds(&self.settings.seek)
        }
    }
}

/// How an encoder run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeOutcome {
    /// Exited cleanly, or was interrupted
    Completed,
    /// Exited with a failure status (`None` when killed by a signal)
    Failed(Option<i32>),
    /// The subtitle filter could not initialise; retrying without subtitles may work
    SubtitlesUnavailable,
}

/// Runs the external encoder for one playlist item.
///
/// `encode` blocks until the process exits. Cancelling `stop` asks the process to
/// wind down gracefully; the call still returns only once it has exited.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(&self, job: &EncodeJob, stop: CancellationToken) -> Result<EncodeOutcome>;
}

/// Escape `[` and `]`, which are metacharacters in filter graphs
pub fn escape_filter(input: &str) -> String {
    input.replace('[', "\\[").replace(']', "\\]")
}

/// Video filter chain: even-height scale plus optional subtitle burn-in
pub fn video_filter(job: &EncodeJob) -> String {
    let mut vf = format!("scale={}:trunc(ow/a/2)*2", job.settings.scale_width);
    if job.subtitles {
        vf.push_str(&format!(",subtitles={}", escape_filter(&job.item.path)));
    }
    vf
}

/// Build the encoder argument list for `job`, writing HLS output to `hls_playlist`
pub fn build_args(job: &EncodeJob, hls_playlist: &Path) -> Vec<String> {
    let settings = &job.settings;
    let mut args: Vec<String> = vec!["-re".into()];

    if job.seek_seconds() > 0 {
        args.push("-ss".into());
        args.push(settings.seek.clone());
    }

    args.push("-i".into());
    args.push(job.item.path.clone());

    for stream in &settings.streams {
        args.push("-map".into());
        args.push(format!("0:{}", stream));
    }

    let fixed: [&str; 14] = [
        "-strict", "-2",
        "-c:a", "aac",
        "-ar", "44100",
        "-vbr", "5",
        "-c:v", "libx264",
        "-profile:v", "baseline",
        "-preset", settings.preset.as_str(),
    ];
    args.extend(fixed.iter().map(|s| s.to_string()));

    args.extend([
        "-maxrate".to_string(),
        format!("{}k", settings.max_rate),
        "-bufsize".to_string(),
        format!("{}k", u64::from(settings.max_rate) * 2),
        "-vf".to_string(),
        video_filter(job),
        "-x264-params".to_string(),
        "keyint=100:no-scenecut=1".to_string(),
        "-f".to_string(),
        "hls".to_string(),
        "-start_number".to_string(),
        job.segment_base.to_string(),
        "-hls_allow_cache".to_string(),
        "0".to_string(),
        "-hls_flags".to_string(),
        "discont_start".to_string(),
    ]);

    args.push(hls_playlist.to_string_lossy().to_string());
    args
}

/// Classify a finished run from its exit status and captured output
pub fn classify_exit(success: bool, code: Option<i32>, output: &str, subtitles: bool) -> EncodeOutcome {
    if subtitles && output.contains(SUBTITLE_FAILURE_SIGNATURE) {
        EncodeOutcome::SubtitlesUnavailable
    } else if success {
        EncodeOutcome::Completed
    } else {
        EncodeOutcome::Failed(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn job(seek: &str, subtitles: bool) -> EncodeJob {
        EncodeJob {
            item: PlaylistItem::movie("/media/Show [1080p].mkv"),
            settings: TranscoderSettings {
                seek: seek.to_string(),
                ..TranscoderSettings::default()
            },
            subtitles,
            segment_base: 3000,
        }
    }

    #[test]
    fn test_validate_preset() {
        for preset in VALID_PRESETS {
            assert!(validate_preset(preset).is_ok(), "{} should be valid", preset);
        }
        for bad in ["", "Fast", "VERYFAST", "fast ", " fast", "placebo", "medium\n"] {
            assert!(validate_preset(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_escape_filter() {
        assert_eq!(escape_filter("/a/[x] b]"), "/a/\\[x\\] b\\]");
        assert_eq!(escape_filter("/plain/path.mp4"), "/plain/path.mp4");
    }

    #[test]
    fn test_build_args_without_seek() {
        let args = build_args(&job("", false), &PathBuf::from("/srv/hls/stream.m3u8"));

        assert_eq!(args[0], "-re");
        assert_eq!(args[1], "-i");
        assert_eq!(args[2], "/media/Show [1080p].mkv");
        assert!(!args.contains(&"-ss".to_string()));

        let joined = args.join(" ");
        assert!(joined.contains("-map 0:0 -map 0:1"));
        assert!(joined.contains("-vf scale=1280:trunc(ow/a/2)*2 "));
        assert!(joined.contains("-preset veryfast"));
        assert!(joined.contains("-maxrate 2000k -bufsize 4000k"));
        assert!(joined.contains("-f hls -start_number 3000 -hls_allow_cache 0 -hls_flags discont_start"));
        assert_eq!(args.last().unwrap(), "/srv/hls/stream.m3u8");
    }

    #[test]
    fn test_build_args_with_seek_and_subtitles() {
        let args = build_args(&job("0:1:30", true), &PathBuf::from("out.m3u8"));
        assert_eq!(&args[..3], &["-re", "-ss", "0:1:30"]);

        let vf_pos = args.iter().position(|a| a == "-vf").unwrap();
        assert_eq!(
            args[vf_pos + 1],
            "scale=1280:trunc(ow/a/2)*2,subtitles=/media/Show \\[1080p\\].mkv"
        );
    }

    #[test]
    fn test_zero_seek_is_ignored() {
        let args = build_args(&job("0:0:0", false), &PathBuf::from("out.m3u8"));
        assert!(!args.contains(&"-ss".to_string()));
    }

    #[test]
    fn test_large_client_values_do_not_overflow() {
        let mut job = job("999999999999999999:0:0", false);
        job.settings.max_rate = 3_000_000_000;
        assert_eq!(job.seek_seconds(), 0);

        let args = build_args(&job, &PathBuf::from("out.m3u8"));
        assert!(!args.contains(&"-ss".to_string()));
        assert!(args.join(" ").contains("-maxrate 3000000000k -bufsize 6000000000k"));
    }

    #[test]
    fn test_classify_exit() {
        let noisy = format!("[Parsed_subtitles_1] {} '/x.mkv'", SUBTITLE_FAILURE_SIGNATURE);
        assert_eq!(classify_exit(false, Some(1), &noisy, true), EncodeOutcome::SubtitlesUnavailable);
        assert_eq!(classify_exit(false, Some(1), &noisy, false), EncodeOutcome::Failed(Some(1)));
        assert_eq!(classify_exit(true, Some(0), "ok", true), EncodeOutcome::Completed);
        assert_eq!(classify_exit(false, None, "", false), EncodeOutcome::Failed(None));
    }

    #[test]
    fn test_settings_wire_names() {
        let json = serde_json::to_value(TranscoderSettings::default()).unwrap();
        assert_eq!(json["scale"], 1280);
        assert_eq!(json["maxrate"], 2000);
        assert_eq!(json["preset"], "veryfast");
        assert_eq!(json["streams"], serde_json::json!([0, 1]));
        assert_eq!(json["subs"], true);
    }
}
