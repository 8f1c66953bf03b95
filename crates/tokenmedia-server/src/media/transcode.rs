//! Thumbnail, live preview and probe invocations
//!
//! Inputs are staged to a temporary file; outputs are read from the tool's
//! stdout so nothing but the input touches the disk.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokenmedia_common::Dimensions;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::command::ToolCommand;
use crate::config::MediaConfig;

pub const THUMBNAIL_TIMEOUT: Duration = Duration::from_secs(60);
pub const LIVE_PREVIEW_TIMEOUT: Duration = Duration::from_secs(120);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Length of the live preview clip in seconds
pub const LIVE_PREVIEW_SECONDS: u32 = 5;

/// Width of the live preview; height keeps the aspect ratio
pub const LIVE_PREVIEW_WIDTH: u32 = 720;

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("{tool} failed to start: {message}")]
    Spawn { tool: String, message: String },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("{tool} timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    #[error("{0} produced no output")]
    EmptyOutput(String),

    #[error("{0} not found")]
    ToolMissing(String),

    #[error("Transcode cancelled")]
    Cancelled,

    #[error("Transcode I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// First frame as a single JPEG
    async fn extract_thumbnail(
        &self,
        input: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Bytes, TranscodeError>;

    /// Short, scaled, fragmented MP4
    async fn make_live_preview(
        &self,
        input: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Bytes, TranscodeError>;

    /// First stream with a usable size; empty dimensions when nothing is found
    async fn probe_dimensions(&self, input: Bytes, cancel: &CancellationToken) -> Dimensions;
}

#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg, ffprobe }
    }

    /// Use the configured binaries, or find them on `PATH`
    pub fn from_config(config: &MediaConfig) -> Result<Self, TranscodeError> {
        let ffmpeg = resolve_tool(config.ffmpeg_path.as_deref(), "ffmpeg")?;
        let ffprobe = resolve_tool(config.ffprobe_path.as_deref(), "ffprobe")?;
        Ok(Self::new(ffmpeg, ffprobe))
    }

    fn thumbnail_args(input: &Path) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-ss".into(),
            "00:00:00.000".into(),
            "-i".into(),
            input.to_string_lossy().to_string(),
            "-frames:v".into(),
            "1".into(),
            "-c:v".into(),
            "mjpeg".into(),
            "-f".into(),
            "image2pipe".into(),
            "pipe:1".into(),
        ]
    }

    fn live_preview_args(input: &Path) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            input.to_string_lossy().to_string(),
            "-t".into(),
            LIVE_PREVIEW_SECONDS.to_string(),
            "-vf".into(),
            format!("scale={}:-2", LIVE_PREVIEW_WIDTH),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "veryfast".into(),
            "-c:a".into(),
            "copy".into(),
            "-movflags".into(),
            "frag_keyframe+empty_moov".into(),
            "-f".into(),
            "mp4".into(),
            "pipe:1".into(),
        ]
    }

    fn probe_args(input: &Path) -> Vec<String> {
        vec![
            "-v".into(),
            "quiet".into(),
            "-print_format".into(),
            "json".into(),
            "-show_streams".into(),
            input.to_string_lossy().to_string(),
        ]
    }

    async fn run_ffmpeg(
        &self,
        input: Bytes,
        args: fn(&Path) -> Vec<String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Bytes, TranscodeError> {
        let staged = stage_input(&input).await?;
        let output = ToolCommand::new(self.ffmpeg.clone())
            .args(args(staged.path()))
            .timeout(timeout)
            .execute(cancel)
            .await?;

        if output.stdout.is_empty() {
            return Err(TranscodeError::EmptyOutput("ffmpeg".into()));
        }
        Ok(Bytes::from(output.stdout))
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    #[instrument(skip(self, input, cancel), fields(size = input.len()))]
    async fn extract_thumbnail(
        &self,
        input: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Bytes, TranscodeError> {
        self.run_ffmpeg(input, Self::thumbnail_args, THUMBNAIL_TIMEOUT, cancel)
            .await
    }

    #[instrument(skip(self, input, cancel), fields(size = input.len()))]
    async fn make_live_preview(
        &self,
        input: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Bytes, TranscodeError> {
        self.run_ffmpeg(input, Self::live_preview_args, LIVE_PREVIEW_TIMEOUT, cancel)
            .await
    }

    #[instrument(skip(self, input, cancel), fields(size = input.len()))]
    async fn probe_dimensions(&self, input: Bytes, cancel: &CancellationToken) -> Dimensions {
        let staged = match stage_input(&input).await {
            Ok(staged) => staged,
            Err(e) => {
                warn!(error = %e, "Failed to stage probe input");
                return Dimensions::default();
            }
        };

        let output = ToolCommand::new(self.ffprobe.clone())
            .args(Self::probe_args(staged.path()))
            .timeout(PROBE_TIMEOUT)
            .execute(cancel)
            .await;

        match output {
            Ok(output) => parse_probe_output(&output.stdout),
            Err(e) => {
                warn!(error = %e, "ffprobe failed");
                Dimensions::default()
            }
        }
    }
}

fn resolve_tool(configured: Option<&Path>, name: &str) -> Result<PathBuf, TranscodeError> {
    match configured {
        Some(path) => Ok(path.to_path_buf()),
        None => which::which(name).map_err(|_| TranscodeError::ToolMissing(name.to_string())),
    }
}

async fn stage_input(input: &[u8]) -> Result<tempfile::NamedTempFile, TranscodeError> {
    let staged = tempfile::Builder::new().prefix("tokenmedia-").tempfile()?;
    tokio::fs::write(staged.path(), input).await?;
    debug!(path = %staged.path().display(), size = input.len(), "Staged media input");
    Ok(staged)
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
}

/// First stream with both sides above zero
pub fn parse_probe_output(stdout: &[u8]) -> Dimensions {
    let Ok(parsed) = serde_json::from_slice::<ProbeOutput>(stdout) else {
        return Dimensions::default();
    };

    parsed
        .streams
        .iter()
        .filter_map(|s| Some(Dimensions::new(s.width?, s.height?)))
        .find(Dimensions::is_valid)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_picks_first_sized_stream() {
        let json = br#"{"streams":[
            {"codec_type":"audio"},
            {"codec_type":"video","width":0,"height":0},
            {"codec_type":"video","width":1920,"height":1080},
            {"codec_type":"video","width":640,"height":480}
        ]}"#;
        assert_eq!(parse_probe_output(json), Dimensions::new(1920, 1080));
    }

    #[test]
    fn test_probe_garbage_is_empty() {
        assert_eq!(parse_probe_output(b"not json"), Dimensions::default());
        assert_eq!(parse_probe_output(b"{}"), Dimensions::default());
    }

    #[test]
    fn test_ffmpeg_arguments() {
        let input = Path::new("/tmp/in");
        let thumb = FfmpegTranscoder::thumbnail_args(input);
        assert!(thumb.windows(2).any(|w| w[0] == "-ss" && w[1] == "00:00:00.000"));
        assert!(thumb.windows(2).any(|w| w[0] == "-frames:v" && w[1] == "1"));

        let preview = FfmpegTranscoder::live_preview_args(input);
        assert!(preview.windows(2).any(|w| w[0] == "-t" && w[1] == "5"));
        assert!(preview.windows(2).any(|w| w[0] == "-vf" && w[1] == "scale=720:-2"));
        assert!(preview.windows(2).any(|w| w[0] == "-c:a" && w[1] == "copy"));
        assert!(preview
            .windows(2)
            .any(|w| w[0] == "-movflags" && w[1] == "frag_keyframe+empty_moov"));
    }

    #[test]
    fn test_configured_tool_wins_over_path() {
        let path = resolve_tool(Some(Path::new("/opt/ffmpeg")), "ffmpeg").ok();
        assert_eq!(path, Some(PathBuf::from("/opt/ffmpeg")));
    }
}
