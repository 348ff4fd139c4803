//! FFprobe-based media probing.
//!
//! Shells out to `ffprobe -v error -print_format json -show_format
//! -show_streams` and maps the JSON output into the small [`MediaProbe`]
//! summary the pipeline needs: duration, source audio bitrate, video codec,
//! container, and file size.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use bf_core::{Error, Result};

use crate::command::ToolCommand;

/// Summary of the properties of a source file relevant to compression.
/// Persisted on the job record so pollers see what the pipeline saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaProbe {
    /// Container duration in seconds.
    pub duration_secs: f64,
    /// Bitrate of the first audio stream in kbps, if reported.
    pub audio_bitrate_kbps: Option<f64>,
    /// Codec name of the first video stream (e.g. "h264", "av1").
    pub video_codec: Option<String>,
    /// ffprobe `format_name` (e.g. "matroska,webm", "mov,mp4,m4a,3gp").
    pub container: String,
    /// File size in bytes as reported by the container.
    pub size_bytes: u64,
}

/// Probe a media file with ffprobe.
///
/// # Errors
///
/// Returns [`Error::Probe`] if ffprobe fails, its output does not parse, or
/// the file has no video stream.
pub async fn probe_media(ffprobe_path: &Path, input: &Path) -> Result<MediaProbe> {
    let mut cmd = ToolCommand::new(ffprobe_path.to_path_buf());
    cmd.args([
        "-v",
        "error",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
    ]);
    cmd.arg(input.to_string_lossy().as_ref());

    let output = cmd
        .execute()
        .await
        .map_err(|e| Error::Probe(format!("ffprobe failed: {e}")))?;

    let ff: FfprobeOutput = serde_json::from_str(&output.stdout)
        .map_err(|e| Error::Probe(format!("ffprobe JSON parse error: {e}")))?;

    parse_ffprobe_output(input, ff)
}

// ---------------------------------------------------------------------------
// JSON structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    bit_rate: Option<String>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse_ffprobe_output(path: &Path, output: FfprobeOutput) -> Result<MediaProbe> {
    let duration_secs = output
        .format
        .duration
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);

    let size_bytes = output
        .format
        .size
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let container = output.format.format_name.unwrap_or_default();

    let mut video_codec = None;
    let mut audio_bitrate_kbps = None;

    for stream in &output.streams {
        match stream.codec_type.as_deref() {
            Some("video") if video_codec.is_none() => {
                video_codec = stream.codec_name.clone();
            }
            Some("audio") if audio_bitrate_kbps.is_none() => {
                audio_bitrate_kbps = stream
                    .bit_rate
                    .as_deref()
                    .and_then(|s| s.parse::<f64>().ok())
                    .map(|bps| bps / 1000.0);
            }
            _ => {}
        }
    }

    if video_codec.is_none() {
        return Err(Error::Probe(format!(
            "no video stream in {}",
            path.display()
        )));
    }

    Ok(MediaProbe {
        duration_secs,
        audio_bitrate_kbps,
        video_codec,
        container,
        size_bytes,
    })
}

/// Pick the output file extension for a compression job.
///
/// mp4 is the default for its broad playback support; mkv is used when the
/// audio codec is libopus, which mp4 muxers handle poorly.
pub fn output_extension(audio_codec: &str) -> &'static str {
    if audio_codec == "libopus" {
        "mkv"
    } else {
        "mp4"
    }
}

/// Build the output path for a job inside the work directory.
pub fn output_path(work_dir: &Path, job_id: bf_core::JobId, audio_codec: &str) -> PathBuf {
    work_dir.join(format!("{job_id}.{}", output_extension(audio_codec)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264", "bit_rate": "4500000"},
            {"index": 1, "codec_type": "audio", "codec_name": "aac", "bit_rate": "128000"}
        ],
        "format": {
            "format_name": "mov,mp4,m4a,3gp,3g2,mj2",
            "duration": "60.000000",
            "size": "35000000"
        }
    }"#;

    fn parse(json: &str) -> Result<MediaProbe> {
        let ff: FfprobeOutput = serde_json::from_str(json).unwrap();
        parse_ffprobe_output(Path::new("/tmp/in.mp4"), ff)
    }

    #[test]
    fn parses_typical_output() {
        let probe = parse(SAMPLE).unwrap();
        assert_eq!(probe.duration_secs, 60.0);
        assert_eq!(probe.audio_bitrate_kbps, Some(128.0));
        assert_eq!(probe.video_codec.as_deref(), Some("h264"));
        assert_eq!(probe.size_bytes, 35_000_000);
        assert!(probe.container.contains("mp4"));
    }

    #[test]
    fn missing_audio_stream_is_ok() {
        let probe = parse(
            r#"{
                "streams": [{"codec_type": "video", "codec_name": "av1"}],
                "format": {"format_name": "matroska,webm", "duration": "10.5"}
            }"#,
        )
        .unwrap();
        assert_eq!(probe.audio_bitrate_kbps, None);
        assert_eq!(probe.video_codec.as_deref(), Some("av1"));
        assert_eq!(probe.duration_secs, 10.5);
        assert_eq!(probe.size_bytes, 0);
    }

    #[test]
    fn missing_video_stream_errors() {
        let result = parse(
            r#"{
                "streams": [{"codec_type": "audio", "codec_name": "aac"}],
                "format": {"format_name": "mp3", "duration": "180.0"}
            }"#,
        );
        assert!(matches!(result, Err(Error::Probe(_))));
    }

    #[test]
    fn only_first_streams_count() {
        let probe = parse(
            r#"{
                "streams": [
                    {"codec_type": "video", "codec_name": "hevc"},
                    {"codec_type": "video", "codec_name": "mjpeg"},
                    {"codec_type": "audio", "codec_name": "opus", "bit_rate": "96000"},
                    {"codec_type": "audio", "codec_name": "ac3", "bit_rate": "448000"}
                ],
                "format": {"format_name": "matroska,webm", "duration": "42.0"}
            }"#,
        )
        .unwrap();
        assert_eq!(probe.video_codec.as_deref(), Some("hevc"));
        assert_eq!(probe.audio_bitrate_kbps, Some(96.0));
    }

    #[test]
    fn extension_follows_audio_codec() {
        assert_eq!(output_extension("libopus"), "mkv");
        assert_eq!(output_extension("aac"), "mp4");
        assert_eq!(output_extension("libmp3lame"), "mp4");
    }

    #[test]
    fn output_path_uses_job_id() {
        let id = bf_core::JobId::new();
        let path = output_path(Path::new("/work"), id, "aac");
        assert_eq!(path, PathBuf::from(format!("/work/{id}.mp4")));
    }
}
