//! Job model: the request, the resolved plan, and the job record itself.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bf_av::bitrate::BitratePlan;
use bf_av::encoders::{EncoderSelection, Preset};
use bf_av::hw::Codec;
use bf_av::probe::MediaProbe;
use bf_core::events::JobState;
use bf_core::{Error, JobId, Result};

/// Upper bound on a plausible audio bitrate request, in kbps.
const MAX_AUDIO_KBPS: f64 = 2048.0;

/// Smallest dimension the scale filter can produce.
const MIN_SCALE_DIM: u32 = 2;

/// An immutable compression request. Validated once at submission; never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeRequest {
    /// Source media file.
    pub source: PathBuf,
    /// Desired output size in bytes.
    pub target_size_bytes: u64,
    /// Requested video codec family.
    pub codec: Codec,
    /// Audio codec passed to ffmpeg (e.g. "aac", "libopus").
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    /// Audio bitrate budget in kbps.
    #[serde(default = "default_audio_kbps")]
    pub audio_bitrate_kbps: f64,
    /// Speed/quality preset ordinal.
    #[serde(default)]
    pub preset: Preset,
    /// Optional encoder tune (honored by NVENC only).
    #[serde(default)]
    pub tune: Option<String>,
    /// Downscale the output to at most this width, preserving aspect ratio.
    #[serde(default)]
    pub max_width: Option<u32>,
    /// Downscale the output to at most this height, preserving aspect ratio.
    #[serde(default)]
    pub max_height: Option<u32>,
    /// Clip start as seconds or `HH:MM:SS`/`MM:SS`.
    #[serde(default)]
    pub start_time: Option<String>,
    /// Clip end, same formats as `start_time`.
    #[serde(default)]
    pub end_time: Option<String>,
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_audio_kbps() -> f64 {
    128.0
}

impl EncodeRequest {
    /// Validate the request. Called before a job exists; failures surface
    /// as [`Error::InvalidRequest`] straight to the submitter.
    pub fn validate(&self) -> Result<()> {
        if self.source.as_os_str().is_empty() {
            return Err(Error::InvalidRequest("source path is empty".into()));
        }
        if self.target_size_bytes == 0 {
            return Err(Error::InvalidRequest(
                "target size must be positive".into(),
            ));
        }
        if !self.audio_bitrate_kbps.is_finite()
            || self.audio_bitrate_kbps < 0.0
            || self.audio_bitrate_kbps > MAX_AUDIO_KBPS
        {
            return Err(Error::InvalidRequest(format!(
                "audio bitrate {} kbps is outside 0..={MAX_AUDIO_KBPS}",
                self.audio_bitrate_kbps
            )));
        }
        if self.audio_codec.is_empty() {
            return Err(Error::InvalidRequest("audio codec is empty".into()));
        }
        for (name, dim) in [("max_width", self.max_width), ("max_height", self.max_height)] {
            if let Some(dim) = dim {
                if dim < MIN_SCALE_DIM {
                    return Err(Error::InvalidRequest(format!(
                        "{name} must be at least {MIN_SCALE_DIM}, got {dim}"
                    )));
                }
            }
        }
        let (start, end) = self.trim_bounds()?;
        if let (Some(start), Some(end)) = (start, end) {
            if end <= start {
                return Err(Error::InvalidRequest(format!(
                    "end_time ({end}s) must be after start_time ({start}s)"
                )));
            }
        }
        Ok(())
    }

    /// The trim range in seconds, parsed from the request's time strings.
    pub fn trim_bounds(&self) -> Result<(Option<f64>, Option<f64>)> {
        let start = self
            .start_time
            .as_deref()
            .map(parse_timestamp)
            .transpose()?;
        let end = self.end_time.as_deref().map(parse_timestamp).transpose()?;
        Ok((start, end))
    }
}

/// Parse `SS(.fff)`, `MM:SS`, or `HH:MM:SS` into seconds.
pub fn parse_timestamp(s: &str) -> Result<f64> {
    let invalid = || Error::InvalidRequest(format!("invalid timestamp: {s:?}"));
    let parts: Vec<&str> = s.split(':').collect();
    let secs = match parts.as_slice() {
        [secs] => secs.parse::<f64>().map_err(|_| invalid())?,
        [mins, secs] => {
            let mins = mins.parse::<u64>().map_err(|_| invalid())?;
            mins as f64 * 60.0 + secs.parse::<f64>().map_err(|_| invalid())?
        }
        [hours, mins, secs] => {
            let hours = hours.parse::<u64>().map_err(|_| invalid())?;
            let mins = mins.parse::<u64>().map_err(|_| invalid())?;
            hours as f64 * 3600.0 + mins as f64 * 60.0 + secs.parse::<f64>().map_err(|_| invalid())?
        }
        _ => return Err(invalid()),
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(invalid());
    }
    Ok(secs)
}

/// The fully resolved plan for a job, persisted on the job record before
/// the encode process starts so late subscribers can reconstruct context
/// via `get_job`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodePlan {
    pub selection: EncoderSelection,
    pub bitrate: BitratePlan,
    pub output: PathBuf,
    /// Audio codec after container compatibility switching.
    pub audio_codec: String,
    pub duration_secs: f64,
}

/// Final artifact descriptor for a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub output: PathBuf,
    pub output_bytes: u64,
    /// The encoder that produced the output (may differ from the plan after
    /// a CPU fallback).
    pub encoder: String,
}

/// A compression job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub request: EncodeRequest,
    pub state: JobState,
    /// Monotonically non-decreasing completion ratio in [0, 1].
    pub progress: f64,
    /// Source properties, recorded when probing succeeds.
    pub media: Option<MediaProbe>,
    pub plan: Option<EncodePlan>,
    /// Set only in the Completed state.
    pub result: Option<JobResult>,
    /// Set only in the Failed state.
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a freshly queued job for a validated request.
    pub fn new(id: JobId, request: EncodeRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            request,
            state: JobState::Queued,
            progress: 0.0,
            media: None,
            plan: None,
            result: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}
