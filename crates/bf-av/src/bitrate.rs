//! Target-size bitrate math.
//!
//! Given a duration and a byte budget, derive the total and video bitrates
//! that fill the budget, plus the rate-control companions (`-maxrate`,
//! `-bufsize`) the encoder invocation needs.

use serde::{Deserialize, Serialize};

use bf_core::config::EncodeConfig;
use bf_core::{Error, Result};

/// The computed bitrate budget for one encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitratePlan {
    /// Total (video + audio) bitrate in kbps that fills the byte budget.
    pub total_kbps: f64,
    /// Video bitrate in kbps as computed. May be below the quality floor or
    /// even negative when the audio alone exceeds the budget; callers use
    /// [`BitratePlan::invocation_video_kbps`] for the actual encoder args.
    pub video_kbps: f64,
    /// Audio bitrate in kbps the plan was computed against.
    pub audio_kbps: f64,
    /// `-maxrate` in kbps, derived from the clamped video bitrate.
    pub maxrate_kbps: u64,
    /// `-bufsize` in kbps, derived from the clamped video bitrate.
    pub bufsize_kbps: u64,
    /// Lowest video bitrate the invocation will use.
    min_invocation_kbps: f64,
    /// Set when the computed video bitrate is under the quality floor; the
    /// job proceeds anyway.
    pub warning: Option<String>,
}

impl BitratePlan {
    /// The video bitrate actually passed to the encoder: the computed value
    /// clamped up to the configured minimum.
    pub fn invocation_video_kbps(&self) -> u64 {
        self.video_kbps.max(self.min_invocation_kbps) as u64
    }
}

/// Compute the bitrate plan for a target output size.
///
/// `total_kbps = target_bytes * 8 / 1024 / duration`; the video share is
/// what remains after audio. The computed video bitrate is returned as-is
/// (possibly negative); rate-control companions are derived from the value
/// clamped to the configured invocation minimum.
///
/// # Errors
///
/// Returns [`Error::InvalidMedia`] when `duration_secs` is not positive.
pub fn compute(
    duration_secs: f64,
    target_bytes: u64,
    audio_kbps: f64,
    config: &EncodeConfig,
) -> Result<BitratePlan> {
    if duration_secs <= 0.0 || !duration_secs.is_finite() {
        return Err(Error::InvalidMedia(format!(
            "source duration must be positive, got {duration_secs}"
        )));
    }

    let total_kbps = target_bytes as f64 * 8.0 / 1024.0 / duration_secs;
    let video_kbps = total_kbps - audio_kbps;

    let warning = if video_kbps < config.quality_floor_kbps {
        Some(format!(
            "computed video bitrate {video_kbps:.2} kbps is below the {:.0} kbps quality floor; \
             the target size is likely not achievable at acceptable quality",
            config.quality_floor_kbps
        ))
    } else {
        None
    };

    let clamped = video_kbps.max(config.min_invocation_kbps);
    let maxrate_kbps = (clamped * config.maxrate_factor) as u64;
    let bufsize_kbps = (clamped * config.bufsize_factor) as u64;

    Ok(BitratePlan {
        total_kbps,
        video_kbps,
        audio_kbps,
        maxrate_kbps,
        bufsize_kbps,
        min_invocation_kbps: config.min_invocation_kbps,
        warning,
    })
}
