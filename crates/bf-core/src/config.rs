//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs for tools, encoding, the event relay, and paths. Every section
//! defaults sensibly so a completely empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tools: ToolsConfig,
    pub encode: EncodeConfig,
    pub relay: RelayConfig,
    pub paths: PathsConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    ///
    /// This is intentionally string-based so the caller can read the file
    /// however it sees fit (async, embedded, etc.).
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::InvalidRequest(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.encode.quality_floor_kbps <= 0.0 {
            warnings.push("encode.quality_floor_kbps is not positive; the feasibility warning will never fire".into());
        }
        if self.encode.maxrate_factor < 1.0 {
            warnings.push("encode.maxrate_factor below 1.0 caps peaks under the target bitrate".into());
        }
        if self.relay.replay_capacity == 0 {
            warnings.push("relay.replay_capacity is 0; late subscribers receive no history".into());
        }
        if self.relay.broadcast_capacity == 0 {
            warnings.push("relay.broadcast_capacity is 0; live delivery is disabled".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Path overrides for external tools. When a path is unset (or does not
/// exist) the tool is looked up on `PATH` instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
    pub nvidia_smi_path: Option<PathBuf>,
    pub vainfo_path: Option<PathBuf>,
}

/// Rounding direction when a P1..P7 preset ordinal is mapped onto a named
/// scale with fewer steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresetRounding {
    /// Round toward the faster end of the scale.
    Faster,
    /// Round to the nearest name.
    Nearest,
}

/// Encoding behavior knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeConfig {
    /// Below this video bitrate the result is flagged as likely unachievable
    /// at acceptable quality. The job still proceeds.
    pub quality_floor_kbps: f64,
    /// Lowest video bitrate ever passed to the encoder. The computed value
    /// may be lower (even negative); the invocation is clamped to this.
    pub min_invocation_kbps: f64,
    /// `-maxrate` as a multiple of the video bitrate.
    pub maxrate_factor: f64,
    /// `-bufsize` as a multiple of the video bitrate.
    pub bufsize_factor: f64,
    /// Minimum seconds between consecutive progress events per job.
    pub progress_interval_secs: u64,
    /// Maximum wall-clock seconds for one encode process.
    pub timeout_secs: u64,
    /// How preset ordinals are rounded onto shorter named scales.
    pub preset_rounding: PresetRounding,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            quality_floor_kbps: 100.0,
            min_invocation_kbps: 16.0,
            maxrate_factor: 1.2,
            bufsize_factor: 2.0,
            progress_interval_secs: 1,
            timeout_secs: 86400,
            preset_rounding: PresetRounding::Faster,
        }
    }
}

/// Event relay tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Events retained per job for replay to late subscribers.
    pub replay_capacity: usize,
    /// Broadcast channel buffer; subscribers lagging past this are dropped.
    pub broadcast_capacity: usize,
    /// Seconds a finished job's channel stays available after its terminal
    /// event before teardown.
    pub teardown_grace_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            replay_capacity: 256,
            broadcast_capacity: 256,
            teardown_grace_secs: 60,
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory where encoded outputs are written.
    pub work_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("bytefit"),
        }
    }
}
