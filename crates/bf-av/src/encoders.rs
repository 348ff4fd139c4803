//! Codec and preset resolution against detected hardware capabilities.
//!
//! [`resolve`] is pure and total: every `(codec, capabilities)` combination
//! maps to a concrete ffmpeg encoder with its flag set, falling back to the
//! software row whenever the detected vendor cannot serve the requested
//! codec. It never errors.

use serde::{Deserialize, Serialize};

use bf_core::config::PresetRounding;

use crate::hw::{Capabilities, Codec, HwVendor, Platform};

/// Speed/quality preset ordinal, fastest (`P1`) to slowest (`P7`).
///
/// The ordinal scale matches NVENC's native preset names; other encoders map
/// it onto their own named scales by linear position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    P1,
    P2,
    P3,
    P4,
    P5,
    P6,
    P7,
}

impl Preset {
    /// 1-based ordinal position.
    pub fn ordinal(&self) -> usize {
        match self {
            Preset::P1 => 1,
            Preset::P2 => 2,
            Preset::P3 => 3,
            Preset::P4 => 4,
            Preset::P5 => 5,
            Preset::P6 => 6,
            Preset::P7 => 7,
        }
    }

    /// NVENC native preset name ("p1".."p7").
    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::P1 => "p1",
            Preset::P2 => "p2",
            Preset::P3 => "p3",
            Preset::P4 => "p4",
            Preset::P5 => "p5",
            Preset::P6 => "p6",
            Preset::P7 => "p7",
        }
    }
}

impl Default for Preset {
    fn default() -> Self {
        Preset::P4
    }
}

impl std::str::FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p1" => Ok(Preset::P1),
            "p2" => Ok(Preset::P2),
            "p3" => Ok(Preset::P3),
            "p4" => Ok(Preset::P4),
            "p5" => Ok(Preset::P5),
            "p6" => Ok(Preset::P6),
            "p7" => Ok(Preset::P7),
            other => Err(format!("unknown preset: {other}")),
        }
    }
}

/// Intel QSV preset names, fastest to slowest (same length as the ordinal
/// scale, so the mapping is 1:1).
const QSV_PRESETS: &[&str] = &[
    "veryfast", "faster", "fast", "medium", "slow", "slower", "veryslow",
];

/// AMD AMF `-quality` values, fastest to slowest.
const AMF_QUALITIES: &[&str] = &["speed", "balanced", "quality"];

/// Software encoder preset names, fastest to slowest.
const CPU_PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
];

/// A fully resolved encoder choice with all encoder-specific flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderSelection {
    /// The ffmpeg encoder name (e.g. "hevc_nvenc", "libx264").
    pub encoder: String,
    /// The vendor this encoder belongs to.
    pub vendor: HwVendor,
    /// Flags placed before `-i` (hardware device initialisation).
    pub init_hw_flags: Vec<String>,
    /// Flags placed after `-c:v` (pixel format, filters, profile).
    pub video_flags: Vec<String>,
    /// The preset/quality argument pair for this encoder.
    pub preset_args: Vec<String>,
    /// The tune argument pair, when the encoder supports one.
    pub tune_args: Vec<String>,
}

impl EncoderSelection {
    /// Whether this selection uses a hardware encoder.
    pub fn is_hardware(&self) -> bool {
        self.vendor != HwVendor::Cpu
    }
}

/// Resolve a requested codec and preset against the detected capabilities.
///
/// When the detected vendor does not cover the requested codec (or is the
/// CPU already), the software encoder row for that codec is used.
pub fn resolve(
    codec: Codec,
    preset: Preset,
    tune: Option<&str>,
    caps: &Capabilities,
    rounding: PresetRounding,
) -> EncoderSelection {
    let vendor = if caps.vendor != HwVendor::Cpu && caps.supports(codec) {
        caps.vendor
    } else {
        HwVendor::Cpu
    };

    match vendor {
        HwVendor::Nvidia => EncoderSelection {
            encoder: format!("{}_nvenc", codec.prefix()),
            vendor,
            init_hw_flags: vec!["-hwaccel".into(), "cuda".into()],
            video_flags: vec![],
            preset_args: vec!["-preset".into(), preset.as_str().into()],
            // NVENC takes the requested tune directly.
            tune_args: vec!["-tune".into(), tune.unwrap_or("hq").into()],
        },
        HwVendor::Intel => EncoderSelection {
            encoder: format!("{}_qsv", codec.prefix()),
            vendor,
            init_hw_flags: vec!["-hwaccel".into(), "qsv".into()],
            video_flags: vec![],
            preset_args: vec![
                "-preset".into(),
                scale_name(QSV_PRESETS, preset, rounding).into(),
            ],
            tune_args: vec![],
        },
        HwVendor::Amd => match caps.platform {
            Platform::Windows => EncoderSelection {
                encoder: format!("{}_amf", codec.prefix()),
                vendor,
                init_hw_flags: vec![],
                video_flags: vec![],
                preset_args: vec![
                    "-quality".into(),
                    scale_name(AMF_QUALITIES, preset, rounding).into(),
                ],
                tune_args: vec![],
            },
            Platform::Linux => EncoderSelection {
                encoder: format!("{}_vaapi", codec.prefix()),
                vendor,
                init_hw_flags: vec![
                    "-hwaccel".into(),
                    "vaapi".into(),
                    "-hwaccel_output_format".into(),
                    "vaapi".into(),
                ],
                // Frames must be uploaded to the VAAPI device.
                video_flags: vec!["-vf".into(), "format=nv12|vaapi,hwupload".into()],
                // VAAPI exposes no named presets; 7 is its best-effort level.
                preset_args: vec!["-compression_level".into(), "7".into()],
                tune_args: vec![],
            },
        },
        HwVendor::Cpu => {
            let (encoder, video_flags, tune_args): (&str, Vec<String>, Vec<String>) = match codec {
                Codec::H264 => (
                    "libx264",
                    vec![
                        "-pix_fmt".into(),
                        "yuv420p".into(),
                        "-profile:v".into(),
                        "high".into(),
                    ],
                    vec!["-tune".into(), "film".into()],
                ),
                Codec::Hevc => ("libx265", vec!["-pix_fmt".into(), "yuv420p".into()], vec![]),
                Codec::Av1 => ("libsvtav1", vec![], vec![]),
            };
            EncoderSelection {
                encoder: encoder.to_string(),
                vendor: HwVendor::Cpu,
                init_hw_flags: vec![],
                video_flags,
                preset_args: vec![
                    "-preset".into(),
                    scale_name(CPU_PRESETS, preset, rounding).into(),
                ],
                tune_args,
            }
        }
    }
}

/// Re-resolve a selection for software encoding, used for the one-shot
/// fallback after a hardware initialisation failure.
pub fn resolve_cpu(codec: Codec, preset: Preset, platform: Platform, rounding: PresetRounding) -> EncoderSelection {
    resolve(codec, preset, None, &Capabilities::cpu(platform), rounding)
}

/// Map a preset ordinal onto a named scale by linear position.
fn scale_name(
    names: &'static [&'static str],
    preset: Preset,
    rounding: PresetRounding,
) -> &'static str {
    let span = (names.len() - 1) as f64;
    let pos = (preset.ordinal() - 1) as f64 * span / 6.0;
    let index = match rounding {
        // Lower index = faster name.
        PresetRounding::Faster => pos.floor() as usize,
        PresetRounding::Nearest => pos.round() as usize,
    };
    names[index.min(names.len() - 1)]
}
