//! Hardware encoder capability detection.
//!
//! [`detect`] runs once per process and answers one question: which hardware
//! vendor's encoders can this host use, and for which codecs? Every probe is
//! best effort with a short timeout; a missing tool, non-zero exit, or
//! timeout simply means "vendor absent" and detection moves on. The CPU is
//! the unconditional fallback, so detection itself can never fail.
//!
//! Probe I/O is separated from classification: [`capabilities_from_probes`]
//! is a pure function over captured outputs so the vendor-ordering and
//! codec-derivation rules are testable without hardware.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// Timeout for each individual detection probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hardware vendor whose encoders will be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwVendor {
    Nvidia,
    Intel,
    Amd,
    /// Software encoding; always available.
    Cpu,
}

impl HwVendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            HwVendor::Nvidia => "nvidia",
            HwVendor::Intel => "intel",
            HwVendor::Amd => "amd",
            HwVendor::Cpu => "cpu",
        }
    }
}

/// Host platform, which selects between encoder backends for some vendors
/// (AMD uses AMF on Windows and VAAPI on Linux).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Windows,
}

impl Platform {
    /// The platform this binary was compiled for.
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }
}

/// Video codec family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    Hevc,
    Av1,
}

impl Codec {
    /// The ffmpeg encoder name prefix for this codec ("h264", "hevc", "av1").
    pub fn prefix(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::Hevc => "hevc",
            Codec::Av1 => "av1",
        }
    }

    pub const ALL: [Codec; 3] = [Codec::H264, Codec::Hevc, Codec::Av1];
}

/// The outcome of hardware detection: one vendor and the codecs its
/// encoders cover on this host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub vendor: HwVendor,
    pub platform: Platform,
    pub codecs: BTreeSet<Codec>,
}

impl Capabilities {
    /// Software-only capabilities: every codec, no hardware.
    pub fn cpu(platform: Platform) -> Self {
        Self {
            vendor: HwVendor::Cpu,
            platform,
            codecs: Codec::ALL.into_iter().collect(),
        }
    }

    /// Whether the detected vendor covers the given codec.
    pub fn supports(&self, codec: Codec) -> bool {
        self.codecs.contains(&codec)
    }
}

/// Raw outputs of the individual detection probes.
///
/// `None` means the probe failed in any way (tool missing, non-zero exit,
/// timeout); the distinction does not matter for classification.
#[derive(Debug, Default, Clone)]
pub struct ProbeOutcomes {
    /// stdout of `nvidia-smi -L` on success.
    pub nvidia_smi: Option<String>,
    /// stdout+stderr of `vainfo` on success (Linux only).
    pub vainfo: Option<String>,
    /// Whether `ffmpeg -init_hw_device qsv` succeeded (Windows only).
    pub qsv_init_ok: bool,
    /// Whether `ffmpeg -init_hw_device d3d11va` succeeded (Windows only).
    pub d3d11va_init_ok: bool,
    /// stdout of `ffmpeg -hide_banner -encoders` on success.
    pub encoders: Option<String>,
}

/// Detect hardware encoder capabilities for the current host.
///
/// First-match-wins vendor order: Nvidia, Intel, Amd, then Cpu. A vendor is
/// selected only when its presence probe succeeds AND ffmpeg's encoder
/// listing actually contains at least one encoder for it.
pub async fn detect(tools: &ToolRegistry, platform: Platform) -> Capabilities {
    let outcomes = run_probes(tools, platform).await;
    let caps = capabilities_from_probes(platform, &outcomes);
    tracing::info!(
        vendor = caps.vendor.as_str(),
        codecs = ?caps.codecs,
        "hardware detection complete"
    );
    caps
}

async fn run_probes(tools: &ToolRegistry, platform: Platform) -> ProbeOutcomes {
    let mut outcomes = ProbeOutcomes::default();

    if let Some(ffmpeg) = tools.get("ffmpeg") {
        let mut cmd = ToolCommand::new(ffmpeg.path.clone());
        cmd.args(["-hide_banner", "-encoders"]).timeout(PROBE_TIMEOUT);
        match cmd.execute().await {
            Ok(out) => outcomes.encoders = Some(out.stdout),
            Err(e) => tracing::debug!("encoder listing failed: {e}"),
        }
    }

    if let Some(smi) = tools.get("nvidia-smi") {
        let mut cmd = ToolCommand::new(smi.path.clone());
        cmd.arg("-L").timeout(PROBE_TIMEOUT);
        match cmd.execute().await {
            Ok(out) => outcomes.nvidia_smi = Some(out.stdout),
            Err(e) => tracing::debug!("nvidia-smi probe failed: {e}"),
        }
    }

    match platform {
        Platform::Linux => {
            if let Some(vainfo) = tools.get("vainfo") {
                let mut cmd = ToolCommand::new(vainfo.path.clone());
                cmd.timeout(PROBE_TIMEOUT);
                match cmd.execute().await {
                    // vainfo prints the driver line on stderr on some
                    // distributions; keep both.
                    Ok(out) => outcomes.vainfo = Some(format!("{}{}", out.stdout, out.stderr)),
                    Err(e) => tracing::debug!("vainfo probe failed: {e}"),
                }
            }
        }
        Platform::Windows => {
            if let Some(ffmpeg) = tools.get("ffmpeg") {
                outcomes.qsv_init_ok = init_hw_device(&ffmpeg.path, "qsv").await;
                outcomes.d3d11va_init_ok = init_hw_device(&ffmpeg.path, "d3d11va").await;
            }
        }
    }

    outcomes
}

/// Check that ffmpeg can initialise the given hardware device type by
/// running a trivial null encode with `-init_hw_device`.
async fn init_hw_device(ffmpeg_path: &std::path::Path, device: &str) -> bool {
    let mut cmd = ToolCommand::new(ffmpeg_path.to_path_buf());
    cmd.args([
        "-hide_banner",
        "-init_hw_device",
        device,
        "-f",
        "lavfi",
        "-i",
        "color=black:s=64x64:d=0.1",
        "-frames:v",
        "1",
        "-f",
        "null",
        "-",
    ])
    .timeout(PROBE_TIMEOUT);
    match cmd.execute().await {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!("init_hw_device {device} failed: {e}");
            false
        }
    }
}

/// Classify probe outcomes into capabilities. Pure; see module docs.
pub fn capabilities_from_probes(platform: Platform, outcomes: &ProbeOutcomes) -> Capabilities {
    let encoders = outcomes.encoders.as_deref().unwrap_or("");

    // Nvidia: nvidia-smi listed at least one GPU.
    let nvidia_present = outcomes
        .nvidia_smi
        .as_deref()
        .map(|out| out.contains("GPU"))
        .unwrap_or(false);
    if nvidia_present {
        let codecs = codecs_with_suffix(encoders, "_nvenc");
        if !codecs.is_empty() {
            return Capabilities {
                vendor: HwVendor::Nvidia,
                platform,
                codecs,
            };
        }
    }

    // Intel: VAAPI driver string on Linux, QSV device init on Windows.
    let intel_present = match platform {
        Platform::Linux => outcomes
            .vainfo
            .as_deref()
            .map(|out| out.contains("iHD") || out.contains("i965"))
            .unwrap_or(false),
        Platform::Windows => outcomes.qsv_init_ok,
    };
    if intel_present {
        let codecs = codecs_with_suffix(encoders, "_qsv");
        if !codecs.is_empty() {
            return Capabilities {
                vendor: HwVendor::Intel,
                platform,
                codecs,
            };
        }
    }

    // Amd: VAAPI driver string on Linux, D3D11VA device init on Windows.
    let (amd_present, amd_suffix) = match platform {
        Platform::Linux => (
            outcomes
                .vainfo
                .as_deref()
                .map(|out| out.contains("radeonsi") || out.contains("AMD"))
                .unwrap_or(false),
            "_vaapi",
        ),
        Platform::Windows => (outcomes.d3d11va_init_ok, "_amf"),
    };
    if amd_present {
        let codecs = codecs_with_suffix(encoders, amd_suffix);
        if !codecs.is_empty() {
            return Capabilities {
                vendor: HwVendor::Amd,
                platform,
                codecs,
            };
        }
    }

    Capabilities::cpu(platform)
}

/// Which codecs have an encoder named `<prefix><suffix>` in the listing.
fn codecs_with_suffix(encoders: &str, suffix: &str) -> BTreeSet<Codec> {
    Codec::ALL
        .into_iter()
        .filter(|codec| encoders.contains(&format!("{}{}", codec.prefix(), suffix)))
        .collect()
}
