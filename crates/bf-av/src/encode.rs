//! Supervised ffmpeg encode with structured progress parsing.
//!
//! [`run_encode`] assembles the ffmpeg invocation from a resolved plan,
//! spawns it with both pipes drained concurrently, turns the `-progress`
//! stream into structured updates, and applies the single hardware-to-CPU
//! retry when the failure signature says the hardware path cannot
//! initialise.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use bf_core::config::EncodeConfig;
use bf_core::{Error, Result};

use crate::command::{StreamLine, ToolCommand};
use crate::encoders::{self, EncoderSelection, Preset};
use crate::hw::{Codec, Platform};

/// How many trailing stderr lines are kept for diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Substrings (lowercase) in the stderr tail that identify a hardware
/// initialisation failure, as opposed to a genuine encode error.
const HW_INIT_FAILURE_SIGNATURES: &[&str] = &[
    "no nvenc capable devices",
    "cannot load",
    "failed to initialise",
    "failed to initialize",
    "no device found",
    "driver does not support",
    "device creation failed",
];

/// Everything needed to run one encode.
#[derive(Debug, Clone)]
pub struct EncodeParams {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Requested codec; kept alongside the selection so the CPU retry can
    /// re-resolve.
    pub codec: Codec,
    pub preset: Preset,
    pub selection: EncoderSelection,
    pub video_kbps: u64,
    pub maxrate_kbps: u64,
    pub bufsize_kbps: u64,
    pub audio_codec: String,
    pub audio_kbps: u64,
    /// Duration of the encoded range (the clip when trimming, otherwise the
    /// source), the denominator for progress ratios.
    pub duration_secs: f64,
    /// Maximum output width; the source is downscaled preserving aspect
    /// ratio, never upscaled.
    pub max_width: Option<u32>,
    /// Maximum output height, same semantics as `max_width`.
    pub max_height: Option<u32>,
    /// Trim start in seconds (placed before `-i` for fast seeking).
    pub trim_start_secs: Option<f64>,
    /// Trim end in seconds, already clamped to the source duration.
    pub trim_end_secs: Option<f64>,
    /// Codec of the source video stream, from probing.
    pub source_video_codec: Option<String>,
}

/// An event surfaced while the encode runs.
#[derive(Debug, Clone)]
pub enum EncodeEvent {
    /// A raw stderr line, or a pipeline notice (command line, codec switch,
    /// retry).
    Log(String),
    /// A structured progress sample.
    Progress {
        ratio: f64,
        fps: Option<f64>,
        speed: Option<String>,
    },
}

/// Result of a successful encode.
#[derive(Debug, Clone)]
pub struct EncodeOutcome {
    pub output: PathBuf,
    pub output_bytes: u64,
    /// The encoder that actually produced the output (differs from the
    /// requested selection after a CPU fallback).
    pub encoder: String,
}

/// Run the encode described by `params`.
///
/// On a non-zero exit whose stderr tail matches a hardware-init failure
/// signature, and only when the attempt used a hardware encoder, the plan is
/// re-resolved for software and retried exactly once. Any other failure, and
/// any failure of the retry itself, is terminal and carries the captured
/// stderr tail.
pub async fn run_encode(
    ffmpeg_path: &Path,
    params: &EncodeParams,
    config: &EncodeConfig,
    platform: Platform,
    cancel: &CancellationToken,
    on_event: &mut (dyn FnMut(EncodeEvent) + Send),
) -> Result<EncodeOutcome> {
    let mut params = params.clone();

    // mp4 muxers handle libopus poorly; switch to aac rather than failing
    // at mux time.
    let (audio_codec, switched) = effective_audio_codec(&params.output, &params.audio_codec);
    if switched {
        on_event(EncodeEvent::Log(
            "mp4 container selected; switching audio codec from libopus to aac".into(),
        ));
        params.audio_codec = audio_codec;
    }

    if params.max_width.is_some() || params.max_height.is_some() {
        on_event(EncodeEvent::Log(format!(
            "scaling to max {}x{}",
            params.max_width.map_or("any".into(), |w| w.to_string()),
            params.max_height.map_or("any".into(), |h| h.to_string()),
        )));
    }
    if let Some(start) = params.trim_start_secs {
        on_event(EncodeEvent::Log(format!("trimming: start at {start}s")));
    }
    if let Some(end) = params.trim_end_secs {
        on_event(EncodeEvent::Log(format!("trimming: end at {end}s")));
    }

    match attempt(ffmpeg_path, &params, config, cancel, on_event).await {
        Ok(outcome) => Ok(outcome),
        Err(AttemptError::Fatal(err)) => Err(err),
        Err(AttemptError::HwInit { status, tail: _ }) => {
            tracing::warn!(
                encoder = %params.selection.encoder,
                status = %status,
                "hardware encoder failed to initialise; retrying on CPU"
            );
            on_event(EncodeEvent::Log(format!(
                "{} failed to initialise ({status}); retrying with software encoding",
                params.selection.encoder
            )));

            params.selection =
                encoders::resolve_cpu(params.codec, params.preset, platform, config.preset_rounding);
            match attempt(ffmpeg_path, &params, config, cancel, on_event).await {
                Ok(outcome) => Ok(outcome),
                Err(AttemptError::Fatal(err)) => Err(err),
                // The retry never retries; surface the second tail.
                Err(AttemptError::HwInit { status, tail }) => Err(Error::process(status, tail)),
            }
        }
    }
}

/// Why a single attempt failed.
enum AttemptError {
    /// Eligible for the CPU retry (hardware attempt, matching signature).
    HwInit { status: String, tail: String },
    /// Not retryable.
    Fatal(Error),
}

async fn attempt(
    ffmpeg_path: &Path,
    params: &EncodeParams,
    config: &EncodeConfig,
    cancel: &CancellationToken,
    on_event: &mut (dyn FnMut(EncodeEvent) + Send),
) -> std::result::Result<EncodeOutcome, AttemptError> {
    if wants_dav1d(params) {
        on_event(EncodeEvent::Log("decoding av1 source with libdav1d".into()));
    }

    let args = build_args(params);
    on_event(EncodeEvent::Log(format!(
        "ffmpeg command: {} {}",
        ffmpeg_path.display(),
        args.join(" ")
    )));

    let mut parser = ProgressParser::new(
        params.duration_secs,
        Duration::from_secs(config.progress_interval_secs),
    );
    let mut tail = StderrTail::new(STDERR_TAIL_LINES);

    let mut cmd = ToolCommand::new(ffmpeg_path.to_path_buf());
    cmd.args(args)
        .timeout(Duration::from_secs(config.timeout_secs));

    let status = cmd
        .stream(
            |line| match line {
                StreamLine::Stdout(l) => {
                    if let Some(update) = parser.push_line(l) {
                        on_event(EncodeEvent::Progress {
                            ratio: update.ratio,
                            fps: update.fps,
                            speed: update.speed,
                        });
                    }
                }
                StreamLine::Stderr(l) => {
                    tail.push(l);
                    on_event(EncodeEvent::Log(l.to_string()));
                }
            },
            cancel,
        )
        .await
        .map_err(AttemptError::Fatal)?;

    if !status.success() {
        let status_desc = match status.code() {
            Some(code) => format!("exit code {code}"),
            None => "signal".to_string(),
        };
        let tail_text = tail.joined();
        if params.selection.is_hardware() && is_hw_init_failure(&tail_text) {
            return Err(AttemptError::HwInit {
                status: status_desc,
                tail: tail_text,
            });
        }
        return Err(AttemptError::Fatal(Error::process(status_desc, tail_text)));
    }

    validate_artifact(&params.output).map_err(AttemptError::Fatal)?;

    let output_bytes = std::fs::metadata(&params.output)
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(EncodeOutcome {
        output: params.output.clone(),
        output_bytes,
        encoder: params.selection.encoder.clone(),
    })
}

/// A zero exit with no usable output is still a failure.
fn validate_artifact(output: &Path) -> Result<()> {
    match std::fs::metadata(output) {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) => Err(Error::ArtifactValidation(format!(
            "output {} is empty",
            output.display()
        ))),
        Err(_) => Err(Error::ArtifactValidation(format!(
            "output {} was not created",
            output.display()
        ))),
    }
}

/// Swap libopus for aac when the output is mp4. Returns the codec to use
/// and whether a switch happened.
fn effective_audio_codec(output: &Path, audio_codec: &str) -> (String, bool) {
    let is_mp4 = output
        .extension()
        .map(|e| e.eq_ignore_ascii_case("mp4"))
        .unwrap_or(false);
    if is_mp4 && audio_codec == "libopus" {
        ("aac".to_string(), true)
    } else {
        (audio_codec.to_string(), false)
    }
}

/// The software decode path prefers libdav1d for AV1 sources; hardware
/// attempts decode on the device instead.
fn wants_dav1d(params: &EncodeParams) -> bool {
    params.source_video_codec.as_deref() == Some("av1") && !params.selection.is_hardware()
}

/// ffmpeg `scale=` filter limiting output dimensions while preserving
/// aspect ratio. `-2` keeps the free dimension even, as encoders require.
fn scale_filter(max_width: Option<u32>, max_height: Option<u32>) -> Option<String> {
    match (max_width, max_height) {
        (Some(w), Some(h)) => Some(format!(
            "scale='min(iw,{w})':'min(ih,{h})':force_original_aspect_ratio=decrease"
        )),
        (Some(w), None) => Some(format!("scale='min(iw,{w})':-2")),
        (None, Some(h)) => Some(format!("scale=-2:'min(ih,{h})'")),
        (None, None) => None,
    }
}

/// Assemble the full ffmpeg argument list for an encode.
pub fn build_args(params: &EncodeParams) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-y".into()];
    args.extend(params.selection.init_hw_flags.iter().cloned());
    // -ss before -i seeks on the demuxer, which is much faster.
    if let Some(start) = params.trim_start_secs {
        args.push("-ss".into());
        args.push(start.to_string());
    }
    if wants_dav1d(params) {
        args.push("-c:v".into());
        args.push("libdav1d".into());
    }
    args.push("-i".into());
    args.push(params.input.to_string_lossy().into_owned());
    match (params.trim_start_secs, params.trim_end_secs) {
        // With a seek in effect, output timestamps restart at zero, so the
        // end bound becomes a duration.
        (Some(start), Some(end)) if end > start => {
            args.push("-t".into());
            args.push((end - start).to_string());
        }
        (None, Some(end)) => {
            args.push("-to".into());
            args.push(end.to_string());
        }
        _ => {}
    }
    args.push("-c:v".into());
    args.push(params.selection.encoder.clone());
    match scale_filter(params.max_width, params.max_height) {
        Some(scale) => {
            // VAAPI already carries a -vf for the device upload; the scale
            // step must run before it, on the same filter chain.
            let mut merged = false;
            let mut flags = params.selection.video_flags.iter();
            while let Some(flag) = flags.next() {
                args.push(flag.clone());
                if flag == "-vf" {
                    if let Some(value) = flags.next() {
                        args.push(format!("{scale},{value}"));
                        merged = true;
                    }
                }
            }
            if !merged {
                args.push("-vf".into());
                args.push(scale);
            }
        }
        None => args.extend(params.selection.video_flags.iter().cloned()),
    }
    args.push("-b:v".into());
    args.push(format!("{}k", params.video_kbps));
    args.push("-maxrate".into());
    args.push(format!("{}k", params.maxrate_kbps));
    args.push("-bufsize".into());
    args.push(format!("{}k", params.bufsize_kbps));
    args.extend(params.selection.preset_args.iter().cloned());
    args.extend(params.selection.tune_args.iter().cloned());
    args.push("-c:a".into());
    args.push(params.audio_codec.clone());
    args.push("-b:a".into());
    args.push(format!("{}k", params.audio_kbps));
    if params
        .output
        .extension()
        .map(|e| e.eq_ignore_ascii_case("mp4"))
        .unwrap_or(false)
    {
        args.push("-movflags".into());
        args.push("+faststart".into());
    }
    args.push("-progress".into());
    args.push("pipe:1".into());
    args.push("-nostats".into());
    args.push(params.output.to_string_lossy().into_owned());
    args
}

/// Whether a stderr tail identifies a hardware initialisation failure.
pub fn is_hw_init_failure(tail: &str) -> bool {
    let lower = tail.to_lowercase();
    HW_INIT_FAILURE_SIGNATURES
        .iter()
        .any(|sig| lower.contains(sig))
}

// ---------------------------------------------------------------------------
// Progress parsing
// ---------------------------------------------------------------------------

/// One structured sample out of the `-progress` stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Completion ratio in [0, 1].
    pub ratio: f64,
    pub fps: Option<f64>,
    pub speed: Option<String>,
}

/// Stateful parser for ffmpeg's `-progress pipe:1` output.
///
/// The stream is `key=value` lines; a `progress=continue|end` line closes a
/// block. One update is produced per block boundary, throttled to a minimum
/// ratio delta and a minimum interval, except that the final block
/// (`progress=end`, or any ratio at the very top of the range) always emits.
pub struct ProgressParser {
    duration_secs: f64,
    min_interval: Duration,
    min_delta: f64,
    elapsed_secs: Option<f64>,
    fps: Option<f64>,
    speed: Option<String>,
    last_ratio: Option<f64>,
    last_emit_at: Option<Instant>,
}

impl ProgressParser {
    pub fn new(duration_secs: f64, min_interval: Duration) -> Self {
        Self {
            duration_secs,
            min_interval,
            min_delta: 0.01,
            elapsed_secs: None,
            fps: None,
            speed: None,
            last_ratio: None,
            last_emit_at: None,
        }
    }

    /// Feed one stdout line; returns an update at emitting block boundaries.
    pub fn push_line(&mut self, line: &str) -> Option<ProgressUpdate> {
        let (key, value) = line.split_once('=')?;
        let key = key.trim();
        let value = value.trim();

        match key {
            // ffmpeg reports both fields in microseconds (out_time_ms is
            // microseconds too, despite the name).
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    self.elapsed_secs = Some(us as f64 / 1_000_000.0);
                }
                None
            }
            "fps" => {
                self.fps = value.parse::<f64>().ok().filter(|f| *f > 0.0);
                None
            }
            "speed" => {
                if value != "N/A" {
                    self.speed = Some(value.to_string());
                }
                None
            }
            "progress" => self.finish_block(value == "end"),
            _ => None,
        }
    }

    fn finish_block(&mut self, is_end: bool) -> Option<ProgressUpdate> {
        let elapsed = self.elapsed_secs?;
        if self.duration_secs <= 0.0 {
            return None;
        }
        let ratio = (elapsed / self.duration_secs).clamp(0.0, 1.0);

        let delta_ok = self
            .last_ratio
            .map(|last| ratio - last >= self.min_delta)
            .unwrap_or(true);
        let interval_ok = self
            .last_emit_at
            .map(|at| at.elapsed() >= self.min_interval)
            .unwrap_or(true);

        if !(is_end || ratio >= 0.999 || (delta_ok && interval_ok)) {
            return None;
        }

        self.last_ratio = Some(ratio);
        self.last_emit_at = Some(Instant::now());
        Some(ProgressUpdate {
            ratio,
            fps: self.fps.take(),
            speed: self.speed.take(),
        })
    }
}

// ---------------------------------------------------------------------------
// Stderr tail
// ---------------------------------------------------------------------------

/// Bounded buffer of the most recent stderr lines.
struct StderrTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StderrTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    fn joined(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bf_core::config::PresetRounding;
    use crate::hw::{Capabilities, HwVendor};

    fn cpu_params() -> EncodeParams {
        let caps = Capabilities::cpu(Platform::Linux);
        let selection =
            encoders::resolve(Codec::H264, Preset::P4, None, &caps, PresetRounding::Faster);
        EncodeParams {
            input: PathBuf::from("/in/src.mkv"),
            output: PathBuf::from("/out/job.mp4"),
            codec: Codec::H264,
            preset: Preset::P4,
            selection,
            video_kbps: 964,
            maxrate_kbps: 1157,
            bufsize_kbps: 1928,
            audio_codec: "aac".into(),
            audio_kbps: 128,
            duration_secs: 60.0,
            max_width: None,
            max_height: None,
            trim_start_secs: None,
            trim_end_secs: None,
            source_video_codec: Some("h264".into()),
        }
    }

    #[test]
    fn args_have_expected_shape() {
        let args = build_args(&cpu_params());
        let joined = args.join(" ");
        assert!(joined.starts_with("-hide_banner -y -i /in/src.mkv -c:v libx264"));
        assert!(joined.contains("-b:v 964k -maxrate 1157k -bufsize 1928k"));
        assert!(joined.contains("-preset faster -tune film"));
        assert!(joined.contains("-c:a aac -b:a 128k"));
        assert!(joined.contains("-movflags +faststart"));
        assert!(joined.ends_with("-progress pipe:1 -nostats /out/job.mp4"));
    }

    #[test]
    fn hw_init_flags_come_before_input() {
        let caps = Capabilities {
            vendor: HwVendor::Nvidia,
            platform: Platform::Linux,
            codecs: Codec::ALL.into_iter().collect(),
        };
        let mut params = cpu_params();
        params.selection =
            encoders::resolve(Codec::H264, Preset::P4, None, &caps, PresetRounding::Faster);
        let args = build_args(&params);
        let hwaccel = args.iter().position(|a| a == "-hwaccel").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(hwaccel < input);
    }

    #[test]
    fn scale_filter_limits_dimensions_without_upscaling() {
        assert_eq!(
            scale_filter(Some(1280), Some(720)).unwrap(),
            "scale='min(iw,1280)':'min(ih,720)':force_original_aspect_ratio=decrease"
        );
        assert_eq!(scale_filter(Some(1280), None).unwrap(), "scale='min(iw,1280)':-2");
        assert_eq!(scale_filter(None, Some(720)).unwrap(), "scale=-2:'min(ih,720)'");
        assert_eq!(scale_filter(None, None), None);
    }

    #[test]
    fn scaled_cpu_encode_gets_a_vf_arg() {
        let mut params = cpu_params();
        params.max_width = Some(1280);
        let args = build_args(&params);
        let vf = args.iter().position(|a| a == "-vf").unwrap();
        assert_eq!(args[vf + 1], "scale='min(iw,1280)':-2");
    }

    #[test]
    fn scale_merges_into_vaapi_filter_chain() {
        let caps = Capabilities {
            vendor: HwVendor::Amd,
            platform: Platform::Linux,
            codecs: Codec::ALL.into_iter().collect(),
        };
        let mut params = cpu_params();
        params.selection =
            encoders::resolve(Codec::H264, Preset::P4, None, &caps, PresetRounding::Faster);
        params.max_width = Some(1920);
        params.max_height = Some(1080);
        let args = build_args(&params);

        // Exactly one filter chain, with the scale step before the upload.
        assert_eq!(args.iter().filter(|a| *a == "-vf").count(), 1);
        let vf = args.iter().position(|a| a == "-vf").unwrap();
        assert_eq!(
            args[vf + 1],
            "scale='min(iw,1920)':'min(ih,1080)':force_original_aspect_ratio=decrease,\
             format=nv12|vaapi,hwupload"
        );
    }

    #[test]
    fn trim_start_seeks_before_input_and_end_becomes_duration() {
        let mut params = cpu_params();
        params.trim_start_secs = Some(10.0);
        params.trim_end_secs = Some(40.0);
        let args = build_args(&params);

        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < input);
        assert_eq!(args[ss + 1], "10");
        let t = args.iter().position(|a| a == "-t").unwrap();
        assert!(t > input);
        assert_eq!(args[t + 1], "30");
        assert!(!args.contains(&"-to".to_string()));
    }

    #[test]
    fn trim_end_alone_uses_to() {
        let mut params = cpu_params();
        params.trim_end_secs = Some(42.5);
        let args = build_args(&params);
        let to = args.iter().position(|a| a == "-to").unwrap();
        assert_eq!(args[to + 1], "42.5");
        assert!(!args.contains(&"-ss".to_string()));
        assert!(!args.contains(&"-t".to_string()));
    }

    #[test]
    fn av1_source_on_cpu_decodes_with_dav1d() {
        let mut params = cpu_params();
        params.source_video_codec = Some("av1".into());
        let args = build_args(&params);

        // Decoder selection is an input option; encoder selection follows -i.
        let input = args.iter().position(|a| a == "-i").unwrap();
        let decoder = args.iter().position(|a| a == "libdav1d").unwrap();
        assert!(decoder < input);
        assert!(args.iter().any(|a| a == "libx264"));
    }

    #[test]
    fn av1_source_on_hardware_keeps_device_decode() {
        let caps = Capabilities {
            vendor: HwVendor::Nvidia,
            platform: Platform::Linux,
            codecs: Codec::ALL.into_iter().collect(),
        };
        let mut params = cpu_params();
        params.selection =
            encoders::resolve(Codec::H264, Preset::P4, None, &caps, PresetRounding::Faster);
        params.source_video_codec = Some("av1".into());
        let args = build_args(&params);
        assert!(!args.contains(&"libdav1d".to_string()));
    }

    #[test]
    fn mkv_output_skips_faststart() {
        let mut params = cpu_params();
        params.output = PathBuf::from("/out/job.mkv");
        let args = build_args(&params);
        assert!(!args.contains(&"-movflags".to_string()));
    }

    #[test]
    fn libopus_into_mp4_switches_to_aac() {
        let (codec, switched) = effective_audio_codec(Path::new("/out/a.mp4"), "libopus");
        assert_eq!(codec, "aac");
        assert!(switched);

        let (codec, switched) = effective_audio_codec(Path::new("/out/a.mkv"), "libopus");
        assert_eq!(codec, "libopus");
        assert!(!switched);

        let (codec, switched) = effective_audio_codec(Path::new("/out/a.mp4"), "aac");
        assert_eq!(codec, "aac");
        assert!(!switched);
    }

    #[test]
    fn parser_emits_on_block_boundary() {
        let mut parser = ProgressParser::new(100.0, Duration::ZERO);
        assert!(parser.push_line("frame=100").is_none());
        assert!(parser.push_line("fps=50.2").is_none());
        assert!(parser.push_line("out_time_us=30000000").is_none());
        assert!(parser.push_line("speed=2.5x").is_none());
        let update = parser.push_line("progress=continue").unwrap();
        assert!((update.ratio - 0.3).abs() < 1e-9);
        assert_eq!(update.fps, Some(50.2));
        assert_eq!(update.speed.as_deref(), Some("2.5x"));
    }

    #[test]
    fn parser_accepts_out_time_ms_as_microseconds() {
        let mut parser = ProgressParser::new(100.0, Duration::ZERO);
        parser.push_line("out_time_ms=50000000");
        let update = parser.push_line("progress=continue").unwrap();
        assert!((update.ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn parser_throttles_small_deltas() {
        let mut parser = ProgressParser::new(1000.0, Duration::ZERO);
        parser.push_line("out_time_us=10000000");
        assert!(parser.push_line("progress=continue").is_some());
        // 1.0% -> 1.5%: below the 1% delta.
        parser.push_line("out_time_us=15000000");
        assert!(parser.push_line("progress=continue").is_none());
        // 1.0% -> 2.5%: above it.
        parser.push_line("out_time_us=25000000");
        assert!(parser.push_line("progress=continue").is_some());
    }

    #[test]
    fn parser_end_block_always_emits() {
        let mut parser = ProgressParser::new(100.0, Duration::from_secs(3600));
        parser.push_line("out_time_us=10000000");
        assert!(parser.push_line("progress=continue").is_some());
        // Throttled by interval, but progress=end overrides.
        parser.push_line("out_time_us=10100000");
        assert!(parser.push_line("progress=end").is_some());
    }

    #[test]
    fn parser_clamps_ratio() {
        let mut parser = ProgressParser::new(10.0, Duration::ZERO);
        parser.push_line("out_time_us=15000000");
        let update = parser.push_line("progress=continue").unwrap();
        assert_eq!(update.ratio, 1.0);
    }

    #[test]
    fn parser_ignores_garbage() {
        let mut parser = ProgressParser::new(100.0, Duration::ZERO);
        assert!(parser.push_line("no equals sign here").is_none());
        assert!(parser.push_line("out_time_us=notanumber").is_none());
        // No elapsed yet, so a boundary emits nothing.
        assert!(parser.push_line("progress=continue").is_none());
    }

    #[test]
    fn hw_signatures_match_case_insensitively() {
        assert!(is_hw_init_failure("No NVENC capable devices found"));
        assert!(is_hw_init_failure("Cannot load libnvidia-encode.so.1"));
        assert!(is_hw_init_failure("Failed to initialise VAAPI connection"));
        assert!(is_hw_init_failure("failed to initialize encoder"));
        assert!(is_hw_init_failure("No device found for qsv"));
        assert!(is_hw_init_failure("driver does not support the required capability"));
        assert!(is_hw_init_failure("Device creation failed: -542398533"));
        assert!(!is_hw_init_failure("Invalid data found when processing input"));
        assert!(!is_hw_init_failure("Conversion failed!"));
    }

    #[test]
    fn stderr_tail_is_bounded() {
        let mut tail = StderrTail::new(3);
        for i in 0..10 {
            tail.push(&format!("line {i}"));
        }
        assert_eq!(tail.joined(), "line 7\nline 8\nline 9");
    }

    #[test]
    fn artifact_validation() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.mp4");
        assert!(matches!(
            validate_artifact(&missing),
            Err(Error::ArtifactValidation(_))
        ));

        let empty = dir.path().join("empty.mp4");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(
            validate_artifact(&empty),
            Err(Error::ArtifactValidation(_))
        ));

        let ok = dir.path().join("ok.mp4");
        std::fs::write(&ok, b"data").unwrap();
        assert!(validate_artifact(&ok).is_ok());
    }

    #[tokio::test]
    async fn run_encode_with_stub_succeeds() {
        // A stub "ffmpeg" that prints progress on stdout and writes the
        // last argument as the output file.
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("ffmpeg-stub.sh");
        std::fs::write(
            &stub,
            "#!/bin/sh\n\
             for last; do :; done\n\
             echo noisy stderr line >&2\n\
             echo out_time_us=30000000\n\
             echo progress=continue\n\
             echo out_time_us=60000000\n\
             echo progress=end\n\
             printf data > \"$last\"\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut params = cpu_params();
        params.output = dir.path().join("out.mp4");

        let cancel = CancellationToken::new();
        let mut events = Vec::new();
        let outcome = run_encode(
            &stub,
            &params,
            &EncodeConfig {
                progress_interval_secs: 0,
                ..Default::default()
            },
            Platform::Linux,
            &cancel,
            &mut |e| events.push(e),
        )
        .await
        .unwrap();

        assert_eq!(outcome.output_bytes, 4);
        assert_eq!(outcome.encoder, "libx264");
        let progress: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                EncodeEvent::Progress { ratio, .. } => Some(*ratio),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![0.5, 1.0]);
        assert!(events.iter().any(|e| matches!(
            e,
            EncodeEvent::Log(line) if line.contains("noisy stderr")
        )));
        // The command line itself is logged before the spawn.
        assert!(matches!(&events[0], EncodeEvent::Log(line) if line.contains("ffmpeg command:")));
    }

    #[tokio::test]
    async fn run_encode_failure_carries_tail() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("ffmpeg-stub.sh");
        std::fs::write(
            &stub,
            "#!/bin/sh\necho Invalid data found when processing input >&2\nexit 1\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut params = cpu_params();
        params.output = dir.path().join("out.mp4");
        let cancel = CancellationToken::new();
        let result = run_encode(
            &stub,
            &params,
            &EncodeConfig::default(),
            Platform::Linux,
            &cancel,
            &mut |_| {},
        )
        .await;

        match result {
            Err(Error::Process { status, tail }) => {
                assert_eq!(status, "exit code 1");
                assert!(tail.contains("Invalid data"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_encode_hw_failure_retries_on_cpu() {
        // The stub fails with an nvenc signature when invoked with the
        // nvenc encoder and succeeds otherwise.
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("ffmpeg-stub.sh");
        std::fs::write(
            &stub,
            "#!/bin/sh\n\
             for last; do :; done\n\
             case \"$*\" in\n\
               *h264_nvenc*) echo 'No NVENC capable devices found' >&2; exit 1;;\n\
             esac\n\
             printf data > \"$last\"\n\
             echo progress=end\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let caps = Capabilities {
            vendor: HwVendor::Nvidia,
            platform: Platform::Linux,
            codecs: Codec::ALL.into_iter().collect(),
        };
        let mut params = cpu_params();
        params.selection =
            encoders::resolve(Codec::H264, Preset::P4, None, &caps, PresetRounding::Faster);
        params.output = dir.path().join("out.mp4");

        let cancel = CancellationToken::new();
        let mut events = Vec::new();
        let outcome = run_encode(
            &stub,
            &params,
            &EncodeConfig::default(),
            Platform::Linux,
            &cancel,
            &mut |e| events.push(e),
        )
        .await
        .unwrap();

        assert_eq!(outcome.encoder, "libx264");
        assert!(events.iter().any(|e| matches!(
            e,
            EncodeEvent::Log(line) if line.contains("retrying with software")
        )));
    }

    #[tokio::test]
    async fn run_encode_cpu_failure_does_not_retry() {
        // A software attempt failing with a hardware-looking message must
        // still be terminal.
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("ffmpeg-stub.sh");
        std::fs::write(
            &stub,
            "#!/bin/sh\necho 'No device found' >&2\nexit 1\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut params = cpu_params();
        params.output = dir.path().join("out.mp4");
        let cancel = CancellationToken::new();
        let result = run_encode(
            &stub,
            &params,
            &EncodeConfig::default(),
            Platform::Linux,
            &cancel,
            &mut |_| {},
        )
        .await;
        assert!(matches!(result, Err(Error::Process { .. })));
    }

    #[tokio::test]
    async fn run_encode_success_without_output_is_artifact_failure() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("ffmpeg-stub.sh");
        std::fs::write(&stub, "#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut params = cpu_params();
        params.output = dir.path().join("out.mp4");
        let cancel = CancellationToken::new();
        let result = run_encode(
            &stub,
            &params,
            &EncodeConfig::default(),
            Platform::Linux,
            &cancel,
            &mut |_| {},
        )
        .await;
        assert!(matches!(result, Err(Error::ArtifactValidation(_))));
    }
}
