//! # bf-av
//!
//! Everything that touches external tools for the bytefit pipeline.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to ffmpeg,
//!   ffprobe, nvidia-smi, and vainfo.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout and
//!   cancellation support, including line-streamed execution.
//! - **Media probing** ([`probe::probe_media`]) -- ffprobe-backed extraction
//!   of duration, audio bitrate, and container.
//! - **Hardware detection** ([`hw::detect`]) -- best-effort, run-once encoder
//!   capability discovery.
//! - **Encoder mapping** ([`encoders::resolve`]) -- pure codec/preset
//!   resolution against detected capabilities.
//! - **Bitrate planning** ([`bitrate::compute`]) -- target-size bitrate math.
//! - **Encoding** ([`encode::run_encode`]) -- the supervised ffmpeg process
//!   with structured progress parsing.

pub mod bitrate;
pub mod command;
pub mod encode;
pub mod encoders;
pub mod hw;
pub mod probe;
pub mod tools;

// ---- Re-exports for convenience ----

pub use bitrate::BitratePlan;
pub use command::{StreamLine, ToolCommand, ToolOutput};
pub use encoders::EncoderSelection;
pub use hw::{Capabilities, Codec, HwVendor, Platform};
pub use probe::MediaProbe;
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
