use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bytefit")]
#[command(author, version, about = "Target-size video compression tool")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that required external tools are available
    Tools,

    /// Detect hardware encoder capabilities
    Detect {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compress a file to a target size and stream progress
    Compress(CompressArgs),

    /// Display version information
    Version,
}

#[derive(Args)]
pub struct CompressArgs {
    /// Input file to compress
    #[arg(required = true)]
    pub input: PathBuf,

    /// Target output size in MiB
    #[arg(short, long, default_value = "8.0")]
    pub size: f64,

    /// Video codec: h264, hevc, or av1
    #[arg(long, default_value = "h264")]
    pub codec: String,

    /// Speed/quality preset, p1 (fastest) to p7 (slowest)
    #[arg(long, default_value = "p4")]
    pub preset: String,

    /// Audio codec passed to ffmpeg
    #[arg(long, default_value = "aac")]
    pub audio_codec: String,

    /// Audio bitrate in kbps
    #[arg(long, default_value = "128")]
    pub audio_bitrate: f64,

    /// Encoder tune (NVENC only)
    #[arg(long)]
    pub tune: Option<String>,

    /// Limit output width (downscale only, aspect ratio preserved)
    #[arg(long)]
    pub max_width: Option<u32>,

    /// Limit output height (downscale only, aspect ratio preserved)
    #[arg(long)]
    pub max_height: Option<u32>,

    /// Encode from this point (seconds or HH:MM:SS)
    #[arg(long)]
    pub start: Option<String>,

    /// Encode up to this point (seconds or HH:MM:SS)
    #[arg(long)]
    pub end: Option<String>,
}
