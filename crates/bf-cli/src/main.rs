mod cli;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use bf_av::encoders::Preset;
use bf_av::hw::{self, Codec, Platform};
use bf_av::tools::ToolRegistry;
use bf_core::config::Config;
use bf_core::events::EventPayload;
use bf_pipeline::{CompressionService, EncodeRequest, JobState};
use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick defaults from the verbose flag.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "bf_cli=trace,bf_core=trace,bf_av=trace,bf_pipeline=trace".to_string()
        } else {
            "bf_cli=info,bf_core=info,bf_av=info,bf_pipeline=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    let config = Config::load_or_default(cli.config.as_deref());
    for warning in config.validate() {
        tracing::warn!("config: {warning}");
    }

    match cli.command {
        Commands::Tools => check_tools(&config),
        Commands::Detect { json } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(detect(&config, json))
        }
        Commands::Compress(args) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(compress(config, args))
        }
        Commands::Version => {
            println!("bytefit {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn check_tools(config: &Config) -> Result<()> {
    let registry = ToolRegistry::discover(&config.tools);
    let mut missing_required = false;

    println!("External tools:");
    for info in registry.check_all() {
        let status = if info.available { "OK " } else { "MISSING" };
        let detail = match (&info.path, &info.version) {
            (Some(path), Some(version)) => format!("{} ({version})", path.display()),
            (Some(path), None) => path.display().to_string(),
            _ => String::new(),
        };
        println!("  [{status}] {:<12} {detail}", info.name);
        if !info.available && matches!(info.name.as_str(), "ffmpeg" | "ffprobe") {
            missing_required = true;
        }
    }

    if missing_required {
        anyhow::bail!("ffmpeg and ffprobe are required");
    }
    Ok(())
}

async fn detect(config: &Config, json: bool) -> Result<()> {
    let registry = ToolRegistry::discover(&config.tools);
    let caps = hw::detect(&registry, Platform::current()).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&caps)?);
    } else {
        println!("Vendor: {}", caps.vendor.as_str());
        print!("Codecs:");
        for codec in &caps.codecs {
            print!(" {}", codec.prefix());
        }
        println!();
    }
    Ok(())
}

async fn compress(config: Config, args: cli::CompressArgs) -> Result<()> {
    if !args.input.exists() {
        anyhow::bail!("input file does not exist: {}", args.input.display());
    }
    if args.size <= 0.0 {
        anyhow::bail!("target size must be positive");
    }

    let codec = parse_codec(&args.codec)?;
    let preset = parse_preset(&args.preset)?;
    let target_size_bytes = (args.size * 1024.0 * 1024.0) as u64;

    let registry = ToolRegistry::discover(&config.tools);
    registry.require("ffmpeg")?;
    registry.require("ffprobe")?;
    let caps = Arc::new(hw::detect(&registry, Platform::current()).await);
    println!("Hardware: {} encoding", caps.vendor.as_str());

    let service = CompressionService::new(config, registry, caps);
    let id = service.submit(EncodeRequest {
        source: args.input.clone(),
        target_size_bytes,
        codec,
        audio_codec: args.audio_codec,
        audio_bitrate_kbps: args.audio_bitrate,
        preset,
        tune: args.tune,
        max_width: args.max_width,
        max_height: args.max_height,
        start_time: args.start,
        end_time: args.end,
    })?;
    let mut sub = service.subscribe(id)?;

    while let Some(event) = sub.next().await {
        match event.payload {
            EventPayload::Status { state, reason } => match reason {
                Some(reason) => println!("[{}] {reason}", state.as_str()),
                None => println!("[{}]", state.as_str()),
            },
            EventPayload::Progress { ratio, fps, speed } => {
                let mut line = format!("progress {:>5.1}%", ratio * 100.0);
                if let Some(fps) = fps {
                    line.push_str(&format!("  fps {fps:.0}"));
                }
                if let Some(speed) = speed {
                    line.push_str(&format!("  speed {speed}"));
                }
                println!("{line}");
            }
            EventPayload::Log { line } => tracing::debug!("{line}"),
            EventPayload::Result {
                output,
                output_bytes,
            } => {
                println!(
                    "done: {output} ({:.2} MiB)",
                    output_bytes as f64 / 1024.0 / 1024.0
                );
            }
        }
    }

    let job = service.get_job(id)?;
    if job.state == JobState::Failed {
        anyhow::bail!(
            "compression failed: {}",
            job.failure_reason.unwrap_or_else(|| "unknown".into())
        );
    }
    Ok(())
}

fn parse_codec(s: &str) -> Result<Codec> {
    match s.to_lowercase().as_str() {
        "h264" | "avc" => Ok(Codec::H264),
        "hevc" | "h265" => Ok(Codec::Hevc),
        "av1" => Ok(Codec::Av1),
        other => anyhow::bail!("unknown codec '{other}' (expected h264, hevc, or av1)"),
    }
}

fn parse_preset(s: &str) -> Result<Preset> {
    Preset::from_str(&s.to_lowercase())
        .map_err(|_| anyhow::anyhow!("unknown preset '{s}' (expected p1..p7)"))
}
