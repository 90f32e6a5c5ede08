//! kasumi: watch an image dissolve into noise, one diffusion step at a time.
//!
//! Subcommands:
//!
//! - `frame`: one noised frame at step `t`, with metrics against the clean
//!   image.
//! - `stream`: a full streamed session, one JSON message per line on
//!   stdout. Ctrl-C cancels the run.
//! - `schedule`: the built noise schedule as a table, JSON or SVG chart.
//! - `compare`: similarity metrics between two images of equal size.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin kasumi -- frame photo.png --t 250 -o noisy.png
//! cargo run --release --bin kasumi -- stream photo.png --steps 200 --preview-every 20 --out-dir frames/
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod encoder;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use kasumi_diffusion::{
    DiffusionConfig, DiffusionError, ErrorKind, ImageTensor, ScheduleBuilder, ScheduleKind, compare,
    decode_image, frame_to_image,
};
use kasumi_export::{DEFAULT_QUALITY, FrameFormat, SvgMetadata, schedule_svg};
use kasumi_stream::{
    DataUrlEncoder, SessionOutcome, StreamConfig, StreamError, StreamMessage, StreamOrchestrator,
};

use crate::encoder::{CliEncoder, FileEncoder};

/// Visualize the forward noising process of a diffusion model.
#[derive(Parser)]
#[command(name = "kasumi", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Render one noised frame.
    Frame(FrameArgs),
    /// Stream every step of a run as JSON lines.
    Stream(StreamArgs),
    /// Print the noise schedule.
    Schedule(ScheduleArgs),
    /// Compare two images of equal size.
    Compare(CompareArgs),
}

/// Schedule and seed flags shared by the subcommands.
#[derive(Args)]
struct DiffusionArgs {
    /// Number of diffusion steps.
    #[arg(long, default_value_t = DiffusionConfig::DEFAULT_STEPS)]
    steps: usize,

    /// Noise schedule.
    #[arg(long, value_enum, default_value_t = Kind::Linear)]
    schedule: Kind,

    /// First beta of the linear schedule.
    #[arg(long, default_value_t = DiffusionConfig::DEFAULT_BETA_START)]
    beta_start: f64,

    /// Last beta of the linear schedule.
    #[arg(long, default_value_t = DiffusionConfig::DEFAULT_BETA_END)]
    beta_end: f64,

    /// Offset of the cosine schedule.
    #[arg(long, default_value_t = DiffusionConfig::DEFAULT_COSINE_SHIFT)]
    cosine_shift: f64,

    /// Base seed. Drawn from system entropy when omitted.
    #[arg(long)]
    seed: Option<u64>,

    /// Upper bound on --steps.
    #[arg(long, default_value_t = ScheduleBuilder::DEFAULT_MAX_STEPS)]
    max_steps: usize,

    /// Full diffusion config as a JSON string.
    ///
    /// When provided, the other schedule flags are ignored. The JSON must
    /// be a valid `DiffusionConfig` serialization (camelCase keys).
    #[arg(long)]
    config_json: Option<String>,
}

/// Noise schedule selection.
#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    /// Linearly spaced betas.
    Linear,
    /// Cosine cumulative-retention curve.
    Cosine,
}

#[derive(Args)]
struct FrameArgs {
    /// Input image (PNG, JPEG, BMP, WebP).
    image: PathBuf,

    /// Step index, 0-based.
    #[arg(long, allow_negative_numbers = true)]
    t: i64,

    /// Walk the chain step by step instead of sampling in closed form.
    #[arg(long)]
    iterative: bool,

    /// Write the frame here; the extension picks the format.
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Cap the longest image side before diffusing.
    #[arg(long)]
    max_side: Option<u32>,

    #[command(flatten)]
    diffusion: DiffusionArgs,
}

#[derive(Args)]
struct StreamArgs {
    /// Input image (PNG, JPEG, BMP, WebP).
    image: PathBuf,

    /// Emit every N-th step (the last step is always emitted).
    #[arg(long, default_value_t = 1)]
    preview_every: usize,

    /// Attach similarity metrics to each emitted frame.
    #[arg(long)]
    metrics: bool,

    /// JPEG quality (1-100).
    #[arg(long, default_value_t = DEFAULT_QUALITY)]
    quality: u8,

    /// Frame format.
    #[arg(long, value_enum, default_value_t = Format::Jpeg)]
    format: Format,

    /// Write frames into this directory instead of inlining data URLs.
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Cap the longest image side before diffusing.
    #[arg(long, default_value_t = StreamConfig::DEFAULT_MAX_SIDE)]
    max_side: u32,

    #[command(flatten)]
    diffusion: DiffusionArgs,
}

/// Frame format selection.
#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Jpeg,
    Png,
}

#[derive(Args)]
struct ScheduleArgs {
    /// Print the schedule arrays as JSON.
    #[arg(long)]
    json: bool,

    /// Write an SVG chart of beta and alpha_bar.
    #[arg(long)]
    svg: Option<PathBuf>,

    #[command(flatten)]
    diffusion: DiffusionArgs,
}

#[derive(Args)]
struct CompareArgs {
    /// First image.
    a: PathBuf,
    /// Second image, same size and channel count.
    b: PathBuf,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("error reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("error writing {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("error parsing --config-json: {0}")]
    ConfigJson(serde_json::Error),

    #[error(transparent)]
    Diffusion(#[from] DiffusionError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("error saving image: {0}")]
    Image(#[from] image::ImageError),

    #[error("error serializing output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to start async runtime: {0}")]
    Runtime(std::io::Error),
}

impl CliError {
    /// Classify this error. Unreadable input paths count as bad input.
    const fn kind(&self) -> ErrorKind {
        match self {
            Self::Diffusion(err) => err.kind(),
            Self::Stream(err) => err.kind(),
            Self::Read { .. } | Self::ConfigJson(_) => ErrorKind::Validation,
            Self::Write { .. } | Self::Image(_) | Self::Json(_) | Self::Runtime(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Process exit status: 2 for bad input, 1 for everything else.
    const fn exit_status(&self) -> u8 {
        match self.kind() {
            ErrorKind::Validation => 2,
            ErrorKind::Numerical | ErrorKind::Internal => 1,
        }
    }
}

impl DiffusionArgs {
    /// Build a [`DiffusionConfig`] from the flags, or from `--config-json`.
    fn config(&self) -> Result<DiffusionConfig, CliError> {
        if let Some(ref json) = self.config_json {
            return serde_json::from_str(json).map_err(CliError::ConfigJson);
        }
        Ok(DiffusionConfig {
            steps: self.steps,
            schedule: match self.schedule {
                Kind::Linear => ScheduleKind::Linear,
                Kind::Cosine => ScheduleKind::Cosine,
            },
            beta_start: self.beta_start,
            beta_end: self.beta_end,
            cosine_shift: self.cosine_shift,
            seed: self.seed,
        })
    }

    const fn builder(&self) -> ScheduleBuilder {
        ScheduleBuilder::new(self.max_steps)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Frame(args) => run_frame(&args),
        Command::Stream(args) => run_stream(&args),
        Command::Schedule(args) => run_schedule(&args),
        Command::Compare(args) => run_compare(&args),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!(kind = ?e.kind(), "command failed");
            eprintln!("{e}");
            ExitCode::from(e.exit_status())
        }
    }
}

fn read(path: &Path) -> Result<Vec<u8>, CliError> {
    std::fs::read(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn run_frame(args: &FrameArgs) -> Result<ExitCode, CliError> {
    let config = args.diffusion.config()?;
    let bytes = read(&args.image)?;
    let process =
        kasumi_diffusion::prepare(&bytes, &config, &args.diffusion.builder(), args.max_side)?;

    let t = process.check_step(args.t)?;
    let frame = if args.iterative {
        process.frame_u8_iterative(t)?
    } else {
        process.frame_u8(t)?
    };

    let metrics = compare(&frame, &process.x0().quantize())?;
    if let Some(ref failure) = metrics.error {
        tracing::warn!(kind = ?failure.kind, detail = %failure.detail, "metric undefined");
    }
    let summary = serde_json::json!({
        "t": t,
        "beta": process.schedule().beta()[t],
        "alphaBar": process.schedule().alpha_bar()[t],
        "seed": process.base_seed(),
        "iterative": args.iterative,
        "metrics": metrics,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Some(ref out) = args.out {
        frame_to_image(&frame)?.save(out)?;
        eprintln!("Frame written to {}", out.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn run_stream(args: &StreamArgs) -> Result<ExitCode, CliError> {
    let diffusion = args.diffusion.config()?;
    let bytes = read(&args.image)?;
    let config = StreamConfig {
        preview_every: args.preview_every,
        include_metrics: args.metrics,
        quality: args.quality,
        max_side: Some(args.max_side),
    };
    let process = kasumi_diffusion::prepare(
        &bytes,
        &diffusion,
        &args.diffusion.builder(),
        config.max_side,
    )?;

    let format = match args.format {
        Format::Jpeg => FrameFormat::Jpeg,
        Format::Png => FrameFormat::Png,
    };
    let encoder = match args.out_dir {
        Some(ref dir) => {
            std::fs::create_dir_all(dir).map_err(|source| CliError::Write {
                path: dir.clone(),
                source,
            })?;
            CliEncoder::Files(FileEncoder::new(dir.clone(), format))
        }
        None => CliEncoder::DataUrl(DataUrlEncoder::new(format)),
    };
    tracing::info!(%format, out_dir = ?args.out_dir, "frame encoding");
    let mut orchestrator =
        StreamOrchestrator::new(encoder).with_builder(args.diffusion.builder());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    let report = runtime.block_on(async {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<String>(4);
        let (out_tx, mut out_rx) = mpsc::channel::<StreamMessage>(16);

        // Holds the only command sender, so the channel stays open.
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, canceling");
                let _ = cmd_tx.send(r#"{"action":"cancel"}"#.to_owned()).await;
            }
        });

        let session = async move {
            let report = orchestrator
                .run(&process, &config, &mut cmd_rx, &out_tx)
                .await;
            drop(out_tx);
            report
        };
        let printer = async {
            while let Some(message) = out_rx.recv().await {
                match message.to_json() {
                    Ok(line) => println!("{line}"),
                    Err(err) => tracing::error!(%err, "dropping unserializable message"),
                }
            }
        };

        let (report, ()) = tokio::join!(session, printer);
        report
    });

    eprintln!(
        "Session {:?}: {} frames over {} steps in {:.2?}",
        report.outcome, report.frames_emitted, report.steps_processed, report.elapsed,
    );
    Ok(match report.outcome {
        SessionOutcome::Completed | SessionOutcome::Canceled => ExitCode::SUCCESS,
        SessionOutcome::Errored(_) | SessionOutcome::Disconnected => ExitCode::FAILURE,
    })
}

fn run_schedule(args: &ScheduleArgs) -> Result<ExitCode, CliError> {
    let config = args.diffusion.config()?;
    let schedule = args.diffusion.builder().from_config(&config)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&schedule)?);
    } else {
        println!("{:>6}  {:>12}  {:>12}  {:>12}", "t", "beta", "alpha_bar", "sqrt(1-ab)");
        for t in 0..schedule.steps() {
            println!(
                "{t:>6}  {:>12.6e}  {:>12.6}  {:>12.6}",
                schedule.beta()[t],
                schedule.alpha_bar()[t],
                schedule.sqrt_one_minus_alpha_bar()[t],
            );
        }
    }

    if let Some(ref path) = args.svg {
        let title = format!("{} schedule, {} steps", schedule.kind(), schedule.steps());
        let desc = serde_json::to_string(&config)?;
        let metadata = SvgMetadata {
            title: Some(&title),
            description: Some(&desc),
        };
        let svg = schedule_svg(&schedule, &metadata);
        std::fs::write(path, &svg).map_err(|source| CliError::Write {
            path: path.clone(),
            source,
        })?;
        eprintln!("SVG written to {} ({} bytes)", path.display(), svg.len());
    }
    Ok(ExitCode::SUCCESS)
}

fn run_compare(args: &CompareArgs) -> Result<ExitCode, CliError> {
    let a = ImageTensor::from_image(&decode_image(&read(&args.a)?)?)?.quantize();
    let b = ImageTensor::from_image(&decode_image(&read(&args.b)?)?)?.quantize();
    let metrics = compare(&a, &b)?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_build_config() {
        let cli = Cli::try_parse_from([
            "kasumi", "schedule", "--steps", "50", "--schedule", "cosine", "--seed", "7",
        ])
        .unwrap();
        let Command::Schedule(args) = cli.command else {
            unreachable!("parsed a different subcommand");
        };
        let config = args.diffusion.config().unwrap();
        assert_eq!(config.steps, 50);
        assert_eq!(config.schedule, ScheduleKind::Cosine);
        assert_eq!(config.seed, Some(7));
    }

    #[test]
    fn config_json_overrides_flags() {
        let cli = Cli::try_parse_from([
            "kasumi",
            "schedule",
            "--steps",
            "50",
            "--config-json",
            r#"{"steps": 20, "betaEnd": 0.05}"#,
        ])
        .unwrap();
        let Command::Schedule(args) = cli.command else {
            unreachable!("parsed a different subcommand");
        };
        let config = args.diffusion.config().unwrap();
        assert_eq!(config.steps, 20);
        assert!((config.beta_end - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn bad_config_json_is_reported() {
        let cli =
            Cli::try_parse_from(["kasumi", "schedule", "--config-json", "{steps"]).unwrap();
        let Command::Schedule(args) = cli.command else {
            unreachable!("parsed a different subcommand");
        };
        assert!(matches!(args.diffusion.config(), Err(CliError::ConfigJson(_))));
    }

    #[test]
    fn frame_accepts_negative_step_for_validation() {
        let cli = Cli::try_parse_from(["kasumi", "frame", "in.png", "--t", "-3"]).unwrap();
        let Command::Frame(args) = cli.command else {
            unreachable!("parsed a different subcommand");
        };
        assert_eq!(args.t, -3);
    }

    #[test]
    fn stream_defaults() {
        let cli = Cli::try_parse_from(["kasumi", "stream", "in.png"]).unwrap();
        let Command::Stream(args) = cli.command else {
            unreachable!("parsed a different subcommand");
        };
        assert_eq!(args.preview_every, 1);
        assert_eq!(args.quality, 90);
        assert_eq!(args.max_side, 512);
        assert!(!args.metrics);
    }

    #[test]
    fn validation_errors_exit_with_two() {
        let bad_step = CliError::Diffusion(DiffusionError::StepOutOfRange { t: 10, steps: 10 });
        assert_eq!(bad_step.kind(), ErrorKind::Validation);
        assert_eq!(bad_step.exit_status(), 2);

        let missing = CliError::Read {
            path: PathBuf::from("missing.png"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(missing.exit_status(), 2);

        let stream = CliError::Stream(StreamError::NoFrames);
        assert_eq!(stream.kind(), ErrorKind::Internal);
        assert_eq!(stream.exit_status(), 1);
    }
}
