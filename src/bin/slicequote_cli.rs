//! SliceQuote CLI - Bridge interface for the web tier
//!
//! Commands: translate, slice, parse, duration, quote, printability
//! Outputs JSON to stdout, logs to stderr
//! Exit 1 on bad input or config, 2 on pipeline failure

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use slicequote_core::{
    check_printability, duration_to_seconds, metrics::parse_metrics_file, read_stl_bounds,
    BaselineTemplate, CleanupPolicy, PipelineConfig, PrinterProfile, ProcessEngine,
    ProfileTranslator, QuoteParameters, QuotePipeline, QuoteRequest,
};

#[derive(Parser)]
#[command(name = "slicequote-cli")]
#[command(about = "SliceQuote CLI - slice 3D models and price the result")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Pipeline config file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the engine config for a profile
    Translate {
        /// JSON payload (PrinterProfile)
        #[arg(short, long)]
        profile: Option<String>,

        /// Write the config here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Slice a model and keep the artifacts
    Slice {
        #[arg(short, long)]
        model: PathBuf,

        /// JSON payload (PrinterProfile)
        #[arg(short, long)]
        profile: Option<String>,

        #[arg(short, long, default_value = "cli")]
        identity: String,
    },

    /// Read print metrics from an engine output file
    Parse { output: PathBuf },

    /// Convert an estimated time such as "1d 2h 3m 4s" to seconds
    Duration { value: String },

    /// Slice and price a model
    Quote {
        #[arg(short, long)]
        model: PathBuf,

        /// JSON payload (PrinterProfile)
        #[arg(short, long)]
        profile: Option<String>,

        /// JSON payload (QuoteParameters)
        #[arg(long)]
        params: Option<String>,

        #[arg(short, long, default_value = "cli")]
        identity: String,

        /// Keep the working directory
        #[arg(long)]
        keep: bool,
    },

    /// Check a model against the printer build volume
    Printability {
        #[arg(short, long)]
        model: PathBuf,

        /// JSON payload (PrinterProfile)
        #[arg(short, long)]
        profile: Option<String>,
    },
}

struct Failure {
    code: u8,
    message: String,
}

impl Failure {
    fn input(message: impl ToString) -> Self {
        Self { code: 1, message: message.to_string() }
    }

    fn pipeline(message: impl ToString) -> Self {
        Self { code: 2, message: message.to_string() }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            let output = serde_json::json!({
                "success": false,
                "error": failure.message,
            });
            println!("{output}");
            ExitCode::from(failure.code)
        }
    }
}

fn run(cli: Cli) -> Result<(), Failure> {
    match cli.command {
        Commands::Duration { value } => emit(&serde_json::json!({
            "duration": value,
            "seconds": duration_to_seconds(&value),
        })),

        Commands::Parse { output } => {
            let report = parse_metrics_file(&output)
                .map_err(|e| Failure::input(format!("{}: {e}", output.display())))?;
            emit(&report)
        }

        Commands::Printability { model, profile } => {
            let profile = profile_arg(profile.as_deref())?;
            let bytes = read_model(&model)?;
            let bounds = read_stl_bounds(&bytes).map_err(Failure::input)?;
            emit(&check_printability(&bounds, &profile))
        }

        Commands::Translate { profile, output } => {
            let config = load_config(cli.config.as_deref())?;
            let profile = profile_arg(profile.as_deref())?;
            let baseline =
                BaselineTemplate::load(&config.baseline_template).map_err(Failure::input)?;
            let engine_config = ProfileTranslator::new(baseline).translate(&profile);
            match output {
                Some(path) => {
                    engine_config.persist(&path).map_err(Failure::pipeline)?;
                    emit(&serde_json::json!({
                        "success": true,
                        "path": path,
                        "config_hash": engine_config.content_hash(),
                    }))
                }
                None => {
                    print!("{}", engine_config.to_ini());
                    Ok(())
                }
            }
        }

        Commands::Slice { model, profile, identity } => {
            let pipeline = load_pipeline(cli.config.as_deref())?;
            let request = QuoteRequest::new(identity, model_filename(&model)?, read_model(&model)?)
                .with_profile(profile_arg(profile.as_deref())?);

            let (_dir, artifacts) = match pipeline.slice(&request, &pipeline.run_control()) {
                Ok(sliced) => sliced,
                Err(e) if e.is_client_error() => return Err(Failure::input(e)),
                Err(e) => return Err(Failure::pipeline(e)),
            };
            emit(&serde_json::json!({
                "success": true,
                "artifacts": artifacts,
            }))
        }

        Commands::Quote { model, profile, params, identity, keep } => {
            let pipeline = load_pipeline(cli.config.as_deref())?;
            let filename = model_filename(&model)?;
            let mut request = QuoteRequest::new(identity, filename, read_model(&model)?)
                .with_profile(profile_arg(profile.as_deref())?);
            if let Some(raw) = params {
                let params: QuoteParameters = serde_json::from_str(&raw)
                    .map_err(|e| Failure::input(format!("Invalid params: {e}")))?;
                request = request.with_params(params);
            }
            if keep {
                request = request.with_cleanup(CleanupPolicy::Keep);
            }

            match pipeline.quote(&request) {
                Ok(outcome) => emit(&serde_json::json!({
                    "success": true,
                    "outcome": outcome,
                })),
                Err(e) if e.is_client_error() => Err(Failure::input(e)),
                Err(e) => Err(Failure::pipeline(e)),
            }
        }
    }
}

fn emit<T: Serialize>(value: &T) -> Result<(), Failure> {
    let json = serde_json::to_string_pretty(value).map_err(Failure::pipeline)?;
    println!("{json}");
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig, Failure> {
    let config = match path {
        Some(path) => PipelineConfig::load(path).map_err(Failure::input)?,
        None => PipelineConfig::default(),
    };
    config.apply_env().map_err(Failure::input)
}

fn load_pipeline(path: Option<&Path>) -> Result<QuotePipeline<ProcessEngine>, Failure> {
    let config = load_config(path)?;
    QuotePipeline::from_config(config).map_err(Failure::input)
}

fn profile_arg(raw: Option<&str>) -> Result<PrinterProfile, Failure> {
    match raw {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| Failure::input(format!("Invalid profile: {e}"))),
        None => Ok(PrinterProfile::default()),
    }
}

fn read_model(path: &Path) -> Result<Vec<u8>, Failure> {
    fs::read(path).map_err(|e| Failure::input(format!("{}: {e}", path.display())))
}

fn model_filename(path: &Path) -> Result<String, Failure> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Failure::input(format!("Not a file: {}", path.display())))
}
