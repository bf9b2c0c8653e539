//! `grade-evolve` command-line tool.
//!
//! ```text
//! grade-evolve mine    --logs overrides.json [--since T] [--until T]
//! grade-evolve regress --eval regression.json
//! grade-evolve schema
//! ```
//!
//! Every subcommand accepts `--config evolve.toml`. Results are printed to
//! stdout as JSON; logs go to stderr.
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON logs (overrides the config file)
//! - `RUST_LOG=info`: log level filter

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::info;

use grade_evolve::config::{export_schema, loader};
use grade_evolve::evolve::{
    EvalSet, FailurePattern, MiningSummary, OverrideLog, PatternMiner, Prediction, RegressionTester,
};
use grade_evolve::{init_tracing, init_tracing_with, metrics, EvolutionConfig, LogFormat, PipelineError};

#[derive(Parser, Debug)]
#[command(
    name = "grade-evolve",
    version,
    about = "Mine grading overrides and regression-test rule patches"
)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Cluster override logs into failure patterns.
    Mine(MineArgs),
    /// Compare old and new predictions on an evaluation set.
    Regress(RegressArgs),
    /// Print the configuration JSON schema.
    Schema,
}

#[derive(Args, Debug, Clone)]
struct MineArgs {
    /// JSON array of override logs.
    #[arg(long)]
    logs: PathBuf,

    /// Only mine logs created at or after this RFC 3339 time.
    #[arg(long)]
    since: Option<DateTime<Utc>>,

    /// Only mine logs created before this RFC 3339 time.
    #[arg(long)]
    until: Option<DateTime<Utc>>,
}

#[derive(Args, Debug, Clone)]
struct RegressArgs {
    /// JSON file with the evaluation set and both prediction sets.
    #[arg(long)]
    eval: PathBuf,
}

#[derive(Debug, Deserialize)]
struct RegressionInput {
    patch_id: String,
    eval_set: EvalSet,
    old_predictions: Vec<Prediction>,
    new_predictions: Vec<Prediction>,
}

#[derive(Debug, Serialize)]
struct MineOutput {
    summary: MiningSummary,
    patterns: Vec<FailurePattern>,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, PipelineError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::Input(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&raw).map_err(|e| PipelineError::Input(format!("{}: {e}", path.display())))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), PipelineError> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| PipelineError::Other(format!("encoding output failed: {e}")))?;
    println!("{out}");
    Ok(())
}

fn mine(config: &EvolutionConfig, args: &MineArgs) -> Result<ExitCode, PipelineError> {
    let logs: Vec<OverrideLog> = read_json(&args.logs)?;
    let miner = PatternMiner::new(config.miner.clone())
        .with_scoring_keywords(config.generator.scoring_fix_keywords.clone());

    let patterns = match (args.since, args.until) {
        (None, None) => miner.analyze_overrides(&logs),
        (since, until) => miner.analyze_window(
            &logs,
            since.unwrap_or(DateTime::<Utc>::MIN_UTC),
            until.unwrap_or(DateTime::<Utc>::MAX_UTC),
        ),
    };
    let summary = miner.generate_summary(&logs, &patterns);
    print_json(&MineOutput { summary, patterns })?;
    Ok(ExitCode::SUCCESS)
}

fn regress(config: &EvolutionConfig, args: &RegressArgs) -> Result<ExitCode, PipelineError> {
    let input: RegressionInput = read_json(&args.eval)?;
    let tester = RegressionTester::new(config.regression.clone());
    let result = tester.compare(
        &input.patch_id,
        &input.eval_set,
        &input.old_predictions,
        &input.new_predictions,
    );
    metrics::inc_regression_run(result.passed);
    print_json(&result)?;
    Ok(if result.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

/// LOG_FORMAT wins over the config file. Startup continues without logs if
/// a subscriber cannot be installed.
fn install_tracing(configured: LogFormat) {
    let installed = if std::env::var_os("LOG_FORMAT").is_some() {
        init_tracing()
    } else {
        init_tracing_with(configured)
    };
    if let Err(e) = installed {
        eprintln!("warning: logging disabled: {e}");
    }
}

fn run(cli: Cli) -> Result<ExitCode, PipelineError> {
    let config = match &cli.config {
        Some(path) => loader::load_from_file(path)?,
        None => EvolutionConfig::default(),
    };

    install_tracing(config.observability.log_format);
    if config.observability.metrics_enabled {
        metrics::init_metrics()?;
    }

    info!(command = ?cli.command, "grade-evolve starting");
    match &cli.command {
        Commands::Mine(args) => mine(&config, args),
        Commands::Regress(args) => regress(&config, args),
        Commands::Schema => {
            let schema = export_schema()
                .map_err(|e| PipelineError::Other(format!("schema export failed: {e}")))?;
            println!("{schema}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
