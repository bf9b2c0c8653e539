//! # grade-evolve
//!
//! Turns teacher overrides of automated grading decisions into safe,
//! versioned rule patches.
//!
//! ## Architecture
//!
//! ```text
//! OverrideLog[] ─► PatternMiner ─► FailurePattern[] ─► PatchGenerator ─► RulePatch
//!                                                          │ allocate
//!                                                          ▼
//!                                                    VersionManager ◄─── rollback ──┐
//!                                                                                   │
//! RulePatch ─► RegressionTester (old vs new on EvalSet) ─► PatchDeployer ───────────┘
//!                                                  CANARY → monitor → PROMOTED | ROLLED_BACK
//! ```
//!
//! Mining and regression are advisory and fail soft. Deployment and version
//! mutations fail hard.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use grade_evolve::config::EvolutionConfig;
//! use grade_evolve::evolve::{EvolutionPipeline, InMemoryLedger, MetricsSource};
//!
//! # fn source() -> Arc<dyn MetricsSource> { unimplemented!() }
//! let pipeline = EvolutionPipeline::new(
//!     EvolutionConfig::default(),
//!     Arc::new(InMemoryLedger::new()),
//!     source(),
//! );
//! # let _ = pipeline;
//! ```

// ── Lint policy ────────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod evolve;
pub mod metrics;

pub use config::validation::ConfigError;
pub use config::{EvolutionConfig, LogFormat};
pub use evolve::{
    DeployError, EvolutionPipeline, FailurePattern, GeneratorError, OverrideLog, PatchDeployer,
    PatchGenerator, PatternMiner, RegressionTester, RulePatch, VersionError, VersionManager,
};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`PipelineError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Example
///
/// ```no_run
/// # use grade_evolve::{init_tracing, PipelineError};
/// # fn example() -> Result<(), PipelineError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), PipelineError> {
    let format = match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    };
    init_tracing_with(format)
}

/// Initialise the global tracing subscriber with an explicit format.
///
/// Logs go to stderr so that stdout stays free for command output.
///
/// # Errors
///
/// Same as [`init_tracing`].
pub fn init_tracing_with(format: LogFormat) -> Result<(), PipelineError> {
    let result = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init(),
    };

    result.map_err(|e| PipelineError::Other(format!("tracing init failed: {e}")))
}

/// Top-level pipeline errors.
///
/// Every component error converts into this type with `?`.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A version ledger operation failed.
    #[error("version error: {0}")]
    Version(#[from] VersionError),

    /// Patch generation failed.
    #[error("generator error: {0}")]
    Generator(#[from] GeneratorError),

    /// A deployment operation failed.
    #[error("deploy error: {0}")]
    Deploy(#[from] DeployError),

    /// Input data could not be read or decoded.
    #[error("input error: {0}")]
    Input(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}
