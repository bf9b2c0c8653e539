//! # Declarative Pipeline Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML file that tunes every stage of the patch
//! pipeline: mining thresholds, regression acceptance criteria, canary and
//! anomaly thresholds, and version numbering.
//! ```text
//! grade-evolve mine --config evolve.toml --logs overrides.json
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `EvolutionConfig`
//! - Complete: every field has a documented default, so an empty file is valid
//! - Validated: semantic constraints are checked before a config is accepted
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building the pipeline from config (that belongs to `evolve::pipeline`)
//! - Hot-reloading (configs are read once at startup)

pub mod loader;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Default value functions ──────────────────────────────────────────────

fn default_min_frequency() -> usize {
    2
}

fn default_min_confidence() -> f64 {
    0.7
}

fn default_low_extraction_confidence() -> f64 {
    0.5
}

fn default_near_empty_max_chars() -> usize {
    2
}

fn default_max_sample_logs() -> usize {
    5
}

fn default_max_variants() -> usize {
    10
}

fn default_scoring_fix_keywords() -> Vec<String> {
    vec!["fixed deduction".to_string(), "deduction rule".to_string()]
}

fn default_improvement_threshold() -> f64 {
    0.05
}

fn default_max_degradation_rate() -> f64 {
    0.02
}

fn default_score_tolerance() -> f64 {
    0.5
}

fn default_review_confidence_threshold() -> f64 {
    0.7
}

fn default_traffic_percentage() -> f64 {
    0.1
}

fn default_anomaly_threshold() -> f64 {
    0.1
}

fn default_error_rate_threshold() -> f64 {
    0.2
}

fn default_review_margin_multiplier() -> f64 {
    2.0
}

fn default_review_critical_multiplier() -> f64 {
    2.0
}

fn default_promote_after_healthy_checks() -> u32 {
    2
}

/// Five minutes between monitoring passes.
fn default_monitor_interval_secs() -> u64 {
    300
}

fn default_major() -> u32 {
    1
}

fn default_max_allocation_attempts() -> u32 {
    64
}

fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for the patch pipeline.
///
/// Every section is optional in TOML; missing sections take their defaults.
///
/// # Example
///
/// ```toml
/// [miner]
/// min_frequency = 3
///
/// [deployer]
/// anomaly_threshold = 0.05
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EvolutionConfig {
    /// Pattern mining thresholds.
    #[serde(default)]
    pub miner: MinerConfig,
    /// Patch generation settings.
    #[serde(default)]
    pub generator: GeneratorConfig,
    /// Regression acceptance criteria.
    #[serde(default)]
    pub regression: RegressionConfig,
    /// Canary rollout and anomaly thresholds.
    #[serde(default)]
    pub deployer: DeployerConfig,
    /// Version numbering.
    #[serde(default)]
    pub versioning: VersioningConfig,
    /// Logging and metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ── Miner ────────────────────────────────────────────────────────────────

/// Thresholds that decide which override clusters become failure patterns.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MinerConfig {
    /// Minimum number of overrides in a cluster.
    #[serde(default = "default_min_frequency")]
    pub min_frequency: usize,
    /// Minimum cluster homogeneity (0.0–1.0).
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Extraction confidence below which an empty answer counts as an
    /// extraction failure.
    #[serde(default = "default_low_extraction_confidence")]
    pub low_extraction_confidence: f64,
    /// Answers with at most this many non-whitespace characters are "near-empty".
    #[serde(default = "default_near_empty_max_chars")]
    pub near_empty_max_chars: usize,
    /// How many contributing log ids to keep per pattern.
    #[serde(default = "default_max_sample_logs")]
    pub max_sample_logs: usize,
    /// How many distinct answer variants to keep per pattern.
    #[serde(default = "default_max_variants")]
    pub max_variants: usize,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            min_frequency: default_min_frequency(),
            min_confidence: default_min_confidence(),
            low_extraction_confidence: default_low_extraction_confidence(),
            near_empty_max_chars: default_near_empty_max_chars(),
            max_sample_logs: default_max_sample_logs(),
            max_variants: default_max_variants(),
        }
    }
}

// ── Generator ────────────────────────────────────────────────────────────

/// Patch generation settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct GeneratorConfig {
    /// Phrases that mark a scoring pattern as a mechanical deduction error.
    /// Matched case-insensitively against the pattern description.
    #[serde(default = "default_scoring_fix_keywords")]
    pub scoring_fix_keywords: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            scoring_fix_keywords: default_scoring_fix_keywords(),
        }
    }
}

// ── Regression ───────────────────────────────────────────────────────────

/// Acceptance criteria for the offline regression comparison.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RegressionConfig {
    /// Minimum improvement (old − new) required on at least one rate.
    #[serde(default = "default_improvement_threshold")]
    pub improvement_threshold: f64,
    /// Maximum share of samples allowed to get worse.
    #[serde(default = "default_max_degradation_rate")]
    pub max_degradation_rate: f64,
    /// Absolute score difference tolerated before a prediction is wrong.
    #[serde(default = "default_score_tolerance")]
    pub score_tolerance: f64,
    /// Predictions below this confidence are routed to human review.
    #[serde(default = "default_review_confidence_threshold")]
    pub review_confidence_threshold: f64,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            improvement_threshold: default_improvement_threshold(),
            max_degradation_rate: default_max_degradation_rate(),
            score_tolerance: default_score_tolerance(),
            review_confidence_threshold: default_review_confidence_threshold(),
        }
    }
}

// ── Deployer ─────────────────────────────────────────────────────────────

/// Canary rollout and live anomaly thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DeployerConfig {
    /// Traffic share used when the pipeline starts a canary.
    #[serde(default = "default_traffic_percentage")]
    pub default_traffic_percentage: f64,
    /// Allowed increase over baseline for error and miss rates.
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f64,
    /// Absolute error rate that is critical regardless of baseline.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    /// Review-rate increase margin, as a multiple of `anomaly_threshold`.
    #[serde(default = "default_review_margin_multiplier")]
    pub review_margin_multiplier: f64,
    /// A review-rate increase beyond `margin × this` is critical.
    #[serde(default = "default_review_critical_multiplier")]
    pub review_critical_multiplier: f64,
    /// Consecutive healthy checks before the monitor loop promotes a canary.
    #[serde(default = "default_promote_after_healthy_checks")]
    pub promote_after_healthy_checks: u32,
    /// Seconds between monitoring passes.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            default_traffic_percentage: default_traffic_percentage(),
            anomaly_threshold: default_anomaly_threshold(),
            error_rate_threshold: default_error_rate_threshold(),
            review_margin_multiplier: default_review_margin_multiplier(),
            review_critical_multiplier: default_review_critical_multiplier(),
            promote_after_healthy_checks: default_promote_after_healthy_checks(),
            monitor_interval_secs: default_monitor_interval_secs(),
        }
    }
}

// ── Versioning ───────────────────────────────────────────────────────────

/// Version numbering and ledger retry settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct VersioningConfig {
    /// Major component of allocated versions.
    #[serde(default = "default_major")]
    pub major: u32,
    /// Minor component of allocated versions.
    #[serde(default)]
    pub minor: u32,
    /// Compare-and-set attempts before allocation gives up.
    #[serde(default = "default_max_allocation_attempts")]
    pub max_allocation_attempts: u32,
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            major: default_major(),
            minor: 0,
            max_allocation_attempts: default_max_allocation_attempts(),
        }
    }
}

// ── Observability ────────────────────────────────────────────────────────

/// Logging and metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ObservabilityConfig {
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Whether Prometheus counters are registered.
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            metrics_enabled: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable log output.
    #[default]
    Pretty,
    /// Structured JSON log output for log aggregators.
    Json,
}

/// Export the JSON Schema for [`EvolutionConfig`].
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(EvolutionConfig);
    serde_json::to_string_pretty(&schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = EvolutionConfig::default();
        assert_eq!(cfg.miner.min_frequency, 2);
        assert!((cfg.miner.min_confidence - 0.7).abs() < f64::EPSILON);
        assert!((cfg.regression.improvement_threshold - 0.05).abs() < f64::EPSILON);
        assert!((cfg.regression.max_degradation_rate - 0.02).abs() < f64::EPSILON);
        assert!((cfg.deployer.anomaly_threshold - 0.1).abs() < f64::EPSILON);
        assert!((cfg.deployer.error_rate_threshold - 0.2).abs() < f64::EPSILON);
        assert_eq!(cfg.deployer.monitor_interval_secs, 300);
        assert_eq!(cfg.versioning.major, 1);
        assert_eq!(cfg.versioning.minor, 0);
    }

    #[test]
    fn test_default_scoring_keywords() {
        assert_eq!(
            default_scoring_fix_keywords(),
            vec!["fixed deduction", "deduction rule"]
        );
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let cfg: EvolutionConfig = toml::from_str("").expect("test: empty toml");
        assert_eq!(cfg, EvolutionConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let cfg: EvolutionConfig =
            toml::from_str("[deployer]\nanomaly_threshold = 0.05\n").expect("test: parse");
        assert!((cfg.deployer.anomaly_threshold - 0.05).abs() < f64::EPSILON);
        assert!((cfg.deployer.error_rate_threshold - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_log_format_serializes_to_snake_case() {
        let json = serde_json::to_string(&LogFormat::Json).expect("test: serialization");
        assert_eq!(json, "\"json\"");
    }

    #[test]
    fn test_export_schema_produces_valid_json() {
        let schema = export_schema().expect("test: schema export");
        let parsed: serde_json::Value =
            serde_json::from_str(&schema).expect("test: schema is valid JSON");
        assert!(parsed.get("properties").is_some() || parsed.get("$ref").is_some());
    }
}
