//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`EvolutionConfig`] that serde
//! cannot express (range checks, cross-field invariants).
//!
//! ## Guarantees
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML or file I/O (that belongs to `loader`)

use super::EvolutionConfig;

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "deployer.anomaly_threshold").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn check_unit_range(errors: &mut Vec<ConfigError>, field: &str, value: f64) {
    if !(0.0..=1.0).contains(&value) {
        errors.push(ConfigError::InvalidField {
            field: field.into(),
            value: value.to_string(),
            reason: "must be between 0.0 and 1.0".into(),
        });
    }
}

fn check_positive(errors: &mut Vec<ConfigError>, field: &str, value: f64) {
    if !(value.is_finite() && value > 0.0) {
        errors.push(ConfigError::InvalidField {
            field: field.into(),
            value: value.to_string(),
            reason: "must be a positive number".into(),
        });
    }
}

/// Validate all semantic constraints on an [`EvolutionConfig`].
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
pub fn validate(config: &EvolutionConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Miner ────────────────────────────────────────────────────────
    if config.miner.min_frequency == 0 {
        errors.push(ConfigError::InvalidField {
            field: "miner.min_frequency".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }
    check_unit_range(&mut errors, "miner.min_confidence", config.miner.min_confidence);
    check_unit_range(
        &mut errors,
        "miner.low_extraction_confidence",
        config.miner.low_extraction_confidence,
    );
    if config.miner.max_sample_logs == 0 {
        errors.push(ConfigError::InvalidField {
            field: "miner.max_sample_logs".into(),
            value: "0".into(),
            reason: "must keep at least one sample for traceability".into(),
        });
    }

    // ── Generator ────────────────────────────────────────────────────
    if config
        .generator
        .scoring_fix_keywords
        .iter()
        .any(|k| k.trim().is_empty())
    {
        errors.push(ConfigError::InvalidField {
            field: "generator.scoring_fix_keywords".into(),
            value: format!("{:?}", config.generator.scoring_fix_keywords),
            reason: "keywords must not be blank".into(),
        });
    }

    // ── Regression ───────────────────────────────────────────────────
    check_unit_range(
        &mut errors,
        "regression.improvement_threshold",
        config.regression.improvement_threshold,
    );
    check_unit_range(
        &mut errors,
        "regression.max_degradation_rate",
        config.regression.max_degradation_rate,
    );
    check_unit_range(
        &mut errors,
        "regression.review_confidence_threshold",
        config.regression.review_confidence_threshold,
    );
    if !(config.regression.score_tolerance.is_finite() && config.regression.score_tolerance >= 0.0)
    {
        errors.push(ConfigError::InvalidField {
            field: "regression.score_tolerance".into(),
            value: config.regression.score_tolerance.to_string(),
            reason: "must be a non-negative number".into(),
        });
    }

    // ── Deployer ─────────────────────────────────────────────────────
    let traffic = config.deployer.default_traffic_percentage;
    if !(traffic > 0.0 && traffic <= 1.0) {
        errors.push(ConfigError::InvalidField {
            field: "deployer.default_traffic_percentage".into(),
            value: traffic.to_string(),
            reason: "must be in (0.0, 1.0]".into(),
        });
    }
    check_unit_range(
        &mut errors,
        "deployer.anomaly_threshold",
        config.deployer.anomaly_threshold,
    );
    check_unit_range(
        &mut errors,
        "deployer.error_rate_threshold",
        config.deployer.error_rate_threshold,
    );
    check_positive(
        &mut errors,
        "deployer.review_margin_multiplier",
        config.deployer.review_margin_multiplier,
    );
    check_positive(
        &mut errors,
        "deployer.review_critical_multiplier",
        config.deployer.review_critical_multiplier,
    );
    if config.deployer.promote_after_healthy_checks == 0 {
        errors.push(ConfigError::InvalidField {
            field: "deployer.promote_after_healthy_checks".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }
    if config.deployer.monitor_interval_secs == 0 {
        errors.push(ConfigError::InvalidField {
            field: "deployer.monitor_interval_secs".into(),
            value: "0".into(),
            reason: "must be at least 1 second".into(),
        });
    }

    // ── Versioning ───────────────────────────────────────────────────
    if config.versioning.max_allocation_attempts == 0 {
        errors.push(ConfigError::InvalidField {
            field: "versioning.max_allocation_attempts".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
