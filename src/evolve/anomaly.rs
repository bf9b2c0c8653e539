//! # Canary Anomaly Detection
//!
//! ## Responsibility
//! Compare live grading metrics for a deployment against the baseline that
//! was captured when its canary started.
//!
//! ## Rules
//! | Kind | Condition | Severity |
//! |------|-----------|----------|
//! | `error_rate_increase` | Δerror > `anomaly_threshold` | critical |
//! | `high_error_rate` | error > `error_rate_threshold` | critical |
//! | `miss_rate_increase` | Δmiss > `anomaly_threshold` | critical |
//! | `review_rate_increase` | Δreview > margin | warning |
//! | `review_rate_increase` | Δreview > margin × `review_critical_multiplier` | critical |
//!
//! where margin = `anomaly_threshold × review_margin_multiplier`. All
//! comparisons are strict.
//!
//! ## NOT Responsible For
//! - Acting on anomalies (the deployer rolls back)
//! - Fetching metrics

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DeployerConfig;

/// Severity of a detected anomaly, least severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Worth watching; no automatic action.
    Warning,
    /// Triggers automatic rollback.
    Critical,
}

impl Severity {
    /// Lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Which rule fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Error rate rose relative to baseline.
    ErrorRateIncrease,
    /// Error rate is above the absolute ceiling.
    HighErrorRate,
    /// Miss rate rose relative to baseline.
    MissRateIncrease,
    /// Review rate rose relative to baseline.
    ReviewRateIncrease,
}

impl AnomalyKind {
    /// Wire name, e.g. `error_rate_increase`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ErrorRateIncrease => "error_rate_increase",
            Self::HighErrorRate => "high_error_rate",
            Self::MissRateIncrease => "miss_rate_increase",
            Self::ReviewRateIncrease => "review_rate_increase",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Grading quality rates over a recent window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GradingMetrics {
    /// Share of over-penalised grades.
    pub error_rate: f64,
    /// Share of under-penalised grades.
    pub miss_rate: f64,
    /// Share of grades sent to human review.
    pub review_rate: f64,
}

impl GradingMetrics {
    /// Build a metrics triple.
    pub fn new(error_rate: f64, miss_rate: f64, review_rate: f64) -> Self {
        Self {
            error_rate,
            miss_rate,
            review_rate,
        }
    }

    /// Whether every rate is a finite value in `[0, 1]`.
    pub fn is_valid(&self) -> bool {
        [self.error_rate, self.miss_rate, self.review_rate]
            .iter()
            .all(|r| r.is_finite() && (0.0..=1.0).contains(r))
    }
}

/// A single detected deviation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    /// Rule that fired.
    pub kind: AnomalyKind,
    /// Severity.
    pub severity: Severity,
    /// Baseline value of the metric (absolute rules report the current value).
    pub baseline: f64,
    /// Current value of the metric.
    pub current: f64,
    /// Threshold that was exceeded.
    pub threshold: f64,
    /// Human-readable explanation.
    pub message: String,
    /// Detection time.
    pub detected_at: DateTime<Utc>,
}

impl Anomaly {
    fn new(kind: AnomalyKind, severity: Severity, baseline: f64, current: f64, threshold: f64) -> Self {
        let message = match kind {
            AnomalyKind::HighErrorRate => {
                format!("error rate {current:.3} exceeds ceiling {threshold:.3}")
            }
            _ => format!(
                "{kind}: {baseline:.3} -> {current:.3} (increase {:.3} > {threshold:.3})",
                current - baseline
            ),
        };
        Self {
            kind,
            severity,
            baseline,
            current,
            threshold,
            message,
            detected_at: Utc::now(),
        }
    }
}

/// Apply every rule to `baseline` vs `current`.
pub fn detect_anomalies(
    baseline: &GradingMetrics,
    current: &GradingMetrics,
    config: &DeployerConfig,
) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    let threshold = config.anomaly_threshold;

    if current.error_rate - baseline.error_rate > threshold {
        anomalies.push(Anomaly::new(
            AnomalyKind::ErrorRateIncrease,
            Severity::Critical,
            baseline.error_rate,
            current.error_rate,
            threshold,
        ));
    }

    if current.error_rate > config.error_rate_threshold {
        anomalies.push(Anomaly::new(
            AnomalyKind::HighErrorRate,
            Severity::Critical,
            current.error_rate,
            current.error_rate,
            config.error_rate_threshold,
        ));
    }

    if current.miss_rate - baseline.miss_rate > threshold {
        anomalies.push(Anomaly::new(
            AnomalyKind::MissRateIncrease,
            Severity::Critical,
            baseline.miss_rate,
            current.miss_rate,
            threshold,
        ));
    }

    let margin = threshold * config.review_margin_multiplier;
    let critical_margin = margin * config.review_critical_multiplier;
    let review_increase = current.review_rate - baseline.review_rate;
    if review_increase > margin {
        let (severity, limit) = if review_increase > critical_margin {
            (Severity::Critical, critical_margin)
        } else {
            (Severity::Warning, margin)
        };
        anomalies.push(Anomaly::new(
            AnomalyKind::ReviewRateIncrease,
            severity,
            baseline.review_rate,
            current.review_rate,
            limit,
        ));
    }

    anomalies
}

/// Highest severity among `anomalies`, if any.
pub fn worst_severity(anomalies: &[Anomaly]) -> Option<Severity> {
    anomalies.iter().map(|a| a.severity).max()
}
