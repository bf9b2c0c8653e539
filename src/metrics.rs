//! Prometheus metrics for the patch pipeline.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`inc_patch_generated`, `inc_rollback`, …) are no-ops if `init_metrics`
//! was never called, so the pipeline is always safe to run and observability
//! simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `grade_evolve_patterns_mined_total` | Counter | `pattern_type` |
//! | `grade_evolve_patches_generated_total` | Counter | `patch_target` |
//! | `grade_evolve_regression_runs_total` | Counter | `verdict` |
//! | `grade_evolve_versions_allocated_total` | Counter | |
//! | `grade_evolve_anomalies_total` | Counter | `kind`, `severity` |
//! | `grade_evolve_rollbacks_total` | Counter | `trigger` |
//! | `grade_evolve_active_canaries` | Gauge | |

use crate::PipelineError;
use prometheus::{core::Collector, CounterVec, Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the pipeline, stored in a single [`OnceLock`].
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Failure patterns emitted by the miner, per pattern type.
    pub patterns_mined: CounterVec,
    /// Rule patches generated, per patch target.
    pub patches_generated: CounterVec,
    /// Regression runs, per verdict (`passed` / `failed`).
    pub regression_runs: CounterVec,
    /// Versions allocated from the ledger.
    pub versions_allocated: IntCounter,
    /// Anomalies detected during canary monitoring.
    pub anomalies: CounterVec,
    /// Rollbacks performed, per trigger (`automatic`, `manual`, `ledger`).
    pub rollbacks: CounterVec,
    /// Deployments currently in the canary stage.
    pub active_canaries: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C>(registry: &Registry, collector: C) -> Result<C, PipelineError>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| PipelineError::Other(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> Result<CounterVec, PipelineError> {
    CounterVec::new(Opts::new(name, help), labels)
        .map_err(|e| PipelineError::Other(format!("metrics init failed: {e}")))
}

fn build(registry: Registry) -> Result<Metrics, PipelineError> {
    let patterns_mined = register(
        &registry,
        counter_vec(
            "grade_evolve_patterns_mined_total",
            "Failure patterns emitted by the miner",
            &["pattern_type"],
        )?,
    )?;
    let patches_generated = register(
        &registry,
        counter_vec(
            "grade_evolve_patches_generated_total",
            "Rule patches generated",
            &["patch_target"],
        )?,
    )?;
    let regression_runs = register(
        &registry,
        counter_vec(
            "grade_evolve_regression_runs_total",
            "Regression runs by verdict",
            &["verdict"],
        )?,
    )?;
    let versions_allocated = register(
        &registry,
        IntCounter::new(
            "grade_evolve_versions_allocated_total",
            "Versions allocated from the ledger",
        )
        .map_err(|e| PipelineError::Other(format!("metrics init failed: {e}")))?,
    )?;
    let anomalies = register(
        &registry,
        counter_vec(
            "grade_evolve_anomalies_total",
            "Anomalies detected while monitoring deployments",
            &["kind", "severity"],
        )?,
    )?;
    let rollbacks = register(
        &registry,
        counter_vec(
            "grade_evolve_rollbacks_total",
            "Rollbacks by trigger",
            &["trigger"],
        )?,
    )?;
    let active_canaries = register(
        &registry,
        IntGauge::new(
            "grade_evolve_active_canaries",
            "Deployments currently in canary",
        )
        .map_err(|e| PipelineError::Other(format!("metrics init failed: {e}")))?,
    )?;

    Ok(Metrics {
        registry,
        patterns_mined,
        patches_generated,
        regression_runs,
        versions_allocated,
        anomalies,
        rollbacks,
        active_canaries,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics in a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`PipelineError::Other`] if metric construction or registration
/// fails.
pub fn init_metrics() -> Result<(), PipelineError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let metrics = build(Registry::new())?;
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(metrics);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count a failure pattern emitted by the miner.
pub fn inc_patterns_mined(pattern_type: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.patterns_mined.get_metric_with_label_values(&[pattern_type]) {
            c.inc();
        }
    }
}

/// Count a generated patch.
pub fn inc_patch_generated(patch_target: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .patches_generated
            .get_metric_with_label_values(&[patch_target])
        {
            c.inc();
        }
    }
}

/// Count a regression run by verdict.
pub fn inc_regression_run(passed: bool) {
    let verdict = if passed { "passed" } else { "failed" };
    if let Some(m) = metrics() {
        if let Ok(c) = m.regression_runs.get_metric_with_label_values(&[verdict]) {
            c.inc();
        }
    }
}

/// Count an allocated version.
pub fn inc_versions_allocated() {
    if let Some(m) = metrics() {
        m.versions_allocated.inc();
    }
}

/// Count a detected anomaly.
pub fn inc_anomaly(kind: &str, severity: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.anomalies.get_metric_with_label_values(&[kind, severity]) {
            c.inc();
        }
    }
}

/// Count a rollback by trigger.
pub fn inc_rollback(trigger: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.rollbacks.get_metric_with_label_values(&[trigger]) {
            c.inc();
        }
    }
}

/// Set the number of live canaries.
pub fn set_active_canaries(count: i64) {
    if let Some(m) = metrics() {
        m.active_canaries.set(count);
    }
}

/// Gather all registered metric families. Empty before initialisation.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
