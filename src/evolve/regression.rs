//! # Regression Tester
//!
//! Offline comparison of the current rule set against a candidate patch on a
//! fixed evaluation set.
//!
//! ## Per-sample classification
//! Let `d = predicted − ground_truth`:
//! - `d < −tolerance` → **error** (over-penalisation)
//! - `d > tolerance` → **miss** (under-penalisation)
//! - otherwise, `confidence < review_threshold` → **review**
//! - otherwise → ok
//!
//! ## Acceptance
//! A patch passes only if at least one rate delta (`old − new`) reaches
//! `improvement_threshold`, no delta is negative, and the share of samples
//! whose outcome got worse stays within `max_degradation_rate`. An empty
//! evaluation set never passes.
//!
//! ## Graceful degradation
//! Malformed samples are skipped and counted. If the evaluator itself fails,
//! the run reports `passed = false` instead of returning an error.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::generator::RulePatch;
use crate::config::RegressionConfig;
use crate::metrics;

/// Slack on rate-delta comparisons so that `0.20 − 0.15` counts as `0.05`.
const RATE_EPSILON: f64 = 1e-9;

// ─── Error ────────────────────────────────────────────────────────────────────

/// Errors produced while obtaining predictions.
#[derive(Debug, Error)]
pub enum RegressionError {
    /// The rule-set evaluator could not produce predictions.
    #[error("evaluator failed: {0}")]
    Evaluator(String),
}

// ─── Evaluation data ──────────────────────────────────────────────────────────

/// One labelled evaluation sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSample {
    /// Sample identifier.
    pub sample_id: String,
    /// Teacher-assigned score.
    pub ground_truth_score: f64,
    /// Maximum achievable score.
    pub max_score: f64,
}

impl EvalSample {
    fn is_well_formed(&self) -> bool {
        self.ground_truth_score.is_finite()
            && self.max_score.is_finite()
            && self.max_score > 0.0
            && (0.0..=self.max_score).contains(&self.ground_truth_score)
    }
}

/// A named evaluation set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalSet {
    /// Set name, for logs.
    pub name: String,
    /// Samples in evaluation order.
    pub samples: Vec<EvalSample>,
}

/// A rule set's prediction for one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Sample the prediction is for.
    pub sample_id: String,
    /// Predicted score.
    pub predicted_score: f64,
    /// Grading confidence (0.0–1.0).
    pub confidence: f64,
}

impl Prediction {
    fn is_well_formed(&self) -> bool {
        self.predicted_score.is_finite()
            && self.confidence.is_finite()
            && (0.0..=1.0).contains(&self.confidence)
    }
}

/// Classification of a single prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleOutcome {
    /// Within tolerance and confident.
    Ok,
    /// Within tolerance but low confidence; needs human review.
    Review,
    /// Predicted below ground truth (over-penalised).
    Error,
    /// Predicted above ground truth (under-penalised).
    Miss,
}

impl SampleOutcome {
    /// Severity rank: ok < review < error/miss.
    pub fn rank(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Review => 1,
            Self::Error | Self::Miss => 2,
        }
    }
}

/// Verdict of one regression run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionResult {
    /// Patch under test.
    pub patch_id: String,
    /// Error rate with the current rules.
    pub old_error_rate: f64,
    /// Error rate with the patch.
    pub new_error_rate: f64,
    /// Miss rate with the current rules.
    pub old_miss_rate: f64,
    /// Miss rate with the patch.
    pub new_miss_rate: f64,
    /// Review rate with the current rules.
    pub old_review_rate: f64,
    /// Review rate with the patch.
    pub new_review_rate: f64,
    /// Samples that were compared.
    pub total_samples: usize,
    /// Samples whose outcome got better.
    pub improved_samples: usize,
    /// Samples whose outcome got worse.
    pub degraded_samples: usize,
    /// Malformed samples left out of the comparison.
    pub skipped_samples: usize,
    /// Whether the patch may be deployed.
    pub passed: bool,
}

impl RegressionResult {
    fn empty(patch_id: &str, skipped_samples: usize) -> Self {
        Self {
            patch_id: patch_id.to_string(),
            old_error_rate: 0.0,
            new_error_rate: 0.0,
            old_miss_rate: 0.0,
            new_miss_rate: 0.0,
            old_review_rate: 0.0,
            new_review_rate: 0.0,
            total_samples: 0,
            improved_samples: 0,
            degraded_samples: 0,
            skipped_samples,
            passed: false,
        }
    }

    /// `(error, miss, review)` deltas, each `old − new`.
    pub fn deltas(&self) -> [f64; 3] {
        [
            self.old_error_rate - self.new_error_rate,
            self.old_miss_rate - self.new_miss_rate,
            self.old_review_rate - self.new_review_rate,
        ]
    }
}

#[derive(Default)]
struct Tally {
    errors: usize,
    misses: usize,
    reviews: usize,
}

impl Tally {
    fn record(&mut self, outcome: SampleOutcome) {
        match outcome {
            SampleOutcome::Ok => {}
            SampleOutcome::Review => self.reviews += 1,
            SampleOutcome::Error => self.errors += 1,
            SampleOutcome::Miss => self.misses += 1,
        }
    }

    fn rates(&self, total: usize) -> (f64, f64, f64) {
        if total == 0 {
            return (0.0, 0.0, 0.0);
        }
        let t = total as f64;
        (
            self.errors as f64 / t,
            self.misses as f64 / t,
            self.reviews as f64 / t,
        )
    }
}

// ─── Evaluator seam ───────────────────────────────────────────────────────────

/// Produces predictions for an evaluation set under a rule set.
///
/// `patch = None` means the currently deployed rules.
#[async_trait]
pub trait RuleSetEvaluator: Send + Sync {
    /// Grade every sample and return one prediction per sample.
    async fn predict(
        &self,
        patch: Option<&RulePatch>,
        samples: &[EvalSample],
    ) -> Result<Vec<Prediction>, RegressionError>;
}

// ─── Tester ───────────────────────────────────────────────────────────────────

/// Compares old and new rule-set behaviour.
#[derive(Debug, Clone, Default)]
pub struct RegressionTester {
    config: RegressionConfig,
}

impl RegressionTester {
    /// Create a tester.
    pub fn new(config: RegressionConfig) -> Self {
        Self { config }
    }

    /// Classify a single prediction against its sample.
    pub fn classify(&self, sample: &EvalSample, prediction: &Prediction) -> SampleOutcome {
        let diff = prediction.predicted_score - sample.ground_truth_score;
        if diff.abs() > self.config.score_tolerance {
            if diff < 0.0 {
                SampleOutcome::Error
            } else {
                SampleOutcome::Miss
            }
        } else if prediction.confidence < self.config.review_confidence_threshold {
            SampleOutcome::Review
        } else {
            SampleOutcome::Ok
        }
    }

    /// Compare two prediction sets over `eval_set` and compute the verdict.
    pub fn compare(
        &self,
        patch_id: &str,
        eval_set: &EvalSet,
        old: &[Prediction],
        new: &[Prediction],
    ) -> RegressionResult {
        let old_by_id = index(old);
        let new_by_id = index(new);

        let mut seen = HashSet::new();
        let mut old_tally = Tally::default();
        let mut new_tally = Tally::default();
        let (mut total, mut improved, mut degraded, mut skipped) = (0, 0, 0, 0);

        for sample in &eval_set.samples {
            let pair = old_by_id
                .get(sample.sample_id.as_str())
                .zip(new_by_id.get(sample.sample_id.as_str()));
            let usable = sample.is_well_formed()
                && seen.insert(sample.sample_id.as_str())
                && pair.map_or(false, |(o, n)| o.is_well_formed() && n.is_well_formed());
            let Some((old_pred, new_pred)) = pair.filter(|_| usable) else {
                debug!(sample_id = %sample.sample_id, set = %eval_set.name, "skipping malformed sample");
                skipped += 1;
                continue;
            };

            let before = self.classify(sample, old_pred);
            let after = self.classify(sample, new_pred);
            old_tally.record(before);
            new_tally.record(after);
            total += 1;
            match after.rank().cmp(&before.rank()) {
                std::cmp::Ordering::Less => improved += 1,
                std::cmp::Ordering::Greater => degraded += 1,
                std::cmp::Ordering::Equal => {}
            }
        }

        let (old_error_rate, old_miss_rate, old_review_rate) = old_tally.rates(total);
        let (new_error_rate, new_miss_rate, new_review_rate) = new_tally.rates(total);
        let mut result = RegressionResult {
            patch_id: patch_id.to_string(),
            old_error_rate,
            new_error_rate,
            old_miss_rate,
            new_miss_rate,
            old_review_rate,
            new_review_rate,
            total_samples: total,
            improved_samples: improved,
            degraded_samples: degraded,
            skipped_samples: skipped,
            passed: false,
        };
        result.passed = self.is_improvement(&result);
        result
    }

    /// Acceptance verdict for a comparison.
    pub fn is_improvement(&self, result: &RegressionResult) -> bool {
        if result.total_samples == 0 {
            return false;
        }
        let deltas = result.deltas();
        let improves = deltas
            .iter()
            .any(|d| *d >= self.config.improvement_threshold - RATE_EPSILON);
        let regresses = deltas.iter().any(|d| *d < -RATE_EPSILON);
        let degradation = result.degraded_samples as f64 / result.total_samples as f64;
        improves && !regresses && degradation <= self.config.max_degradation_rate + RATE_EPSILON
    }

    /// Run old and candidate rules over `eval_set` and compare them.
    ///
    /// Never fails: evaluator errors produce a non-passing result.
    pub async fn run_regression(
        &self,
        patch: &RulePatch,
        eval_set: &EvalSet,
        evaluator: &dyn RuleSetEvaluator,
    ) -> RegressionResult {
        let predictions = async {
            let old = evaluator.predict(None, &eval_set.samples).await?;
            let new = evaluator.predict(Some(patch), &eval_set.samples).await?;
            Ok::<_, RegressionError>((old, new))
        }
        .await;

        let result = match predictions {
            Ok((old, new)) => self.compare(&patch.patch_id, eval_set, &old, &new),
            Err(e) => {
                warn!(patch_id = %patch.patch_id, error = %e, "regression run could not obtain predictions");
                RegressionResult::empty(&patch.patch_id, eval_set.samples.len())
            }
        };

        metrics::inc_regression_run(result.passed);
        info!(
            patch_id = %result.patch_id,
            version = %patch.version,
            passed = result.passed,
            total = result.total_samples,
            skipped = result.skipped_samples,
            degraded = result.degraded_samples,
            old_error_rate = result.old_error_rate,
            new_error_rate = result.new_error_rate,
            "regression verdict"
        );
        result
    }
}

/// First prediction per sample id.
fn index(predictions: &[Prediction]) -> HashMap<&str, &Prediction> {
    let mut map = HashMap::with_capacity(predictions.len());
    for p in predictions {
        map.entry(p.sample_id.as_str()).or_insert(p);
    }
    map
}
