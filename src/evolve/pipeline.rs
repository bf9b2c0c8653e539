//! # Evolution Pipeline
//!
//! Wires the five stages into one control plane.
//!
//! ```text
//! override logs ─► PatternMiner ─► PatchGenerator ─► RegressionTester ─► PatchDeployer
//!                                        │                                   │
//!                                        └────────── VersionManager ◄────────┘
//! ```
//!
//! [`EvolutionPipeline::process_overrides`] runs one batch end to end and
//! leaves passing patches in canary. [`EvolutionPipeline::spawn_monitor`]
//! periodically checks live deployments, promoting canaries after enough
//! consecutive healthy checks.
//!
//! Stage errors for one pattern are logged and recorded in its report; they
//! never abort the rest of the batch.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::deployer::{
    DeployError, DeploymentStatus, HealthStatus, MetricsSource, MonitorReport, PatchDeployer,
};
use super::generator::{PatchGenerator, RulePatch};
use super::miner::{MiningSummary, OverrideLog, PatternMiner, PatternType};
use super::regression::{EvalSet, RegressionResult, RegressionTester, RuleSetEvaluator};
use super::version::{VersionLedger, VersionManager};
use crate::config::EvolutionConfig;

/// Result of checking one live deployment during a monitor tick.
///
/// A failed check (for example an automatic rollback the ledger refused)
/// stays in the tick output; [`DeployError::RollbackFailed`] carries the
/// anomalies that triggered it.
#[derive(Debug)]
pub struct MonitorCheck {
    /// Deployment checked.
    pub deployment_id: String,
    /// Health report, or why the check could not complete.
    pub result: Result<MonitorReport, DeployError>,
}

impl MonitorCheck {
    /// The report, when the check completed.
    pub fn report(&self) -> Option<&MonitorReport> {
        self.result.as_ref().ok()
    }
}

/// What happened to one mined pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PatternOutcome {
    /// No patch could be generated.
    NoPatch,
    /// Patch generation failed.
    GenerationFailed {
        /// Error text.
        error: String,
    },
    /// The patch did not pass regression.
    Rejected {
        /// Candidate patch.
        patch: RulePatch,
        /// Regression verdict.
        regression: RegressionResult,
    },
    /// The patch passed regression but could not be deployed.
    DeployFailed {
        /// Candidate patch.
        patch: RulePatch,
        /// Regression verdict.
        regression: RegressionResult,
        /// Error text.
        error: String,
    },
    /// The patch is now in canary.
    Deployed {
        /// Deployed patch.
        patch: RulePatch,
        /// Regression verdict.
        regression: RegressionResult,
        /// New deployment.
        deployment_id: String,
    },
}

/// Per-pattern entry of a [`PipelineRun`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternReport {
    /// Source pattern.
    pub pattern_id: String,
    /// Its stage.
    pub pattern_type: PatternType,
    /// Its frequency.
    pub frequency: usize,
    /// What happened.
    pub outcome: PatternOutcome,
}

/// Result of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Mining summary.
    pub summary: MiningSummary,
    /// One report per pattern, most frequent first.
    pub patterns: Vec<PatternReport>,
}

impl PipelineRun {
    /// Ids of deployments started by this run.
    pub fn deployment_ids(&self) -> Vec<&str> {
        self.patterns
            .iter()
            .filter_map(|p| match &p.outcome {
                PatternOutcome::Deployed { deployment_id, .. } => Some(deployment_id.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// The assembled patch pipeline.
#[derive(Debug, Clone)]
pub struct EvolutionPipeline {
    miner: PatternMiner,
    generator: PatchGenerator,
    tester: RegressionTester,
    deployer: PatchDeployer,
    versions: VersionManager,
    config: EvolutionConfig,
    last_summary: Arc<Mutex<Option<MiningSummary>>>,
}

impl EvolutionPipeline {
    /// Build every stage from `config` over the given ledger and metrics feed.
    pub fn new(
        config: EvolutionConfig,
        ledger: Arc<dyn VersionLedger>,
        source: Arc<dyn MetricsSource>,
    ) -> Self {
        let versions = VersionManager::new(ledger, config.versioning.clone());
        let miner = PatternMiner::new(config.miner.clone())
            .with_scoring_keywords(config.generator.scoring_fix_keywords.clone());
        Self {
            miner,
            generator: PatchGenerator::new(config.generator.clone(), versions.clone()),
            tester: RegressionTester::new(config.regression.clone()),
            deployer: PatchDeployer::new(config.deployer.clone(), versions.clone(), source),
            versions,
            config,
            last_summary: Arc::new(Mutex::new(None)),
        }
    }

    /// The deployer, for manual promotion or rollback.
    pub fn deployer(&self) -> &PatchDeployer {
        &self.deployer
    }

    /// The version manager, for audit views.
    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    /// Summary of the most recent batch.
    pub fn last_summary(&self) -> Option<MiningSummary> {
        self.last_summary.lock().clone()
    }

    /// Mine `logs`, then generate, regression-test and canary-deploy a patch
    /// per fixable pattern.
    pub async fn process_overrides(
        &self,
        logs: &[OverrideLog],
        eval_set: &EvalSet,
        evaluator: &dyn RuleSetEvaluator,
    ) -> PipelineRun {
        let patterns = self.miner.analyze_overrides(logs);
        let summary = self.miner.generate_summary(logs, &patterns);
        *self.last_summary.lock() = Some(summary.clone());

        let mut reports = Vec::with_capacity(patterns.len());
        for pattern in &patterns {
            let outcome = match self.generator.generate_patch(pattern) {
                Ok(None) => PatternOutcome::NoPatch,
                Err(e) => {
                    error!(pattern_id = %pattern.pattern_id, error = %e, "patch generation failed");
                    PatternOutcome::GenerationFailed { error: e.to_string() }
                }
                Ok(Some(patch)) => self.test_and_deploy(patch, eval_set, evaluator).await,
            };
            reports.push(PatternReport {
                pattern_id: pattern.pattern_id.clone(),
                pattern_type: pattern.pattern_type,
                frequency: pattern.frequency,
                outcome,
            });
        }

        info!(
            overrides = summary.total_overrides,
            patterns = summary.total_patterns,
            deployed = reports
                .iter()
                .filter(|r| matches!(r.outcome, PatternOutcome::Deployed { .. }))
                .count(),
            "override batch processed"
        );
        PipelineRun {
            summary,
            patterns: reports,
        }
    }

    async fn test_and_deploy(
        &self,
        patch: RulePatch,
        eval_set: &EvalSet,
        evaluator: &dyn RuleSetEvaluator,
    ) -> PatternOutcome {
        let regression = self.tester.run_regression(&patch, eval_set, evaluator).await;
        if !regression.passed {
            return PatternOutcome::Rejected { patch, regression };
        }
        match self
            .deployer
            .deploy_canary(&patch, self.deployer.default_traffic_percentage())
            .await
        {
            Ok(deployment) => PatternOutcome::Deployed {
                patch,
                regression,
                deployment_id: deployment.deployment_id,
            },
            Err(e) => {
                warn!(patch_id = %patch.patch_id, error = %e, "canary deployment failed");
                PatternOutcome::DeployFailed {
                    patch,
                    regression,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Check every live deployment once and auto-promote healthy canaries.
    ///
    /// Returns one entry per live deployment, failed checks included.
    pub async fn monitor_tick(&self) -> Vec<MonitorCheck> {
        let promote_after = self.config.deployer.promote_after_healthy_checks;
        let mut checks = Vec::new();
        for id in self.deployer.live_deployments().await {
            let result = self.deployer.monitor_deployment(&id).await;
            match &result {
                Ok(report)
                    if report.deployment_status == DeploymentStatus::Canary
                        && report.status == HealthStatus::Healthy
                        && report.consecutive_healthy >= promote_after =>
                {
                    match self.deployer.promote_to_full(&id).await {
                        Ok(()) => info!(deployment_id = %id, checks = report.consecutive_healthy, "auto-promoted"),
                        Err(e) => warn!(deployment_id = %id, error = %e, "auto-promotion failed"),
                    }
                }
                Ok(_) => {}
                Err(e) => error!(deployment_id = %id, error = %e, "monitoring failed"),
            }
            checks.push(MonitorCheck {
                deployment_id: id,
                result,
            });
        }
        checks
    }

    /// Run [`monitor_tick`](Self::monitor_tick) every
    /// `deployer.monitor_interval_secs` until `shutdown` flips to `true` or
    /// its sender is dropped.
    ///
    /// A tick that has started always finishes, including any rollback it
    /// triggers.
    pub fn spawn_monitor(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let pipeline = self.clone();
        let period = Duration::from_secs(self.config.deployer.monitor_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "deployment monitor started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let checks = pipeline.monitor_tick().await;
                        let failed = checks.iter().filter(|c| c.result.is_err()).count();
                        debug!(checked = checks.len(), failed, "monitor tick");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("deployment monitor stopped");
        })
    }
}
