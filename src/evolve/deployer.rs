//! # Patch Deployer
//!
//! ## Responsibility
//! Drive each tested patch through its canary lifecycle:
//!
//! ```text
//!            monitor: healthy/warning          promote_to_full
//!   CANARY ───────────────────────────────► PROMOTED
//!     │  monitor: critical (automatic)          │
//!     │  rollback (manual)                      │ rollback (manual)
//!     ▼                                         ▼
//!   ROLLED_BACK ◄───────────────────────────────┘
//! ```
//!
//! ## Guarantees
//! - Serialized: every decision on a deployment holds that deployment's lock,
//!   so a promotion can never race a rollback
//! - Uncancellable rollback: once live metrics have been fetched, anomaly
//!   detection and the resulting rollback run without further suspension
//! - Fail-open monitoring: metrics failures report `Unknown` and never
//!   trigger a rollback
//! - Idempotent: rolling back a rolled-back deployment, or promoting a
//!   promoted one, is a no-op success
//! - Ledger-consistent: a live deployment whose version has been rolled back
//!   in the version ledger is withdrawn at its next check and never promoted
//!
//! ## NOT Responsible For
//! - Scheduling monitoring (see `pipeline::EvolutionPipeline::spawn_monitor`)
//! - Routing grading traffic to the canary

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::anomaly::{detect_anomalies, worst_severity, Anomaly, GradingMetrics, Severity};
use super::generator::RulePatch;
use super::version::{VersionError, VersionManager, VersionStatus};
use crate::config::DeployerConfig;
use crate::metrics;

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Errors reported by a live metrics feed.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The feed could not be reached.
    #[error("metrics feed unavailable: {0}")]
    Unavailable(String),

    /// The feed has no data for the deployment yet.
    #[error("no metrics for deployment '{0}'")]
    NoData(String),
}

/// Errors produced by the patch deployer.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Traffic share outside `(0, 1]`.
    #[error("invalid traffic percentage {0}: must be in (0.0, 1.0]")]
    InvalidTrafficPercentage(f64),

    /// No deployment with this id.
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    /// The patch's version has already been rolled back.
    #[error("version {0} is rolled back and cannot be deployed")]
    VersionRolledBack(String),

    /// The version already has a live deployment.
    #[error("version {version} is already deployed as '{deployment_id}'")]
    AlreadyDeployed {
        /// Version being deployed.
        version: String,
        /// Existing live deployment.
        deployment_id: String,
    },

    /// The requested status change is not allowed.
    #[error("invalid transition for deployment '{deployment_id}': {from} -> {to}")]
    InvalidTransition {
        /// Deployment targeted.
        deployment_id: String,
        /// Current status.
        from: DeploymentStatus,
        /// Requested status.
        to: DeploymentStatus,
    },

    /// Promotion requires a last known health of healthy or warning.
    #[error("deployment '{deployment_id}' cannot be promoted: last known health is {last_health}")]
    PromotionBlocked {
        /// Deployment targeted.
        deployment_id: String,
        /// Last recorded health.
        last_health: HealthStatus,
    },

    /// Baseline metrics could not be captured at canary start.
    #[error("baseline metrics unavailable: {0}")]
    Baseline(#[from] MetricsError),

    /// The version ledger refused to mark the version rolled back.
    #[error("rollback of deployment '{deployment_id}' failed: {source}")]
    RollbackFailed {
        /// Deployment being rolled back.
        deployment_id: String,
        /// Anomalies from the deployment's last completed check.
        anomalies: Vec<Anomaly>,
        /// Ledger error.
        #[source]
        source: VersionError,
    },

    /// Version lookup failed.
    #[error(transparent)]
    Version(#[from] VersionError),
}

// ─── Status types ─────────────────────────────────────────────────────────────

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    /// Serving a share of traffic under observation.
    Canary,
    /// Serving all traffic.
    Promoted,
    /// Withdrawn.
    RolledBack,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Canary => "CANARY",
            Self::Promoted => "PROMOTED",
            Self::RolledBack => "ROLLED_BACK",
        })
    }
}

/// Result of one monitoring check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// No anomalies.
    Healthy,
    /// Warning-level anomalies only.
    Warning,
    /// At least one critical anomaly; triggers a rollback.
    Critical,
    /// Metrics could not be obtained.
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        })
    }
}

/// An entry in a deployment's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    /// Status before.
    pub from: DeploymentStatus,
    /// Status after.
    pub to: DeploymentStatus,
    /// Why.
    pub reason: String,
    /// When.
    pub at: DateTime<Utc>,
}

/// A patch deployment and its monitoring state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    /// Generated identifier.
    pub deployment_id: String,
    /// Deployed patch.
    pub patch_id: String,
    /// Version of the deployed patch.
    pub version: String,
    /// Share of traffic routed to the patch while in canary.
    pub traffic_percentage: f64,
    /// Lifecycle status.
    pub status: DeploymentStatus,
    /// Metrics captured when the canary started.
    pub baseline_metrics: GradingMetrics,
    /// Canary start time.
    pub started_at: DateTime<Utc>,
    /// Time of the last status change.
    pub updated_at: DateTime<Utc>,
    /// Last non-unknown health result.
    pub last_health: Option<HealthStatus>,
    /// Healthy checks in a row since the last non-healthy one.
    pub consecutive_healthy: u32,
    /// Anomalies from the last completed check.
    pub last_anomalies: Vec<Anomaly>,
    /// Audit trail of status changes.
    pub history: Vec<StatusTransition>,
}

impl Deployment {
    fn transition_to(&mut self, to: DeploymentStatus, reason: &str) {
        let now = Utc::now();
        self.history.push(StatusTransition {
            from: self.status,
            to,
            reason: reason.to_string(),
            at: now,
        });
        self.status = to;
        self.updated_at = now;
    }

    fn is_live(&self) -> bool {
        self.status != DeploymentStatus::RolledBack
    }
}

/// Outcome of [`PatchDeployer::monitor_deployment`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorReport {
    /// Deployment checked.
    pub deployment_id: String,
    /// Its version.
    pub version: String,
    /// Health verdict of this check.
    pub status: HealthStatus,
    /// Anomalies found by this check.
    pub anomalies: Vec<Anomaly>,
    /// Whether this check rolled the deployment back.
    pub rolled_back: bool,
    /// Deployment status after the check.
    pub deployment_status: DeploymentStatus,
    /// Healthy checks in a row, including this one.
    pub consecutive_healthy: u32,
}

// ─── Metrics feed seam ────────────────────────────────────────────────────────

/// Live grading metrics feed.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Metrics of the currently deployed rules, captured at canary start.
    async fn baseline_metrics(&self) -> Result<GradingMetrics, MetricsError>;

    /// Recent metrics for traffic served by `version`.
    async fn current_metrics(
        &self,
        deployment_id: &str,
        version: &str,
    ) -> Result<GradingMetrics, MetricsError>;
}

// ─── Deployer ─────────────────────────────────────────────────────────────────

/// Canary rollout, monitoring and rollback of rule patches.
///
/// Cheaply cloneable; clones share the same deployments.
#[derive(Clone)]
pub struct PatchDeployer {
    config: DeployerConfig,
    versions: VersionManager,
    source: Arc<dyn MetricsSource>,
    deployments: Arc<DashMap<String, Arc<Mutex<Deployment>>>>,
    /// version → live deployment id
    live_versions: Arc<DashMap<String, String>>,
    canaries: Arc<AtomicI64>,
}

impl fmt::Debug for PatchDeployer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchDeployer")
            .field("config", &self.config)
            .field("deployments", &self.deployments.len())
            .finish_non_exhaustive()
    }
}

impl PatchDeployer {
    /// Create a deployer over a version manager and a metrics feed.
    pub fn new(config: DeployerConfig, versions: VersionManager, source: Arc<dyn MetricsSource>) -> Self {
        Self {
            config,
            versions,
            source,
            deployments: Arc::new(DashMap::new()),
            live_versions: Arc::new(DashMap::new()),
            canaries: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Traffic share used when the caller has no preference.
    pub fn default_traffic_percentage(&self) -> f64 {
        self.config.default_traffic_percentage
    }

    /// Start a canary for `patch` on `traffic_percentage` of traffic.
    ///
    /// # Errors
    /// - [`DeployError::InvalidTrafficPercentage`] unless `0 < t <= 1`.
    /// - [`DeployError::Version`] if the patch version is unknown.
    /// - [`DeployError::VersionRolledBack`] if the version was rolled back.
    /// - [`DeployError::AlreadyDeployed`] if the version is already live.
    /// - [`DeployError::Baseline`] if baseline metrics cannot be captured.
    pub async fn deploy_canary(&self, patch: &RulePatch, traffic_percentage: f64) -> Result<Deployment, DeployError> {
        if !(traffic_percentage.is_finite() && traffic_percentage > 0.0 && traffic_percentage <= 1.0) {
            return Err(DeployError::InvalidTrafficPercentage(traffic_percentage));
        }

        let record = self.versions.get(&patch.version)?;
        if record.status == VersionStatus::RolledBack {
            return Err(DeployError::VersionRolledBack(patch.version.clone()));
        }

        let baseline_metrics = self.source.baseline_metrics().await?;

        let deployment_id = Uuid::new_v4().to_string();
        match self.live_versions.entry(patch.version.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                return Err(DeployError::AlreadyDeployed {
                    version: patch.version.clone(),
                    deployment_id: existing.get().clone(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(deployment_id.clone());
            }
        }

        let now = Utc::now();
        let deployment = Deployment {
            deployment_id: deployment_id.clone(),
            patch_id: patch.patch_id.clone(),
            version: patch.version.clone(),
            traffic_percentage,
            status: DeploymentStatus::Canary,
            baseline_metrics,
            started_at: now,
            updated_at: now,
            last_health: None,
            consecutive_healthy: 0,
            last_anomalies: Vec::new(),
            history: Vec::new(),
        };
        self.deployments
            .insert(deployment_id.clone(), Arc::new(Mutex::new(deployment.clone())));
        self.adjust_canaries(1);

        info!(
            deployment_id = %deployment_id,
            patch_id = %patch.patch_id,
            version = %patch.version,
            traffic_percentage,
            "canary deployment started"
        );
        Ok(deployment)
    }

    /// Compare live metrics against the baseline and act on the result.
    ///
    /// A critical anomaly rolls the deployment back before this returns.
    /// Rolled-back deployments are not re-checked; their last known health
    /// is reported.
    ///
    /// # Errors
    /// - [`DeployError::DeploymentNotFound`] for an unknown id.
    /// - [`DeployError::RollbackFailed`] if an automatic rollback was needed
    ///   but the version ledger refused it.
    pub async fn monitor_deployment(&self, deployment_id: &str) -> Result<MonitorReport, DeployError> {
        let handle = self.handle(deployment_id)?;
        let mut dep = handle.lock().await;

        if dep.status == DeploymentStatus::RolledBack {
            return Ok(report(&dep, dep.last_health.unwrap_or(HealthStatus::Unknown), Vec::new(), false));
        }
        if self.withdraw_if_version_rolled_back(&mut dep)? {
            return Ok(report(&dep, dep.last_health.unwrap_or(HealthStatus::Unknown), Vec::new(), true));
        }

        let current = match self.source.current_metrics(&dep.deployment_id, &dep.version).await {
            Ok(m) if m.is_valid() => m,
            Ok(m) => {
                warn!(deployment_id, ?m, "metrics feed returned out-of-range rates");
                return Ok(report(&dep, HealthStatus::Unknown, Vec::new(), false));
            }
            Err(e) => {
                warn!(deployment_id, error = %e, "metrics fetch failed; health unknown");
                return Ok(report(&dep, HealthStatus::Unknown, Vec::new(), false));
            }
        };

        // No suspension points from here on.
        let anomalies = detect_anomalies(&dep.baseline_metrics, &current, &self.config);
        for a in &anomalies {
            metrics::inc_anomaly(a.kind.as_str(), a.severity.as_str());
            warn!(deployment_id, kind = %a.kind, severity = a.severity.as_str(), "{}", a.message);
        }
        let status = match worst_severity(&anomalies) {
            Some(Severity::Critical) => HealthStatus::Critical,
            Some(Severity::Warning) => HealthStatus::Warning,
            None => HealthStatus::Healthy,
        };

        dep.last_health = Some(status);
        dep.last_anomalies = anomalies.clone();
        dep.consecutive_healthy = if status == HealthStatus::Healthy {
            dep.consecutive_healthy.saturating_add(1)
        } else {
            0
        };

        let mut rolled_back = false;
        if status == HealthStatus::Critical {
            let reason = anomalies
                .iter()
                .filter(|a| a.severity == Severity::Critical)
                .map(|a| a.kind.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            self.roll_back_locked(&mut dep, "automatic", &format!("critical anomaly: {reason}"))?;
            rolled_back = true;
        } else {
            debug!(deployment_id, %status, streak = dep.consecutive_healthy, "deployment checked");
        }

        Ok(report(&dep, status, anomalies, rolled_back))
    }

    /// Move a canary to full traffic.
    ///
    /// # Errors
    /// - [`DeployError::PromotionBlocked`] unless the last known health is
    ///   healthy or warning.
    /// - [`DeployError::InvalidTransition`] if the deployment was rolled back,
    ///   including when its version has since been rolled back in the ledger.
    pub async fn promote_to_full(&self, deployment_id: &str) -> Result<(), DeployError> {
        let handle = self.handle(deployment_id)?;
        let mut dep = handle.lock().await;
        if dep.is_live() {
            self.withdraw_if_version_rolled_back(&mut dep)?;
        }
        let (status, last_health) = (dep.status, dep.last_health);
        match status {
            DeploymentStatus::Promoted => Ok(()),
            DeploymentStatus::RolledBack => Err(DeployError::InvalidTransition {
                deployment_id: deployment_id.to_string(),
                from: DeploymentStatus::RolledBack,
                to: DeploymentStatus::Promoted,
            }),
            DeploymentStatus::Canary => match last_health {
                Some(HealthStatus::Healthy | HealthStatus::Warning) => {
                    dep.transition_to(DeploymentStatus::Promoted, "promoted to full traffic");
                    dep.traffic_percentage = 1.0;
                    self.adjust_canaries(-1);
                    info!(deployment_id, version = %dep.version, "deployment promoted");
                    Ok(())
                }
                last => Err(DeployError::PromotionBlocked {
                    deployment_id: deployment_id.to_string(),
                    last_health: last.unwrap_or(HealthStatus::Unknown),
                }),
            },
        }
    }

    /// Withdraw a deployment. Idempotent.
    ///
    /// # Errors
    /// - [`DeployError::DeploymentNotFound`] for an unknown id.
    /// - [`DeployError::RollbackFailed`] if the version ledger refuses.
    pub async fn rollback(&self, deployment_id: &str, reason: &str) -> Result<(), DeployError> {
        let handle = self.handle(deployment_id)?;
        let mut dep = handle.lock().await;
        if dep.status == DeploymentStatus::RolledBack {
            return Ok(());
        }
        self.roll_back_locked(&mut dep, "manual", reason)
    }

    /// Snapshot of one deployment.
    pub async fn get_deployment(&self, deployment_id: &str) -> Result<Deployment, DeployError> {
        let handle = self.handle(deployment_id)?;
        let dep = handle.lock().await;
        Ok(dep.clone())
    }

    /// Snapshots of every deployment, oldest first.
    pub async fn deployments(&self) -> Vec<Deployment> {
        let handles: Vec<_> = self.deployments.iter().map(|e| Arc::clone(e.value())).collect();
        let mut out = Vec::with_capacity(handles.len());
        for h in handles {
            out.push(h.lock().await.clone());
        }
        out.sort_by_key(|d| d.started_at);
        out
    }

    /// Ids of deployments that are in canary or promoted.
    pub async fn live_deployments(&self) -> Vec<String> {
        self.deployments()
            .await
            .into_iter()
            .filter(Deployment::is_live)
            .map(|d| d.deployment_id)
            .collect()
    }

    fn handle(&self, deployment_id: &str) -> Result<Arc<Mutex<Deployment>>, DeployError> {
        self.deployments
            .get(deployment_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| DeployError::DeploymentNotFound(deployment_id.to_string()))
    }

    /// Withdraw a live deployment whose version the ledger no longer
    /// considers active. Returns whether it was withdrawn.
    fn withdraw_if_version_rolled_back(&self, dep: &mut Deployment) -> Result<bool, DeployError> {
        if self.versions.get(&dep.version)?.status != VersionStatus::RolledBack {
            return Ok(false);
        }
        self.finish_rollback(dep, "ledger_sync", "version rolled back in ledger");
        Ok(true)
    }

    /// Mark the version rolled back in the ledger, then the deployment.
    fn roll_back_locked(&self, dep: &mut Deployment, trigger: &str, reason: &str) -> Result<(), DeployError> {
        if let Err(source) = self.versions.mark_rolled_back(&dep.version) {
            error!(
                deployment_id = %dep.deployment_id,
                version = %dep.version,
                error = %source,
                "rollback refused by version ledger"
            );
            return Err(DeployError::RollbackFailed {
                deployment_id: dep.deployment_id.clone(),
                anomalies: dep.last_anomalies.clone(),
                source,
            });
        }
        self.finish_rollback(dep, trigger, reason);
        Ok(())
    }

    fn finish_rollback(&self, dep: &mut Deployment, trigger: &str, reason: &str) {
        let was_canary = dep.status == DeploymentStatus::Canary;
        dep.transition_to(DeploymentStatus::RolledBack, reason);
        self.live_versions.remove(&dep.version);
        if was_canary {
            self.adjust_canaries(-1);
        }
        metrics::inc_rollback(trigger);
        warn!(
            deployment_id = %dep.deployment_id,
            version = %dep.version,
            trigger,
            reason,
            "deployment rolled back"
        );
    }

    fn adjust_canaries(&self, delta: i64) {
        let now = self.canaries.fetch_add(delta, Ordering::SeqCst) + delta;
        metrics::set_active_canaries(now);
    }
}

fn report(dep: &Deployment, status: HealthStatus, anomalies: Vec<Anomaly>, rolled_back: bool) -> MonitorReport {
    MonitorReport {
        deployment_id: dep.deployment_id.clone(),
        version: dep.version.clone(),
        status,
        anomalies,
        rolled_back,
        deployment_status: dep.status,
        consecutive_healthy: dep.consecutive_healthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolve::generator::{Enhancement, PatchContent, PatchTarget, PatchType};
    use crate::evolve::miner::PatternType;
    use std::sync::atomic::AtomicBool;

    struct ScriptedMetrics {
        baseline: GradingMetrics,
        current: parking_lot::Mutex<GradingMetrics>,
        failing: AtomicBool,
    }

    impl ScriptedMetrics {
        fn new(baseline: GradingMetrics) -> Arc<Self> {
            Arc::new(Self {
                baseline,
                current: parking_lot::Mutex::new(baseline),
                failing: AtomicBool::new(false),
            })
        }

        fn set_current(&self, m: GradingMetrics) {
            *self.current.lock() = m;
        }
    }

    #[async_trait]
    impl MetricsSource for ScriptedMetrics {
        async fn baseline_metrics(&self) -> Result<GradingMetrics, MetricsError> {
            Ok(self.baseline)
        }

        async fn current_metrics(&self, deployment_id: &str, _version: &str) -> Result<GradingMetrics, MetricsError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(MetricsError::NoData(deployment_id.to_string()));
            }
            Ok(*self.current.lock())
        }
    }

    fn patch(version: &str) -> RulePatch {
        RulePatch {
            patch_id: format!("patch-{version}"),
            patch_type: PatchType::Rule,
            version: version.to_string(),
            description: "test".to_string(),
            content: PatchContent {
                patch_target: PatchTarget::MatchingRules,
                pattern_type: PatternType::Matching,
                enhancement: Enhancement::SynonymGroups {
                    description: "d".to_string(),
                    groups: Vec::new(),
                },
            },
            source_pattern_id: "p".to_string(),
            created_at: Utc::now(),
        }
    }

    fn setup() -> (PatchDeployer, VersionManager, Arc<ScriptedMetrics>, RulePatch) {
        let versions = VersionManager::in_memory();
        let version = versions.allocate_version().expect("test: allocate");
        let source = ScriptedMetrics::new(GradingMetrics::new(0.10, 0.05, 0.10));
        let deployer = PatchDeployer::new(DeployerConfig::default(), versions.clone(), source.clone());
        (deployer, versions, source, patch(&version))
    }

    #[tokio::test]
    async fn test_traffic_percentage_validated() {
        let (d, _, _, p) = setup();
        for bad in [0.0, -0.5, 1.5, f64::NAN] {
            assert!(matches!(
                d.deploy_canary(&p, bad).await,
                Err(DeployError::InvalidTrafficPercentage(_))
            ));
        }
        assert!(d.deploy_canary(&p, 1.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_deploy_captures_baseline() {
        let (d, _, _, p) = setup();
        let dep = d.deploy_canary(&p, 0.1).await.expect("test: deploy");
        assert_eq!(dep.status, DeploymentStatus::Canary);
        assert_eq!(dep.baseline_metrics, GradingMetrics::new(0.10, 0.05, 0.10));
        assert_eq!(dep.version, p.version);
    }

    #[tokio::test]
    async fn test_unknown_version_rejected() {
        let (d, _, _, _) = setup();
        assert!(matches!(
            d.deploy_canary(&patch("v9.9.9"), 0.1).await,
            Err(DeployError::Version(VersionError::VersionNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_live_deployment_rejected() {
        let (d, _, _, p) = setup();
        d.deploy_canary(&p, 0.1).await.expect("test: deploy");
        assert!(matches!(
            d.deploy_canary(&p, 0.1).await,
            Err(DeployError::AlreadyDeployed { .. })
        ));
    }

    #[tokio::test]
    async fn test_healthy_checks_then_promote() {
        let (d, _, _, p) = setup();
        let dep = d.deploy_canary(&p, 0.1).await.expect("test: deploy");
        for expected in 1..=2 {
            let r = d.monitor_deployment(&dep.deployment_id).await.expect("test: monitor");
            assert_eq!(r.status, HealthStatus::Healthy);
            assert_eq!(r.consecutive_healthy, expected);
        }
        d.promote_to_full(&dep.deployment_id).await.expect("test: promote");
        let after = d.get_deployment(&dep.deployment_id).await.expect("test: get");
        assert_eq!(after.status, DeploymentStatus::Promoted);
        assert_eq!(after.history.len(), 1);
        d.promote_to_full(&dep.deployment_id).await.expect("test: promote again is a no-op");
    }

    #[tokio::test]
    async fn test_promote_requires_a_completed_check() {
        let (d, _, _, p) = setup();
        let dep = d.deploy_canary(&p, 0.1).await.expect("test: deploy");
        assert!(matches!(
            d.promote_to_full(&dep.deployment_id).await,
            Err(DeployError::PromotionBlocked {
                last_health: HealthStatus::Unknown,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_critical_anomaly_rolls_back_version() {
        let (d, versions, source, p) = setup();
        let dep = d.deploy_canary(&p, 0.1).await.expect("test: deploy");
        source.set_current(GradingMetrics::new(0.25, 0.05, 0.10));

        let r = d.monitor_deployment(&dep.deployment_id).await.expect("test: monitor");
        assert_eq!(r.status, HealthStatus::Critical);
        assert!(r.rolled_back);
        assert_eq!(r.deployment_status, DeploymentStatus::RolledBack);
        assert_eq!(
            versions.get(&p.version).expect("test: get version").status,
            VersionStatus::RolledBack
        );

        assert!(matches!(
            d.promote_to_full(&dep.deployment_id).await,
            Err(DeployError::InvalidTransition { .. })
        ));
        let again = d.monitor_deployment(&dep.deployment_id).await.expect("test: monitor again");
        assert_eq!(again.status, HealthStatus::Critical);
        assert!(!again.rolled_back);
    }

    #[tokio::test]
    async fn test_warning_does_not_roll_back() {
        let (d, _, source, p) = setup();
        let dep = d.deploy_canary(&p, 0.1).await.expect("test: deploy");
        source.set_current(GradingMetrics::new(0.10, 0.05, 0.35));
        let r = d.monitor_deployment(&dep.deployment_id).await.expect("test: monitor");
        assert_eq!(r.status, HealthStatus::Warning);
        assert!(!r.rolled_back);
        assert_eq!(r.consecutive_healthy, 0);
        d.promote_to_full(&dep.deployment_id).await.expect("test: warning may promote");
    }

    #[tokio::test]
    async fn test_metrics_failure_reports_unknown() {
        let (d, _, source, p) = setup();
        let dep = d.deploy_canary(&p, 0.1).await.expect("test: deploy");
        d.monitor_deployment(&dep.deployment_id).await.expect("test: monitor");

        source.failing.store(true, Ordering::SeqCst);
        let r = d.monitor_deployment(&dep.deployment_id).await.expect("test: monitor");
        assert_eq!(r.status, HealthStatus::Unknown);
        assert_eq!(r.deployment_status, DeploymentStatus::Canary);

        // Unknown does not overwrite the last known healthy result.
        d.promote_to_full(&dep.deployment_id).await.expect("test: promote");
    }

    #[tokio::test]
    async fn test_manual_rollback_is_idempotent() {
        let (d, versions, _, p) = setup();
        let dep = d.deploy_canary(&p, 0.1).await.expect("test: deploy");
        d.rollback(&dep.deployment_id, "operator request").await.expect("test: rollback");
        d.rollback(&dep.deployment_id, "operator request").await.expect("test: rollback again");
        let after = d.get_deployment(&dep.deployment_id).await.expect("test: get");
        assert_eq!(after.status, DeploymentStatus::RolledBack);
        assert_eq!(after.history.len(), 1);
        assert!(versions.active_versions().expect("test: active").is_empty());
        assert!(d.live_deployments().await.is_empty());

        // Rolled-back versions cannot be redeployed.
        assert!(matches!(
            d.deploy_canary(&p, 0.1).await,
            Err(DeployError::VersionRolledBack(_))
        ));
    }

    #[tokio::test]
    async fn test_rollback_blocked_by_dependent_version() {
        let (d, versions, _, p) = setup();
        versions
            .allocate_version_with_dependencies(&[p.version.clone()])
            .expect("test: dependent");
        let dep = d.deploy_canary(&p, 0.1).await.expect("test: deploy");
        assert!(matches!(
            d.rollback(&dep.deployment_id, "manual").await,
            Err(DeployError::RollbackFailed { .. })
        ));
        let after = d.get_deployment(&dep.deployment_id).await.expect("test: get");
        assert_eq!(after.status, DeploymentStatus::Canary);
    }

    #[tokio::test]
    async fn test_ledger_rollback_withdraws_live_canary() {
        let (d, versions, _, _) = setup();
        let newer = versions.allocate_version().expect("test: allocate");
        let dep = d.deploy_canary(&patch(&newer), 0.1).await.expect("test: deploy");
        let first = d.monitor_deployment(&dep.deployment_id).await.expect("test: monitor");
        assert_eq!(first.status, HealthStatus::Healthy);

        versions.rollback_to_version("v1.0.0").expect("test: ledger rollback");

        let r = d.monitor_deployment(&dep.deployment_id).await.expect("test: monitor");
        assert!(r.rolled_back);
        assert_eq!(r.deployment_status, DeploymentStatus::RolledBack);
        assert!(matches!(
            d.promote_to_full(&dep.deployment_id).await,
            Err(DeployError::InvalidTransition { .. })
        ));

        let after = d.get_deployment(&dep.deployment_id).await.expect("test: get");
        assert_eq!(after.status, DeploymentStatus::RolledBack);
        assert_eq!(after.traffic_percentage, 0.1);
        assert_eq!(
            after.history.last().map(|t| t.reason.as_str()),
            Some("version rolled back in ledger")
        );
        assert!(d.live_deployments().await.is_empty());
        assert_eq!(d.canaries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_promotion_refused_after_ledger_rollback_without_monitoring() {
        let (d, versions, _, _) = setup();
        let newer = versions.allocate_version().expect("test: allocate");
        let dep = d.deploy_canary(&patch(&newer), 0.1).await.expect("test: deploy");
        d.monitor_deployment(&dep.deployment_id).await.expect("test: monitor");

        versions.rollback_to_version("v1.0.0").expect("test: ledger rollback");

        assert!(matches!(
            d.promote_to_full(&dep.deployment_id).await,
            Err(DeployError::InvalidTransition { .. })
        ));
        let after = d.get_deployment(&dep.deployment_id).await.expect("test: get");
        assert_eq!(after.status, DeploymentStatus::RolledBack);
        assert_eq!(d.canaries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_blocked_automatic_rollback_keeps_anomalies() {
        let (d, versions, source, p) = setup();
        versions
            .allocate_version_with_dependencies(&[p.version.clone()])
            .expect("test: dependent");
        let dep = d.deploy_canary(&p, 0.1).await.expect("test: deploy");
        source.set_current(GradingMetrics::new(0.40, 0.05, 0.10));

        match d.monitor_deployment(&dep.deployment_id).await {
            Err(DeployError::RollbackFailed { anomalies, .. }) => {
                assert!(anomalies.iter().any(|a| a.severity == Severity::Critical));
            }
            other => panic!("expected rollback failure, got {other:?}"),
        }
        let after = d.get_deployment(&dep.deployment_id).await.expect("test: get");
        assert_eq!(after.status, DeploymentStatus::Canary);
        assert_eq!(after.last_health, Some(HealthStatus::Critical));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_promote_and_rollback_are_serialized() {
        for _ in 0..50 {
            let (d, versions, _, p) = setup();
            let dep = d.deploy_canary(&p, 0.1).await.expect("test: deploy");
            d.monitor_deployment(&dep.deployment_id).await.expect("test: monitor");

            let promote = {
                let d = d.clone();
                let id = dep.deployment_id.clone();
                tokio::spawn(async move { d.promote_to_full(&id).await })
            };
            let rollback = {
                let d = d.clone();
                let id = dep.deployment_id.clone();
                tokio::spawn(async move { d.rollback(&id, "operator request").await })
            };
            let promoted = promote.await.expect("test: join").is_ok();
            rollback
                .await
                .expect("test: join")
                .expect("test: rollback always succeeds");

            let after = d.get_deployment(&dep.deployment_id).await.expect("test: get");
            let ledger = versions.get(&p.version).expect("test: get").status;
            assert_eq!(after.status, DeploymentStatus::RolledBack);
            assert_eq!(ledger, VersionStatus::RolledBack);
            if promoted {
                let path: Vec<_> = after.history.iter().map(|t| t.to).collect();
                assert_eq!(path, vec![DeploymentStatus::Promoted, DeploymentStatus::RolledBack]);
            } else {
                assert_eq!(after.history.len(), 1);
            }
            assert_eq!(d.canaries.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_unknown_deployment_id() {
        let (d, _, _, _) = setup();
        assert!(matches!(
            d.monitor_deployment("nope").await,
            Err(DeployError::DeploymentNotFound(_))
        ));
    }
}
