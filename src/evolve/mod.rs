//! # Rule-patch evolution
//!
//! | Module | Role |
//! |--------|------|
//! | [`miner`] | cluster override logs into failure patterns |
//! | [`generator`] | synthesise a versioned patch per fixable pattern |
//! | [`regression`] | compare old vs new rules on an evaluation set |
//! | [`anomaly`] | classify live metric deviations |
//! | [`deployer`] | canary, monitor, promote, roll back |
//! | [`version`] | append-only version ledger with dependency-aware rollback |
//! | [`pipeline`] | end-to-end orchestration and the monitor loop |

pub mod anomaly;
pub mod deployer;
pub mod generator;
pub mod miner;
pub mod pipeline;
pub mod regression;
pub mod version;

pub use anomaly::{detect_anomalies, Anomaly, AnomalyKind, GradingMetrics, Severity};
pub use deployer::{
    DeployError, Deployment, DeploymentStatus, HealthStatus, MetricsError, MetricsSource,
    MonitorReport, PatchDeployer,
};
pub use generator::{Enhancement, GeneratorError, PatchTarget, PatchType, PatchGenerator, RulePatch};
pub use miner::{FailurePattern, MiningSummary, OverrideLog, PatternMiner, PatternType};
pub use pipeline::{EvolutionPipeline, MonitorCheck, PatternOutcome, PipelineRun};
pub use regression::{
    EvalSample, EvalSet, Prediction, RegressionError, RegressionResult, RegressionTester,
    RuleSetEvaluator,
};
pub use version::{InMemoryLedger, VersionError, VersionLedger, VersionManager, VersionStatus};
