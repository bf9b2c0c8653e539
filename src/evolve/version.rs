//! # Version Manager
//!
//! ## Responsibility
//! Allocate globally unique semantic versions (`v<major>.<minor>.<patch>`) for
//! rule patches, record which versions depend on which, and roll the ledger
//! back to an earlier version without breaking live dependencies.
//!
//! ## Guarantees
//! - Linearizable allocation: every mutation is a compare-and-set against the
//!   ledger revision, so concurrent allocators never return the same version
//! - Append-only: records are never deleted; "rolled back" is a status flag
//! - Atomic rollback: a rollback set is committed as one ledger update or not
//!   at all
//! - Idempotent: repeating a successful rollback leaves the ledger unchanged
//!
//! ## NOT Responsible For
//! - Deciding *when* to roll back (see `deployer`)
//! - Durable persistence (plug a store in through [`VersionLedger`])

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::VersioningConfig;
use crate::metrics;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced by the version manager and its ledger.
#[derive(Debug, Error)]
pub enum VersionError {
    /// An internal lock was poisoned by a panicking thread.
    #[error("version ledger lock poisoned")]
    LockPoisoned,

    /// The requested version has never been allocated.
    #[error("version {0} not found")]
    VersionNotFound(String),

    /// The string is not of the form `v<major>.<minor>.<patch>`.
    #[error("invalid version string '{0}'")]
    InvalidVersion(String),

    /// Rolling back `version` would strand an active version that requires it.
    #[error("cannot roll back {version}: active version {dependent} depends on it")]
    Dependency {
        /// The version that was about to be rolled back.
        version: String,
        /// The still-active version that declares a dependency on it.
        dependent: String,
    },

    /// The declared dependency is not allowed (self, or not strictly older).
    #[error("invalid dependency {version} -> {depends_on}: {reason}")]
    InvalidDependency {
        /// The dependent version.
        version: String,
        /// The version it tried to depend on.
        depends_on: String,
        /// Why the edge was rejected.
        reason: String,
    },

    /// Reactivating `version` would leave it running without a version it
    /// requires.
    #[error("cannot reactivate {version}: it depends on rolled-back version {depends_on}")]
    InactiveDependency {
        /// The version that was about to be reactivated.
        version: String,
        /// Its dependency that is no longer active.
        depends_on: String,
    },

    /// The ledger already holds this version string.
    #[error("version {0} already exists in the ledger")]
    DuplicateVersion(String),

    /// Too many concurrent writers; the compare-and-set never won.
    #[error("version allocation lost the ledger race {attempts} times")]
    AllocationContention {
        /// How many compare-and-set attempts were made.
        attempts: u32,
    },
}

// ---------------------------------------------------------------------------
// SemVer
// ---------------------------------------------------------------------------

/// A parsed `v<major>.<minor>.<patch>` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemVer {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
    /// Patch component, bumped on every allocation.
    pub patch: u32,
}

impl SemVer {
    /// Build a version from its components.
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// The next patch-level version.
    pub fn bump_patch(self) -> Self {
        Self {
            patch: self.patch.saturating_add(1),
            ..self
        }
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SemVer {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionError::InvalidVersion(s.to_string());
        let body = s.strip_prefix('v').ok_or_else(invalid)?;
        let mut parts = body.split('.');
        let mut next = || -> Result<u32, VersionError> {
            parts
                .next()
                .and_then(|p| p.parse::<u32>().ok())
                .ok_or_else(invalid)
        };
        let version = SemVer::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Lifecycle status of an allocated version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    /// The version is live (or eligible to be).
    Active,
    /// The version was rolled back; kept for audit.
    RolledBack,
}

/// One entry in the append-only version ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Position in the ledger arena; strictly increasing with allocation order.
    pub index: u64,
    /// The version string, e.g. `v1.0.3`.
    pub version: String,
    /// When the version was allocated.
    pub created_at: DateTime<Utc>,
    /// Current status.
    pub status: VersionStatus,
    /// Versions that must stay active for this one to work.
    pub dependencies: BTreeSet<String>,
}

impl VersionRecord {
    fn is_active(&self) -> bool {
        self.status == VersionStatus::Active
    }
}

/// A consistent read of the ledger at one revision.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    /// Revision counter; bumped by every successful mutation.
    pub revision: u64,
    /// All records, oldest first.
    pub records: Vec<VersionRecord>,
}

impl LedgerSnapshot {
    fn find(&self, version: &str) -> Option<&VersionRecord> {
        self.records.iter().find(|r| r.version == version)
    }
}

// ---------------------------------------------------------------------------
// Ledger trait
// ---------------------------------------------------------------------------

/// Transactional store backing the [`VersionManager`].
///
/// Every write takes the revision the caller read and fails (returns
/// `Ok(false)`) if the ledger moved on in the meantime. Writes are
/// all-or-nothing.
pub trait VersionLedger: Send + Sync {
    /// Read every record together with the current revision.
    fn snapshot(&self) -> Result<LedgerSnapshot, VersionError>;

    /// Append `record` if the ledger is still at `expected_revision`.
    ///
    /// Returns [`VersionError::DuplicateVersion`] if the version string is
    /// already present.
    fn append(&self, expected_revision: u64, record: VersionRecord) -> Result<bool, VersionError>;

    /// Apply every status update if the ledger is still at `expected_revision`.
    fn update_statuses(
        &self,
        expected_revision: u64,
        updates: &[(String, VersionStatus)],
    ) -> Result<bool, VersionError>;

    /// Add `depends_on` to `version`'s dependency set if the ledger is still
    /// at `expected_revision`.
    fn add_dependency(
        &self,
        expected_revision: u64,
        version: &str,
        depends_on: &str,
    ) -> Result<bool, VersionError>;
}

struct LedgerState {
    revision: u64,
    records: Vec<VersionRecord>,
}

/// In-process [`VersionLedger`] guarded by a single mutex.
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                revision: 0,
                records: Vec::new(),
            }),
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("InMemoryLedger");
        if let Ok(state) = self.state.lock() {
            dbg.field("revision", &state.revision)
                .field("record_count", &state.records.len());
        }
        dbg.finish()
    }
}

impl VersionLedger for InMemoryLedger {
    fn snapshot(&self) -> Result<LedgerSnapshot, VersionError> {
        let state = self.state.lock().map_err(|_| VersionError::LockPoisoned)?;
        Ok(LedgerSnapshot {
            revision: state.revision,
            records: state.records.clone(),
        })
    }

    fn append(&self, expected_revision: u64, record: VersionRecord) -> Result<bool, VersionError> {
        let mut state = self.state.lock().map_err(|_| VersionError::LockPoisoned)?;
        if state.revision != expected_revision {
            return Ok(false);
        }
        if state.records.iter().any(|r| r.version == record.version) {
            return Err(VersionError::DuplicateVersion(record.version));
        }
        state.records.push(record);
        state.revision += 1;
        Ok(true)
    }

    fn update_statuses(
        &self,
        expected_revision: u64,
        updates: &[(String, VersionStatus)],
    ) -> Result<bool, VersionError> {
        let mut state = self.state.lock().map_err(|_| VersionError::LockPoisoned)?;
        if state.revision != expected_revision {
            return Ok(false);
        }
        // Resolve every target before touching any record.
        let mut positions = Vec::with_capacity(updates.len());
        for (version, status) in updates {
            let pos = state
                .records
                .iter()
                .position(|r| &r.version == version)
                .ok_or_else(|| VersionError::VersionNotFound(version.clone()))?;
            positions.push((pos, *status));
        }
        for (pos, status) in positions {
            state.records[pos].status = status;
        }
        state.revision += 1;
        Ok(true)
    }

    fn add_dependency(
        &self,
        expected_revision: u64,
        version: &str,
        depends_on: &str,
    ) -> Result<bool, VersionError> {
        let mut state = self.state.lock().map_err(|_| VersionError::LockPoisoned)?;
        if state.revision != expected_revision {
            return Ok(false);
        }
        let record = state
            .records
            .iter_mut()
            .find(|r| r.version == version)
            .ok_or_else(|| VersionError::VersionNotFound(version.to_string()))?;
        record.dependencies.insert(depends_on.to_string());
        state.revision += 1;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Rollback outcome
// ---------------------------------------------------------------------------

/// What a successful [`VersionManager::rollback_to_version`] did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    /// The version that is now the active head.
    pub target_version: String,
    /// Every version created after the target, now marked rolled back.
    pub rolled_back: Vec<String>,
    /// Whether any record actually changed status.
    pub changed: bool,
}

// ---------------------------------------------------------------------------
// VersionManager
// ---------------------------------------------------------------------------

/// Allocates and rolls back patch versions over an explicit ledger handle.
///
/// Cheaply cloneable; clones share the same ledger.
#[derive(Clone)]
pub struct VersionManager {
    ledger: Arc<dyn VersionLedger>,
    config: VersioningConfig,
}

impl fmt::Debug for VersionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl VersionManager {
    /// Create a manager over the given ledger.
    pub fn new(ledger: Arc<dyn VersionLedger>, config: VersioningConfig) -> Self {
        Self { ledger, config }
    }

    /// Create a manager over a fresh [`InMemoryLedger`] with default settings.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryLedger::new()), VersioningConfig::default())
    }

    /// Allocate the next version with no dependencies.
    ///
    /// The first allocation on an empty ledger yields `v<major>.<minor>.0`
    /// (`v1.0.0` by default); each later one bumps the patch component of the
    /// most recently allocated version, regardless of its status.
    ///
    /// # Errors
    /// - [`VersionError::AllocationContention`] if the compare-and-set loses
    ///   `max_allocation_attempts` times in a row.
    /// - [`VersionError::LockPoisoned`] if the ledger lock is poisoned.
    pub fn allocate_version(&self) -> Result<String, VersionError> {
        self.allocate_version_with_dependencies(&[])
    }

    /// Allocate the next version, declaring the versions it requires.
    ///
    /// # Errors
    /// - [`VersionError::VersionNotFound`] if a dependency was never allocated.
    /// - Same as [`allocate_version`](Self::allocate_version) otherwise.
    pub fn allocate_version_with_dependencies(
        &self,
        dependencies: &[String],
    ) -> Result<String, VersionError> {
        let attempts = self.config.max_allocation_attempts.max(1);
        for _ in 0..attempts {
            let snap = self.ledger.snapshot()?;
            for dep in dependencies {
                if snap.find(dep).is_none() {
                    return Err(VersionError::VersionNotFound(dep.clone()));
                }
            }

            let next = match snap.records.last() {
                Some(last) => last.version.parse::<SemVer>()?.bump_patch(),
                None => SemVer::new(self.config.major, self.config.minor, 0),
            };
            let version = next.to_string();
            let record = VersionRecord {
                index: snap.records.len() as u64,
                version: version.clone(),
                created_at: Utc::now(),
                status: VersionStatus::Active,
                dependencies: dependencies.iter().cloned().collect(),
            };

            if self.ledger.append(snap.revision, record)? {
                info!(version = %version, dependencies = dependencies.len(), "version allocated");
                metrics::inc_versions_allocated();
                return Ok(version);
            }
            debug!(version = %version, "ledger moved during allocation, retrying");
        }

        warn!(attempts, "version allocation contention");
        Err(VersionError::AllocationContention { attempts })
    }

    /// Declare that `version` requires `depends_on` to stay active.
    ///
    /// # Errors
    /// - [`VersionError::VersionNotFound`] if either version is unknown.
    /// - [`VersionError::InvalidDependency`] for self-edges or edges pointing
    ///   at a newer version (which would allow cycles).
    pub fn add_dependency(&self, version: &str, depends_on: &str) -> Result<(), VersionError> {
        let attempts = self.config.max_allocation_attempts.max(1);
        for _ in 0..attempts {
            let snap = self.ledger.snapshot()?;
            let dependent = snap
                .find(version)
                .ok_or_else(|| VersionError::VersionNotFound(version.to_string()))?;
            let required = snap
                .find(depends_on)
                .ok_or_else(|| VersionError::VersionNotFound(depends_on.to_string()))?;
            if required.index >= dependent.index {
                return Err(VersionError::InvalidDependency {
                    version: version.to_string(),
                    depends_on: depends_on.to_string(),
                    reason: "a version may only depend on strictly older versions".to_string(),
                });
            }
            if self
                .ledger
                .add_dependency(snap.revision, version, depends_on)?
            {
                return Ok(());
            }
        }
        Err(VersionError::AllocationContention { attempts })
    }

    /// Roll the ledger back so that `target_version` is the active head.
    ///
    /// The rollback set is every version created strictly after the target.
    /// Before anything is written, each member of the set is checked for
    /// active dependents; an active dependent blocks the rollback even when
    /// it is itself a member of the set, so dependents must be rolled back
    /// first. Rolled-back dependents never block.
    ///
    /// # Errors
    /// - [`VersionError::VersionNotFound`] if the target was never allocated.
    /// - [`VersionError::Dependency`] naming the first conflicting dependent.
    /// - [`VersionError::InactiveDependency`] if the target itself requires a
    ///   version that is no longer active.
    pub fn rollback_to_version(&self, target_version: &str) -> Result<RollbackOutcome, VersionError> {
        let attempts = self.config.max_allocation_attempts.max(1);
        for _ in 0..attempts {
            let snap = self.ledger.snapshot()?;
            let target = snap
                .find(target_version)
                .ok_or_else(|| VersionError::VersionNotFound(target_version.to_string()))?;

            let rollback_set: Vec<&VersionRecord> = snap
                .records
                .iter()
                .filter(|r| r.index > target.index)
                .collect();

            for member in &rollback_set {
                if let Some(dependent) = active_dependent(&snap, &member.version) {
                    warn!(
                        version = %member.version,
                        dependent = %dependent,
                        "rollback blocked by dependency"
                    );
                    return Err(VersionError::Dependency {
                        version: member.version.clone(),
                        dependent: dependent.to_string(),
                    });
                }
            }

            if let Some(missing) = target
                .dependencies
                .iter()
                .find(|d| !snap.find(d).is_some_and(VersionRecord::is_active))
            {
                warn!(
                    target = %target_version,
                    depends_on = %missing,
                    "rollback target requires an inactive version"
                );
                return Err(VersionError::InactiveDependency {
                    version: target_version.to_string(),
                    depends_on: missing.clone(),
                });
            }

            let changed = !target.is_active() || rollback_set.iter().any(|r| r.is_active());
            let rolled_back: Vec<String> =
                rollback_set.iter().map(|r| r.version.clone()).collect();

            if !changed {
                return Ok(RollbackOutcome {
                    target_version: target_version.to_string(),
                    rolled_back,
                    changed: false,
                });
            }

            let mut updates: Vec<(String, VersionStatus)> = rolled_back
                .iter()
                .map(|v| (v.clone(), VersionStatus::RolledBack))
                .collect();
            updates.push((target_version.to_string(), VersionStatus::Active));

            if self.ledger.update_statuses(snap.revision, &updates)? {
                info!(
                    target = %target_version,
                    rolled_back = rolled_back.len(),
                    "ledger rolled back"
                );
                metrics::inc_rollback("ledger");
                return Ok(RollbackOutcome {
                    target_version: target_version.to_string(),
                    rolled_back,
                    changed: true,
                });
            }
        }
        Err(VersionError::AllocationContention { attempts })
    }

    /// Mark a single version rolled back (used when a canary fails).
    ///
    /// Idempotent: marking an already rolled-back version succeeds without
    /// writing.
    ///
    /// # Errors
    /// - [`VersionError::VersionNotFound`] if the version is unknown.
    /// - [`VersionError::Dependency`] if an active version depends on it.
    pub fn mark_rolled_back(&self, version: &str) -> Result<(), VersionError> {
        let attempts = self.config.max_allocation_attempts.max(1);
        for _ in 0..attempts {
            let snap = self.ledger.snapshot()?;
            let record = snap
                .find(version)
                .ok_or_else(|| VersionError::VersionNotFound(version.to_string()))?;
            if !record.is_active() {
                return Ok(());
            }
            if let Some(dependent) = active_dependent(&snap, version) {
                return Err(VersionError::Dependency {
                    version: version.to_string(),
                    dependent: dependent.to_string(),
                });
            }
            let updates = [(version.to_string(), VersionStatus::RolledBack)];
            if self.ledger.update_statuses(snap.revision, &updates)? {
                info!(version = %version, "version marked rolled back");
                return Ok(());
            }
        }
        Err(VersionError::AllocationContention { attempts })
    }

    /// Look up one record.
    ///
    /// # Errors
    /// Returns [`VersionError::VersionNotFound`] if the version is unknown.
    pub fn get(&self, version: &str) -> Result<VersionRecord, VersionError> {
        self.ledger
            .snapshot()?
            .find(version)
            .cloned()
            .ok_or_else(|| VersionError::VersionNotFound(version.to_string()))
    }

    /// Full ledger history, oldest first.
    pub fn history(&self) -> Result<Vec<VersionRecord>, VersionError> {
        Ok(self.ledger.snapshot()?.records)
    }

    /// Versions currently marked active, oldest first.
    pub fn active_versions(&self) -> Result<Vec<String>, VersionError> {
        Ok(self
            .ledger
            .snapshot()?
            .records
            .into_iter()
            .filter(VersionRecord::is_active)
            .map(|r| r.version)
            .collect())
    }

    /// The most recently allocated version, if any.
    pub fn latest_version(&self) -> Result<Option<String>, VersionError> {
        Ok(self.ledger.snapshot()?.records.pop().map(|r| r.version))
    }
}

/// First active version (other than `version` itself) that depends on `version`.
fn active_dependent<'a>(snap: &'a LedgerSnapshot, version: &str) -> Option<&'a str> {
    snap.records
        .iter()
        .find(|r| r.version != version && r.is_active() && r.dependencies.contains(version))
        .map(|r| r.version.as_str())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
