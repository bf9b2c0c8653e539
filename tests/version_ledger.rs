//! # Version ledger integration tests
//!
//! Dependency-aware rollback, idempotence and allocation uniqueness under
//! thread and task concurrency.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use grade_evolve::config::VersioningConfig;
use grade_evolve::evolve::{InMemoryLedger, VersionError, VersionManager, VersionStatus};

fn ledger_with_chain() -> VersionManager {
    let vm = VersionManager::in_memory();
    assert_eq!(vm.allocate_version().expect("test: v0"), "v1.0.0");
    assert_eq!(vm.allocate_version().expect("test: v1"), "v1.0.1");
    assert_eq!(
        vm.allocate_version_with_dependencies(&["v1.0.1".to_string()])
            .expect("test: v2"),
        "v1.0.2"
    );
    vm
}

#[test]
fn test_rollback_rejected_when_dependent_is_active() {
    let vm = ledger_with_chain();
    let err = vm.rollback_to_version("v1.0.0").unwrap_err();
    match err {
        VersionError::Dependency { version, dependent } => {
            assert_eq!(version, "v1.0.1");
            assert_eq!(dependent, "v1.0.2");
        }
        other => panic!("expected dependency error, got {other:?}"),
    }
    // Nothing was written.
    assert_eq!(vm.active_versions().expect("test: active").len(), 3);
}

#[test]
fn test_rollback_succeeds_after_dependent_removed_first() {
    let vm = ledger_with_chain();
    vm.mark_rolled_back("v1.0.2").expect("test: dependent first");
    let outcome = vm.rollback_to_version("v1.0.0").expect("test: rollback");
    assert!(outcome.changed);
    assert_eq!(outcome.rolled_back, vec!["v1.0.1".to_string(), "v1.0.2".to_string()]);
    assert_eq!(vm.active_versions().expect("test: active"), vec!["v1.0.0".to_string()]);
}

#[test]
fn test_rollback_twice_leaves_identical_state() {
    let vm = VersionManager::in_memory();
    for _ in 0..3 {
        vm.allocate_version().expect("test: allocate");
    }
    vm.rollback_to_version("v1.0.1").expect("test: first rollback");
    let after_first = vm.history().expect("test: history");
    let second = vm.rollback_to_version("v1.0.1").expect("test: second rollback");
    assert!(!second.changed);
    assert_eq!(vm.history().expect("test: history"), after_first);
    assert_eq!(
        vm.get("v1.0.2").expect("test: get").status,
        VersionStatus::RolledBack
    );
}

#[test]
fn test_rollback_to_unknown_version_is_validation_error() {
    let vm = VersionManager::in_memory();
    vm.allocate_version().expect("test: allocate");
    assert!(matches!(
        vm.rollback_to_version("v7.7.7"),
        Err(VersionError::VersionNotFound(_))
    ));
}

#[test]
fn test_allocation_after_rollback_never_reuses_a_version() {
    let vm = VersionManager::in_memory();
    for _ in 0..3 {
        vm.allocate_version().expect("test: allocate");
    }
    vm.rollback_to_version("v1.0.0").expect("test: rollback");
    assert_eq!(vm.allocate_version().expect("test: allocate"), "v1.0.3");
}

#[test]
fn test_concurrent_thread_allocation_is_unique() {
    let ledger = Arc::new(InMemoryLedger::new());
    let config = VersioningConfig {
        max_allocation_attempts: 10_000,
        ..VersioningConfig::default()
    };
    let vm = VersionManager::new(ledger, config);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let vm = vm.clone();
            thread::spawn(move || {
                (0..50)
                    .map(|_| vm.allocate_version().expect("test: allocate"))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.join().expect("test: join"));
    }
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 400);
    assert_eq!(unique.len(), 400, "every allocated version must be distinct");
    assert_eq!(vm.history().expect("test: history").len(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_task_allocation_is_unique() {
    let config = VersioningConfig {
        max_allocation_attempts: 10_000,
        ..VersioningConfig::default()
    };
    let vm = VersionManager::new(Arc::new(InMemoryLedger::new()), config);

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let vm = vm.clone();
            tokio::spawn(async move { vm.allocate_version() })
        })
        .collect();

    let mut seen = HashSet::new();
    for t in tasks {
        let v = t.await.expect("test: join").expect("test: allocate");
        assert!(seen.insert(v), "duplicate version allocated");
    }
    assert_eq!(seen.len(), 32);
}
