//! Miner and regression benchmarks.
//!
//! Mining runs over whole override batches on every pipeline pass, so it
//! should stay linear in the batch size.

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;

use grade_evolve::evolve::{
    EvalSample, EvalSet, OverrideLog, PatternMiner, Prediction, RegressionTester, VersionManager,
};

fn mixed_batch(n: usize) -> Vec<OverrideLog> {
    (0..n)
        .map(|i| {
            let (extracted, conf, rules, matched) = match i % 4 {
                0 => (Some(String::new()), 0.2, Vec::new(), None),
                1 => (
                    Some("5 km".to_string()),
                    0.9,
                    vec!["trim".to_string(), "unit_conversion".to_string()],
                    Some(false),
                ),
                2 => (Some("photo synthesis".to_string()), 0.9, Vec::new(), Some(false)),
                _ => (Some("a long answer".to_string()), 0.9, Vec::new(), Some(true)),
            };
            OverrideLog {
                log_id: format!("log-{i}"),
                question_id: format!("q{}", i % 17),
                question_type: Some(format!("type-{}", i % 3)),
                extracted_answer: extracted,
                extraction_confidence: conf,
                normalized_answer: None,
                normalization_rules_applied: rules,
                match_result: matched,
                match_failure_reason: Some("synonym not recognised".to_string()),
                score: 1.0,
                confidence: 0.8,
                was_overridden: true,
                override_score: Some(3.0),
                override_reason: Some("fixed deduction applied twice".to_string()),
                created_at: Utc::now(),
                overridden_at: None,
            }
        })
        .collect()
}

fn bench_analyze_overrides(c: &mut Criterion) {
    let miner = PatternMiner::default();
    let mut group = c.benchmark_group("analyze_overrides");
    for size in [100usize, 1_000, 10_000] {
        let logs = mixed_batch(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &logs, |b, logs| {
            b.iter(|| black_box(miner.analyze_overrides(black_box(logs))))
        });
    }
    group.finish();
}

fn bench_regression_compare(c: &mut Criterion) {
    let tester = RegressionTester::default();
    let set = EvalSet {
        name: "bench".to_string(),
        samples: (0..5_000)
            .map(|i| EvalSample {
                sample_id: format!("s{i}"),
                ground_truth_score: 3.0,
                max_score: 5.0,
            })
            .collect(),
    };
    let preds = |wrong_every: usize| -> Vec<Prediction> {
        set.samples
            .iter()
            .enumerate()
            .map(|(i, s)| Prediction {
                sample_id: s.sample_id.clone(),
                predicted_score: if i % wrong_every == 0 { 0.0 } else { 3.0 },
                confidence: 0.9,
            })
            .collect()
    };
    let (old, new) = (preds(5), preds(20));

    c.bench_function("regression_compare_5000", |b| {
        b.iter(|| black_box(tester.compare("bench", &set, black_box(&old), black_box(&new))))
    });
}

fn bench_version_allocation(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");

    c.bench_function("allocate_version_concurrent_8", |b| {
        b.to_async(&rt).iter(|| async {
            let vm = VersionManager::in_memory();
            let tasks: Vec<_> = (0..8)
                .map(|_| {
                    let vm = vm.clone();
                    tokio::spawn(async move { vm.allocate_version() })
                })
                .collect();
            for t in tasks {
                let _ = black_box(t.await);
            }
        })
    });
}

criterion_group!(
    benches,
    bench_analyze_overrides,
    bench_regression_compare,
    bench_version_allocation
);
criterion_main!(benches);
