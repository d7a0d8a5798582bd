//! Benchmarks for Fit Index scoring, admission and ledger appends.
use autoapply_core::admission::{admit, AutoApplyConfig};
use autoapply_core::ledger::{CreditLedger, CreditType};
use autoapply_core::models::{CandidateProfile, JobPosting};
use autoapply_core::scoring::FitIndexScorer;
use autoapply_core::store::MemoryStore;
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

fn candidate(skills: usize) -> CandidateProfile {
    let pool = ["python", "sql", "aws", "k8s", "postgres", "react", "js", "go", "rust", "gcp", "terraform", "kafka"];
    CandidateProfile::new("bench")
        .with_skills(pool.iter().cycle().take(skills).copied())
        .with_experience(6.0)
        .with_seniority("Senior Engineer")
}

fn posting(required: usize) -> JobPosting {
    let pool = ["Python", "PostgreSQL", "Amazon Web Services", "Kubernetes", "React.js", "Golang", "Kafka", "Terraform"];
    JobPosting::new("bench-job")
        .with_required_skills(pool.iter().cycle().take(required).copied())
        .with_preferred_skills(["javascript", "gcp"])
        .with_experience_range(Some(5.0), Some(8.0))
        .with_seniority("senior")
}

fn bench_fit_index_score(c: &mut Criterion) {
    let mut group = c.benchmark_group("fit_index_score");
    let scorer = FitIndexScorer::new();
    for (label, skills, required) in [("small", 3, 2), ("medium", 8, 5), ("large", 12, 8)] {
        let inputs = (candidate(skills), posting(required));
        group.bench_with_input(BenchmarkId::from_parameter(label), &inputs, |b, (c, p)| {
            b.iter(|| black_box(scorer.score(c, p, Some(0.6))));
        });
    }
    group.finish();
}

fn bench_fit_index_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("fit_index_batch");
    let scorer = FitIndexScorer::new();
    let profile = candidate(8);
    let postings: Vec<JobPosting> = (1..=8).map(posting).collect();
    for batch_size in [50, 500] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &n| {
            b.iter(|| {
                for i in 0..n {
                    black_box(scorer.score(&profile, &postings[i % postings.len()], None));
                }
            });
        });
    }
    group.finish();
}

fn bench_admission(c: &mut Criterion) {
    let scorer = FitIndexScorer::new();
    let config = AutoApplyConfig::new("bench").enabled(true).with_min_fit_score(70);
    let p = posting(5);
    let fit = scorer.score(&candidate(8), &p, Some(0.5));
    let now = Utc::now();
    c.bench_function("admission_decision", |b| b.iter(|| black_box(admit(&config, &p, &fit, now))));
}

fn bench_ledger_deduct(c: &mut Criterion) {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(_) => return,
    };
    let ledger = CreditLedger::new(Arc::new(MemoryStore::new()));
    runtime.block_on(async {
        let _ = ledger.add("bench", CreditType::AutoApply, i64::MAX / 2, "bench grant", None).await;
    });

    let mut counter = 0u64;
    c.bench_function("ledger_deduct", |b| {
        b.to_async(&runtime).iter(|| {
            counter += 1;
            let reference = format!("job-{}", counter);
            let ledger = ledger.clone();
            async move {
                black_box(
                    ledger
                        .deduct("bench", CreditType::AutoApply, 1, "bench", Some(&reference))
                        .await,
                )
            }
        });
    });
}

criterion_group!(benches, bench_fit_index_score, bench_fit_index_batch, bench_admission, bench_ledger_deduct);
criterion_main!(benches);
