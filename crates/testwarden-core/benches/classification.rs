//! Benchmarks for the hot paths of a suite-level sweep and teardown.
//!
//! Targets:
//! - Classifying a 2k-process snapshot
//! - Planning a sweep over the same snapshot (classification + ancestry)
//! - Tearing down 1k registered resources in 100 trees

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use testwarden_core::config::WatchdogConfig;
use testwarden_core::process_scan::{ProcessRecord, ProcessSource, TerminationRequest};
use testwarden_core::{
    Affinity, Disposable, ProcessClassifier, ProcessWatchdog, ResourceRegistry, SharedResource,
    StepResult,
};

const SIGNATURES: &[&str] = &[
    "/usr/lib/systemd/systemd --user",
    "testhost --port 4100 --parentprocessid 1",
    "/opt/fleetmanager/FleetManager --headless",
    "/usr/bin/bash",
    "node /srv/app/server.js",
];

fn snapshot(size: u32) -> Vec<ProcessRecord> {
    (1..=size)
        .map(|pid| {
            let signature = SIGNATURES[pid as usize % SIGNATURES.len()];
            ProcessRecord::new(pid, Duration::from_secs(u64::from(pid % 600)))
                .with_parent(pid / 2)
                .with_signature(signature)
        })
        .collect()
}

struct StaticTable(Vec<ProcessRecord>);

impl ProcessSource for StaticTable {
    fn snapshot(&self) -> testwarden_core::Result<Vec<ProcessRecord>> {
        Ok(self.0.clone())
    }

    fn terminate(&self, _pid: u32) -> TerminationRequest {
        TerminationRequest::AlreadyGone
    }

    fn is_alive(&self, _pid: u32) -> bool {
        false
    }

    fn current_pid(&self) -> u32 {
        1
    }
}

struct Control(&'static str);

impl Disposable for Control {
    fn type_signature(&self) -> &str {
        self.0
    }

    fn dispose(&self) -> StepResult {
        Ok(())
    }
}

fn bench_classify(c: &mut Criterion) {
    let records = snapshot(2_000);
    let classifier = ProcessClassifier::from_config(&WatchdogConfig::default());
    c.bench_function("classification/classify_2k", |b| {
        b.iter(|| {
            for record in &records {
                black_box(classifier.classify(black_box(record), 1));
            }
        });
    });
}

fn bench_plan(c: &mut Criterion) {
    let config = WatchdogConfig::default();
    let watchdog = ProcessWatchdog::from_config(&config, Arc::new(StaticTable(snapshot(2_000))));
    let policy = *watchdog.policy();
    c.bench_function("classification/plan_2k", |b| {
        b.iter(|| black_box(watchdog.plan(&policy)));
    });
}

fn bench_teardown(c: &mut Criterion) {
    c.bench_function("teardown/1k_resources", |b| {
        b.iter_batched(
            || {
                let registry = ResourceRegistry::default();
                let mut held: Vec<SharedResource> = Vec::with_capacity(1_000);
                for _ in 0..100 {
                    let form: SharedResource = Arc::new(Control("MainForm"));
                    let Some(parent) = registry.register(&form, Affinity::Any) else {
                        continue;
                    };
                    held.push(form);
                    for _ in 0..9 {
                        let grid: SharedResource = Arc::new(Control("OrderGrid"));
                        registry.register_child(&grid, Affinity::Any, parent);
                        held.push(grid);
                    }
                }
                (registry, held)
            },
            |(registry, held)| {
                black_box(registry.teardown_all());
                drop(held);
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_classify, bench_plan, bench_teardown);
criterion_main!(benches);
