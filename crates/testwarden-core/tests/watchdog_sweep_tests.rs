//! End-to-end watchdog sweeps against a scripted process table.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeProcessSource, SELF_PID};
use testwarden_core::config::WatchdogConfig;
use testwarden_core::process_scan::ProcessRecord;
use testwarden_core::process_watchdog::{Kinship, SweepPolicy, spawn_sweeper, sweep_blocking};
use testwarden_core::{LaunchKind, ProcessClassification, ProcessWatchdog};

const WAIT: Duration = Duration::from_millis(200);

fn watchdog(source: &FakeProcessSource) -> ProcessWatchdog {
    ProcessWatchdog::from_config(&WatchdogConfig::default(), Arc::new(source.clone()))
}

#[test]
fn only_strictly_stale_test_processes_are_selected() {
    let source = FakeProcessSource::new();
    source
        .spawn(SELF_PID, 999, "testhost --run suite")
        .spawn(2, 29, "testhost --port 4100")
        .spawn(3, 31, "testhost --port 4101");

    let summary = watchdog(&source).sweep(Duration::from_secs(30), WAIT);

    assert_eq!(summary.scanned, 3);
    assert_eq!(summary.by_class.self_process, 1);
    assert_eq!(summary.by_class.known_test, 2);
    assert_eq!(summary.selected, 1);
    assert_eq!(summary.terminated_pids, vec![3]);
    assert_eq!(source.terminated(), vec![3]);
}

#[test]
fn age_equal_to_threshold_is_not_stale() {
    let source = FakeProcessSource::new();
    source.spawn(7, 30, "testhost");
    let summary = watchdog(&source).sweep(Duration::from_secs(30), WAIT);
    assert_eq!(summary.selected, 0);
    assert!(source.terminated().is_empty());
}

#[test]
fn foreign_and_unknown_processes_are_never_touched() {
    let source = FakeProcessSource::new();
    source
        .spawn(10, 86_400, "/usr/sbin/sshd -D")
        .insert(ProcessRecord::new(11, Duration::from_secs(86_400)));

    let summary = watchdog(&source).sweep(Duration::ZERO, WAIT);
    assert_eq!(summary.by_class.foreign, 1);
    assert_eq!(summary.by_class.unknown, 1);
    assert_eq!(summary.selected, 0);
    assert!(source.terminated().is_empty());
}

#[test]
fn launch_kind_picks_the_age_threshold() {
    let source = FakeProcessSource::new();
    source
        .spawn(20, 45, "/opt/fleet-manager/bin/FleetManager --headless")
        .spawn(21, 45, "testhost --port 4102")
        .insert(
            ProcessRecord::new(22, Duration::from_secs(45))
                .with_signature("/usr/bin/node server.js")
                .with_owning_test("orders::grid_roundtrip"),
        );

    let wd = watchdog(&source);
    let plan = wd.plan(wd.policy()).unwrap();
    let selected: Vec<(u32, ProcessClassification)> = plan
        .selected
        .iter()
        .map(|p| (p.record.pid, p.classification))
        .collect();
    assert_eq!(
        selected,
        vec![
            (20, ProcessClassification::KnownTest(LaunchKind::BuildRun)),
            (22, ProcessClassification::KnownTest(LaunchKind::BuildRun)),
        ]
    );
    // Planning terminates nothing.
    assert!(source.terminated().is_empty());
}

#[test]
fn ancestors_of_the_test_process_are_protected() {
    let source = FakeProcessSource::new();
    source
        .spawn(50, 5_000, "testhost --parent")
        .insert(
            ProcessRecord::new(SELF_PID, Duration::from_secs(60))
                .with_parent(50)
                .with_signature("testhost --child"),
        )
        .spawn(51, 5_000, "testhost --sibling");

    let wd = watchdog(&source);
    let classified = wd.scan().unwrap();
    assert!(
        classified
            .iter()
            .any(|p| p.record.pid == 50 && p.kinship == Some(Kinship::Ancestor))
    );

    let summary = wd.sweep(Duration::from_secs(1), WAIT);
    assert_eq!(summary.terminated_pids, vec![51]);

    let unprotected = SweepPolicy {
        protect_ancestors: false,
        ..SweepPolicy::uniform(Duration::from_secs(1), WAIT)
    };
    let plan = wd.plan(&unprotected).unwrap();
    assert!(plan.selected.iter().any(|p| p.record.pid == 50));
}

#[test]
fn children_of_the_test_process_are_never_swept() {
    let source = FakeProcessSource::new();
    source
        .spawn(SELF_PID, 60, "testhost --run suite")
        .insert(
            ProcessRecord::new(77, Duration::from_secs(45))
                .with_parent(SELF_PID)
                .with_signature("fleet-manager --headless"),
        )
        .insert(
            ProcessRecord::new(78, Duration::from_secs(45))
                .with_parent(77)
                .with_owning_test("orders::grid_roundtrip"),
        )
        .spawn(79, 45, "fleet-manager --headless");

    let wd = watchdog(&source);
    let summary = wd.sweep_with_policy(wd.policy());

    assert_eq!(summary.terminated_pids, vec![79]);
    assert_eq!(source.terminated(), vec![79]);

    // Even with ancestor protection off, the run's own children stay.
    let plan = wd
        .plan(&SweepPolicy {
            protect_ancestors: false,
            ..SweepPolicy::uniform(Duration::ZERO, WAIT)
        })
        .unwrap();
    let selected: Vec<u32> = plan.selected.iter().map(|p| p.record.pid).collect();
    assert!(!selected.contains(&77));
    assert!(!selected.contains(&78));
}

#[test]
fn stubborn_process_is_reported_as_timed_out() {
    let source = FakeProcessSource::new();
    source
        .spawn(60, 120, "testhost --hung")
        .spawn(61, 120, "testhost --polite")
        .make_stubborn(60);

    let summary = watchdog(&source).sweep(Duration::from_secs(30), Duration::from_millis(100));
    assert_eq!(summary.timed_out_pids, vec![60]);
    assert_eq!(summary.terminated_pids, vec![61]);
    assert_eq!(summary.selected, 2);
}

#[test]
fn scan_failure_is_reported_not_raised() {
    let source = FakeProcessSource::new();
    source.spawn(70, 120, "testhost").fail_snapshots();

    let wd = watchdog(&source);
    assert!(wd.scan().is_err());
    let summary = wd.sweep(Duration::from_secs(1), WAIT);
    assert_eq!(summary.scanned, 0);
    assert_eq!(summary.errors.len(), 1);
    assert!(source.terminated().is_empty());
}

#[tokio::test]
async fn blocking_sweep_runs_off_the_runtime() {
    let source = FakeProcessSource::new();
    source.spawn(80, 400, "testhost");
    let wd = Arc::new(watchdog(&source));
    let policy = *wd.policy();

    let summary = sweep_blocking(Arc::clone(&wd), policy).await;
    assert_eq!(summary.terminated_pids, vec![80]);

    let again = sweep_blocking(wd, policy).await;
    assert_eq!(again.scanned, 0);
}

#[tokio::test(start_paused = true)]
async fn periodic_sweeper_reaps_on_interval() {
    let source = FakeProcessSource::new();
    source.spawn(90, 400, "testhost");
    let wd = Arc::new(watchdog(&source));

    let handle = spawn_sweeper(wd, Duration::from_secs(60));
    tokio::time::sleep(Duration::from_secs(61)).await;
    for _ in 0..50 {
        if !source.terminated().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(source.terminated(), vec![90]);
    handle.signal_shutdown();
    handle.abort();
    handle.join().await;
}
