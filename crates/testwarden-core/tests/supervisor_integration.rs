//! Suite lifecycle and per-unit deadline supervision, end to end.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeProcessSource, FixedMemory, RecordingResource, SELF_PID, disposed_names, journal};
use testwarden_core::config::Config;
use testwarden_core::supervisor::UnitState;
use testwarden_core::{Affinity, SuiteContext, UnitOutcome};

fn quiet_config() -> Config {
    let mut config = Config::default();
    config.watchdog.interval_secs = 0;
    config.watchdog.max_wait_ms = 100;
    config.cleanup.enabled = false;
    config
}

async fn start(config: Config, source: &FakeProcessSource) -> SuiteContext {
    SuiteContext::start_with(config, Arc::new(source.clone()), Arc::new(FixedMemory(Some(10.0)))).await
}

#[tokio::test(start_paused = true)]
async fn suite_start_reaps_leftovers_from_earlier_runs() {
    let source = FakeProcessSource::new();
    source
        .spawn(SELF_PID, 5, "testhost --current")
        .spawn(300, 3_600, "testhost --previous-run")
        .spawn(301, 3_600, "/usr/bin/postgres");

    let suite = start(quiet_config(), &source).await;
    let start_sweep = suite.start_sweep().unwrap();
    assert_eq!(start_sweep.terminated_pids, vec![300]);
    assert_eq!(source.terminated(), vec![300]);
    suite.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn timed_out_unit_forces_teardown_and_sweep() {
    let source = FakeProcessSource::new();
    let suite = start(quiet_config(), &source).await;
    let log = journal();

    let form = RecordingResource::shared("form", "MainForm", &log);
    let grid = RecordingResource::shared("grid", "OrderGrid", &log);
    let registry = Arc::clone(suite.registry());
    let form_id = registry.register(&form, Affinity::Any).unwrap();
    registry.register_child(&grid, Affinity::Any, form_id).unwrap();

    // A build/run child that the hung unit leaked.
    source.spawn(400, 120, "/opt/fleetmanager/FleetManager --test");

    let outcome = suite
        .run_unit_with("orders::hangs", Duration::from_secs(300), std::future::pending::<()>())
        .await;

    let UnitOutcome::TimedOut(Some(cleanup)) = outcome else {
        panic!("unit should have timed out with a cleanup report");
    };
    assert_eq!(cleanup.teardown.disposed.len(), 2);
    assert_eq!(disposed_names(&log), vec!["grid", "form"]);
    let sweep = cleanup.sweep.unwrap();
    assert_eq!(sweep.terminated_pids, vec![400]);

    let report = suite.shutdown().await;
    assert_eq!(report.teardown.unwrap().events(), 0);
}

#[tokio::test(start_paused = true)]
async fn completed_unit_cancels_its_deadline() {
    let source = FakeProcessSource::new();
    let suite = start(quiet_config(), &source).await;
    let log = journal();
    let form = RecordingResource::shared("form", "MainForm", &log);
    let registry = Arc::clone(suite.registry());

    let outcome = suite
        .run_unit_with("orders::fast", Duration::from_secs(300), async {
            registry.register(&form, Affinity::Any).unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            7
        })
        .await;
    assert_eq!(outcome, UnitOutcome::Completed(7));
    assert_eq!(disposed_names(&log), vec!["form"]);

    // Long after the deadline, nothing else happens.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(disposed_names(&log), vec!["form"]);
    suite.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn manual_supervision_reports_state() {
    let source = FakeProcessSource::new();
    let suite = start(quiet_config(), &source).await;

    let fast = suite.supervise_with("manual::fast", Duration::from_secs(60));
    assert_eq!(fast.state(), UnitState::Armed);
    assert!(fast.complete());
    assert_eq!(fast.state(), UnitState::Completed);

    let slow = suite.supervise_with("manual::slow", Duration::from_secs(60));
    slow.aborted().await;
    assert_eq!(slow.state(), UnitState::TimedOut);
    assert!(!slow.complete());
    assert!(slow.forced_cleanup().is_some());

    fast.join().await;
    slow.join().await;
    suite.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disabled_watchdog_skips_sweeps() {
    let source = FakeProcessSource::new();
    source.spawn(500, 3_600, "testhost --previous-run");
    let mut config = quiet_config();
    config.watchdog.enabled = false;

    let suite = start(config, &source).await;
    assert!(suite.start_sweep().is_none());
    assert!(suite.watchdog().is_none());

    let report = suite.shutdown().await;
    assert!(report.end_sweep.is_none());
    assert!(source.terminated().is_empty());
}
