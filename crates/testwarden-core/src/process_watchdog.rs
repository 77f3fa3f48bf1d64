//! Orphan process watchdog.
//!
//! A sweep enumerates processes through a [`ProcessSource`], classifies each
//! one, and terminates the known-test processes older than the policy
//! threshold for their launch kind. Nothing about a sweep is fatal: failures
//! and timeouts land in the [`SweepSummary`] and the log.
//!
//! Never terminated, regardless of policy:
//! - the current process;
//! - its descendants, which belong to the run in progress;
//! - its ancestors, when `protect_ancestors` is set;
//! - anything classified foreign or unknown.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WatchdogConfig;
use crate::process_classifier::{LaunchKind, ProcessClassification, ProcessClassifier};
use crate::process_scan::{ProcessRecord, ProcessSource, TerminationRequest};

/// Age thresholds and wait bounds for one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPolicy {
    pub build_run_max_age: Duration,
    pub test_host_max_age: Duration,
    /// Upper bound on waiting for terminated processes to exit.
    pub max_wait: Duration,
    pub protect_ancestors: bool,
    /// Liveness polling cadence while waiting.
    pub poll_interval: Duration,
}

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl Default for SweepPolicy {
    fn default() -> Self {
        Self::from_config(&WatchdogConfig::default())
    }
}

impl SweepPolicy {
    /// Same age threshold for every launch kind.
    #[must_use]
    pub fn uniform(max_age: Duration, max_wait: Duration) -> Self {
        Self {
            build_run_max_age: max_age,
            test_host_max_age: max_age,
            max_wait,
            protect_ancestors: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self {
            build_run_max_age: Duration::from_secs(config.build_run_max_age_secs),
            test_host_max_age: Duration::from_secs(config.test_host_max_age_secs),
            max_wait: config.max_wait(),
            protect_ancestors: config.protect_ancestors,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub const fn threshold_for(&self, kind: LaunchKind) -> Duration {
        match kind {
            LaunchKind::BuildRun => self.build_run_max_age,
            LaunchKind::TestHost => self.test_host_max_age,
        }
    }

    /// Strictly older than the threshold for its launch kind.
    #[must_use]
    pub fn is_stale(&self, kind: LaunchKind, age: Duration) -> bool {
        age > self.threshold_for(kind)
    }
}

/// Relation of a process to the current one, within one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kinship {
    Ancestor,
    Descendant,
}

impl std::fmt::Display for Kinship {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ancestor => write!(f, "ancestor"),
            Self::Descendant => write!(f, "descendant"),
        }
    }
}

/// One classified process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedProcess {
    #[serde(flatten)]
    pub record: ProcessRecord,
    pub classification: ProcessClassification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinship: Option<Kinship>,
}

impl ClassifiedProcess {
    /// Whether `policy` forbids terminating this process because of its
    /// relation to the current process.
    #[must_use]
    pub fn is_protected(&self, policy: &SweepPolicy) -> bool {
        match self.kinship {
            Some(Kinship::Descendant) => true,
            Some(Kinship::Ancestor) => policy.protect_ancestors,
            None => false,
        }
    }
}

/// Processes per classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounts {
    pub self_process: usize,
    pub known_test: usize,
    pub foreign: usize,
    pub unknown: usize,
}

impl ClassCounts {
    fn add(&mut self, classification: ProcessClassification) {
        match classification {
            ProcessClassification::SelfProcess => self.self_process += 1,
            ProcessClassification::KnownTest(_) => self.known_test += 1,
            ProcessClassification::Foreign => self.foreign += 1,
            ProcessClassification::Unknown => self.unknown += 1,
        }
    }
}

/// Selection made by [`ProcessWatchdog::plan`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepPlan {
    pub scanned: usize,
    pub by_class: ClassCounts,
    pub selected: Vec<ClassifiedProcess>,
}

/// How one selected process ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "error")]
pub enum TerminationOutcome {
    Terminated,
    TimedOut,
    AlreadyGone,
    Failed(String),
}

impl std::fmt::Display for TerminationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terminated => write!(f, "terminated"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::AlreadyGone => write!(f, "already_gone"),
            Self::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub scanned: usize,
    pub by_class: ClassCounts,
    pub selected: usize,
    pub terminated: usize,
    pub timed_out: usize,
    pub already_gone: usize,
    pub failed: usize,
    pub terminated_pids: Vec<u32>,
    pub timed_out_pids: Vec<u32>,
    pub errors: Vec<String>,
}

impl SweepSummary {
    fn record(&mut self, pid: u32, outcome: &TerminationOutcome) {
        match outcome {
            TerminationOutcome::Terminated => {
                self.terminated += 1;
                self.terminated_pids.push(pid);
            }
            TerminationOutcome::TimedOut => {
                self.timed_out += 1;
                self.timed_out_pids.push(pid);
            }
            TerminationOutcome::AlreadyGone => self.already_gone += 1,
            TerminationOutcome::Failed(err) => {
                self.failed += 1;
                self.errors.push(format!("failed to terminate pid {pid}: {err}"));
            }
        }
    }
}

/// Enumerates, classifies and reclaims leaked test processes.
pub struct ProcessWatchdog {
    source: Arc<dyn ProcessSource>,
    classifier: ProcessClassifier,
    policy: SweepPolicy,
}

impl std::fmt::Debug for ProcessWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessWatchdog")
            .field("classifier", &self.classifier)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ProcessWatchdog {
    #[must_use]
    pub fn new(
        source: Arc<dyn ProcessSource>,
        classifier: ProcessClassifier,
        policy: SweepPolicy,
    ) -> Self {
        Self {
            source,
            classifier,
            policy,
        }
    }

    #[must_use]
    pub fn from_config(config: &WatchdogConfig, source: Arc<dyn ProcessSource>) -> Self {
        Self::new(
            source,
            ProcessClassifier::from_config(config),
            SweepPolicy::from_config(config),
        )
    }

    /// Policy used by periodic and suite-level sweeps.
    #[must_use]
    pub fn policy(&self) -> &SweepPolicy {
        &self.policy
    }

    /// Classify every current process.
    pub fn scan(&self) -> crate::Result<Vec<ClassifiedProcess>> {
        let records = self.source.snapshot()?;
        let current = self.source.current_pid();
        let ancestors = ancestors_of(current, &records);
        let descendants = descendants_of(current, &records);
        Ok(records
            .into_iter()
            .map(|record| {
                let classification = self.classifier.classify(&record, current);
                let kinship = if ancestors.contains(&record.pid) {
                    Some(Kinship::Ancestor)
                } else if descendants.contains(&record.pid) {
                    Some(Kinship::Descendant)
                } else {
                    None
                };
                ClassifiedProcess {
                    record,
                    classification,
                    kinship,
                }
            })
            .collect())
    }

    /// Selection a sweep with `policy` would terminate. Terminates nothing.
    pub fn plan(&self, policy: &SweepPolicy) -> crate::Result<SweepPlan> {
        let classified = self.scan()?;
        let mut plan = SweepPlan {
            scanned: classified.len(),
            ..SweepPlan::default()
        };
        for process in classified {
            plan.by_class.add(process.classification);
            if is_eligible(&process, policy) {
                plan.selected.push(process);
            }
        }
        Ok(plan)
    }

    /// Sweep with one age threshold for every launch kind.
    pub fn sweep(&self, max_age: Duration, max_wait: Duration) -> SweepSummary {
        let policy = SweepPolicy {
            protect_ancestors: self.policy.protect_ancestors,
            poll_interval: self.policy.poll_interval,
            ..SweepPolicy::uniform(max_age, max_wait)
        };
        self.sweep_with_policy(&policy)
    }

    /// Terminate stale known-test processes and wait for them to exit.
    ///
    /// Blocks for at most `policy.max_wait` after signalling.
    pub fn sweep_with_policy(&self, policy: &SweepPolicy) -> SweepSummary {
        let plan = match self.plan(policy) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(error = %err, "watchdog sweep: process scan failed");
                return SweepSummary {
                    errors: vec![format!("process scan failed: {err}")],
                    ..SweepSummary::default()
                };
            }
        };

        let mut summary = SweepSummary {
            scanned: plan.scanned,
            by_class: plan.by_class,
            selected: plan.selected.len(),
            ..SweepSummary::default()
        };

        let mut pending = Vec::new();
        for process in &plan.selected {
            let pid = process.record.pid;
            info!(
                pid,
                classification = %process.classification,
                age_secs = process.record.age.as_secs(),
                signature = process.record.signature.as_deref().unwrap_or(""),
                "watchdog: terminating stale test process"
            );
            match self.source.terminate(pid) {
                TerminationRequest::Sent => pending.push(pid),
                TerminationRequest::AlreadyGone => {
                    summary.record(pid, &TerminationOutcome::AlreadyGone);
                }
                TerminationRequest::Failed(err) => {
                    warn!(pid, error = %err, "watchdog: termination request failed");
                    summary.record(pid, &TerminationOutcome::Failed(err));
                }
            }
        }

        for (pid, outcome) in self.await_exit(pending, policy) {
            match outcome {
                TerminationOutcome::TimedOut => {
                    warn!(pid, max_wait = ?policy.max_wait, "watchdog: process did not exit in time");
                }
                _ => debug!(pid, %outcome, "watchdog: termination confirmed"),
            }
            summary.record(pid, &outcome);
        }

        if summary.selected > 0 || !summary.errors.is_empty() {
            info!(
                scanned = summary.scanned,
                selected = summary.selected,
                terminated = summary.terminated,
                timed_out = summary.timed_out,
                already_gone = summary.already_gone,
                failed = summary.failed,
                "watchdog sweep complete"
            );
        } else {
            debug!(scanned = summary.scanned, "watchdog sweep: nothing stale");
        }
        summary
    }

    /// Poll liveness until every pid exits or the deadline passes.
    fn await_exit(
        &self,
        mut pending: Vec<u32>,
        policy: &SweepPolicy,
    ) -> Vec<(u32, TerminationOutcome)> {
        let mut outcomes = Vec::with_capacity(pending.len());
        let deadline = Instant::now() + policy.max_wait;
        loop {
            pending.retain(|pid| {
                if self.source.is_alive(*pid) {
                    true
                } else {
                    outcomes.push((*pid, TerminationOutcome::Terminated));
                    false
                }
            });
            let now = Instant::now();
            if pending.is_empty() || now >= deadline {
                break;
            }
            let poll = policy.poll_interval.max(Duration::from_millis(1));
            std::thread::sleep(poll.min(deadline - now));
        }
        outcomes.extend(pending.into_iter().map(|pid| (pid, TerminationOutcome::TimedOut)));
        outcomes
    }
}

fn is_eligible(process: &ClassifiedProcess, policy: &SweepPolicy) -> bool {
    if process.is_protected(policy) {
        return false;
    }
    process
        .classification
        .launch_kind()
        .is_some_and(|kind| policy.is_stale(kind, process.record.age))
}

/// Parent chain of `pid` within one snapshot (excluding `pid` itself).
fn ancestors_of(pid: u32, records: &[ProcessRecord]) -> HashSet<u32> {
    let parents: HashMap<u32, u32> = records
        .iter()
        .filter_map(|r| r.ppid.map(|ppid| (r.pid, ppid)))
        .collect();
    let mut ancestors = HashSet::new();
    let mut cursor = parents.get(&pid).copied();
    while let Some(parent) = cursor {
        if parent == pid || !ancestors.insert(parent) {
            break;
        }
        cursor = parents.get(&parent).copied();
    }
    ancestors
}

/// Every process below `pid` within one snapshot (excluding `pid` itself).
fn descendants_of(pid: u32, records: &[ProcessRecord]) -> HashSet<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for record in records {
        if let Some(ppid) = record.ppid {
            children.entry(ppid).or_default().push(record.pid);
        }
    }
    let mut descendants = HashSet::new();
    let mut stack = vec![pid];
    while let Some(parent) = stack.pop() {
        for &child in children.get(&parent).into_iter().flatten() {
            if child != pid && descendants.insert(child) {
                stack.push(child);
            }
        }
    }
    descendants
}

/// Run `watchdog.sweep()` on the blocking pool.
pub async fn sweep_blocking(watchdog: Arc<ProcessWatchdog>, policy: SweepPolicy) -> SweepSummary {
    tokio::task::spawn_blocking(move || watchdog.sweep_with_policy(&policy))
        .await
        .unwrap_or_else(|e| SweepSummary {
            errors: vec![format!("spawn_blocking failed: {e}")],
            ..SweepSummary::default()
        })
}

/// Handle returned by [`spawn_sweeper`].
pub struct SweeperHandle {
    task: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop after its current tick.
    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait for the sweeper task to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }

    /// Stop immediately without waiting for the next tick.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawn a periodic sweeper. The first sweep runs one `interval` from now.
#[must_use]
pub fn spawn_sweeper(watchdog: Arc<ProcessWatchdog>, interval: Duration) -> SweeperHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let policy = *watchdog.policy();

    let task = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "periodic sweeper started");

        loop {
            ticker.tick().await;
            if flag.load(Ordering::SeqCst) {
                info!("periodic sweeper shutting down");
                break;
            }
            let summary = sweep_blocking(Arc::clone(&watchdog), policy).await;
            for err in &summary.errors {
                warn!(error = %err, "periodic sweep error");
            }
        }
    });

    SweeperHandle { task, shutdown }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory process table; terminated pids vanish unless `stubborn`.
    #[derive(Default)]
    struct FakeSource {
        current: u32,
        records: Vec<ProcessRecord>,
        stubborn: HashSet<u32>,
        terminated: Mutex<Vec<u32>>,
        fail_scan: bool,
    }

    impl ProcessSource for FakeSource {
        fn snapshot(&self) -> crate::Result<Vec<ProcessRecord>> {
            if self.fail_scan {
                return Err(crate::Error::ProcessScan("ps missing".into()));
            }
            Ok(self.records.clone())
        }

        fn terminate(&self, pid: u32) -> TerminationRequest {
            self.terminated.lock().unwrap().push(pid);
            TerminationRequest::Sent
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.stubborn.contains(&pid) || !self.terminated.lock().unwrap().contains(&pid)
        }

        fn current_pid(&self) -> u32 {
            self.current
        }
    }

    fn rec(pid: u32, age_secs: u64, sig: Option<&str>) -> ProcessRecord {
        let r = ProcessRecord::new(pid, Duration::from_secs(age_secs));
        match sig {
            Some(sig) => r.with_signature(sig),
            None => r,
        }
    }

    fn watchdog(source: FakeSource) -> (Arc<FakeSource>, ProcessWatchdog) {
        let source = Arc::new(source);
        let dyn_source: Arc<dyn ProcessSource> = source.clone();
        let wd = ProcessWatchdog::from_config(&WatchdogConfig::default(), dyn_source);
        (source, wd)
    }

    const WAIT: Duration = Duration::from_millis(200);

    #[test]
    fn only_stale_known_test_processes_are_terminated() {
        let (source, wd) = watchdog(FakeSource {
            current: 1,
            records: vec![
                rec(1, 999, Some("testhost self")),
                rec(2, 29, Some("fleet-manager")),
                rec(3, 31, Some("fleet-manager")),
            ],
            ..FakeSource::default()
        });
        let summary = wd.sweep(Duration::from_secs(30), WAIT);
        assert_eq!(summary.selected, 1);
        assert_eq!(summary.terminated_pids, vec![3]);
        assert_eq!(*source.terminated.lock().unwrap(), vec![3]);
        assert_eq!(summary.by_class.self_process, 1);
        assert_eq!(summary.by_class.known_test, 2);
    }

    #[test]
    fn age_equal_to_threshold_is_not_selected() {
        let (_source, wd) = watchdog(FakeSource {
            current: 1,
            records: vec![rec(5, 30, Some("fleet-manager"))],
            ..FakeSource::default()
        });
        let plan = wd
            .plan(&SweepPolicy::uniform(Duration::from_secs(30), WAIT))
            .unwrap();
        assert!(plan.selected.is_empty());

        let mut older = rec(5, 30, Some("fleet-manager"));
        older.age += Duration::from_millis(1);
        let (_source, wd) = watchdog(FakeSource {
            current: 1,
            records: vec![older],
            ..FakeSource::default()
        });
        let plan = wd
            .plan(&SweepPolicy::uniform(Duration::from_secs(30), WAIT))
            .unwrap();
        assert_eq!(plan.selected.len(), 1);
    }

    #[test]
    fn launch_kinds_use_their_own_thresholds() {
        let (_source, wd) = watchdog(FakeSource {
            current: 1,
            records: vec![
                rec(10, 60, Some("fleet-manager --run")),
                rec(11, 60, Some("testhost --port 1")),
            ],
            ..FakeSource::default()
        });
        let plan = wd.plan(wd.policy()).unwrap();
        let pids: Vec<u32> = plan.selected.iter().map(|p| p.record.pid).collect();
        assert_eq!(pids, vec![10]);
    }

    #[test]
    fn foreign_and_unknown_are_never_selected() {
        let (source, wd) = watchdog(FakeSource {
            current: 1,
            records: vec![rec(20, 10_000, None), rec(21, 10_000, Some("postgres"))],
            ..FakeSource::default()
        });
        let summary = wd.sweep(Duration::ZERO, WAIT);
        assert_eq!(summary.selected, 0);
        assert!(source.terminated.lock().unwrap().is_empty());
        assert_eq!(summary.by_class.unknown, 1);
        assert_eq!(summary.by_class.foreign, 1);
    }

    #[test]
    fn ancestors_are_protected() {
        let (source, wd) = watchdog(FakeSource {
            current: 100,
            records: vec![
                rec(50, 500, Some("testhost --parent")).with_parent(1),
                rec(100, 10, Some("cargo test")).with_parent(50),
                rec(60, 500, Some("testhost --other")).with_parent(1),
            ],
            ..FakeSource::default()
        });
        let summary = wd.sweep(Duration::from_secs(30), WAIT);
        assert_eq!(summary.terminated_pids, vec![60]);
        assert!(!source.terminated.lock().unwrap().contains(&50));
    }

    #[test]
    fn stubborn_process_times_out() {
        let (_source, wd) = watchdog(FakeSource {
            current: 1,
            records: vec![rec(7, 100, Some("fleet-manager"))],
            stubborn: [7].into_iter().collect(),
            ..FakeSource::default()
        });
        let started = Instant::now();
        let summary = wd.sweep(Duration::from_secs(30), Duration::from_millis(60));
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(summary.timed_out_pids, vec![7]);
        assert_eq!(summary.terminated, 0);
    }

    #[test]
    fn scan_failure_is_reported_not_raised() {
        let (_source, wd) = watchdog(FakeSource {
            fail_scan: true,
            ..FakeSource::default()
        });
        let summary = wd.sweep(Duration::from_secs(30), WAIT);
        assert_eq!(summary.scanned, 0);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].contains("ps missing"));
    }

    #[test]
    fn children_of_the_current_process_are_protected() {
        let (source, wd) = watchdog(FakeSource {
            current: 100,
            records: vec![
                rec(100, 10, Some("cargo test")).with_parent(1),
                rec(101, 45, Some("fleet-manager --headless")).with_parent(100),
                rec(102, 45, Some("fleet-manager --worker")).with_parent(101),
                rec(103, 45, Some("fleet-manager --headless")).with_parent(1),
            ],
            ..FakeSource::default()
        });
        let summary = wd.sweep_with_policy(wd.policy());
        assert_eq!(summary.terminated_pids, vec![103]);
        assert_eq!(*source.terminated.lock().unwrap(), vec![103]);

        let kinships: HashMap<u32, Option<Kinship>> = wd
            .scan()
            .unwrap()
            .into_iter()
            .map(|p| (p.record.pid, p.kinship))
            .collect();
        assert_eq!(kinships[&101], Some(Kinship::Descendant));
        assert_eq!(kinships[&102], Some(Kinship::Descendant));
        assert_eq!(kinships[&103], None);
    }

    #[test]
    fn descendant_walk_stops_on_cycles() {
        let records = vec![
            rec(2, 1, None).with_parent(1),
            rec(3, 1, None).with_parent(2),
            rec(2, 1, None).with_parent(3),
            rec(1, 1, None).with_parent(3),
        ];
        let descendants = descendants_of(1, &records);
        assert_eq!(descendants, [2, 3].into_iter().collect());
    }

    #[test]
    fn ancestor_walk_stops_on_cycles() {
        let records = vec![
            rec(2, 1, None).with_parent(3),
            rec(3, 1, None).with_parent(2),
            rec(4, 1, None).with_parent(2),
        ];
        let ancestors = ancestors_of(4, &records);
        assert_eq!(ancestors, [2, 3].into_iter().collect());
    }

    #[tokio::test]
    async fn sweeper_shuts_down_on_signal() {
        let (_source, wd) = watchdog(FakeSource::default());
        let handle = spawn_sweeper(Arc::new(wd), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(35)).await;
        handle.signal_shutdown();
        handle.join().await;
    }
}
