//! Suite-level integration for test harnesses.
//!
//! A [`SuiteContext`] is created once per test process. It owns the
//! registry, the process watchdog and the background tasks, and is passed
//! explicitly to whatever runs test units:
//!
//! ```no_run
//! # async fn demo() -> testwarden_core::Result<()> {
//! use testwarden_core::{Config, SuiteContext, UnitOutcome};
//!
//! let suite = SuiteContext::start(Config::load(None)?).await;
//! let outcome = suite.run_unit("orders::grid_roundtrip", async { 42 }).await;
//! assert!(matches!(outcome, UnitOutcome::Completed(42)));
//! let report = suite.shutdown().await;
//! # let _ = report;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cleanup_scheduler::{CleanupHandle, PeriodicCleanupScheduler, spawn_cleanup_scheduler};
use crate::config::Config;
use crate::memory_pressure::{MemoryProbe, SystemMemoryProbe};
use crate::process_scan::{ProcessSource, SystemProcessSource};
use crate::process_watchdog::{
    ProcessWatchdog, SweepPolicy, SweepSummary, SweeperHandle, spawn_sweeper, sweep_blocking,
};
use crate::registry::{RegistryHandle, ResourceRegistry, TeardownReport};
use crate::supervisor::{ForcedCleanup, SupervisorContext, TestTimeoutSupervisor};

/// How a supervised unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome<T> {
    /// The unit finished before its deadline; its resources were torn down.
    Completed(T),
    /// The deadline fired; forced cleanup ran and the unit was abandoned.
    TimedOut(Option<ForcedCleanup>),
}

impl<T> UnitOutcome<T> {
    #[must_use]
    pub const fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }
}

/// What suite start and shutdown did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub start_sweep: Option<SweepSummary>,
    /// `None` if the registry had already been shut down elsewhere.
    pub teardown: Option<TeardownReport>,
    pub end_sweep: Option<SweepSummary>,
}

pub struct SuiteContext {
    config: Config,
    registry: RegistryHandle,
    watchdog: Option<Arc<ProcessWatchdog>>,
    policy: SweepPolicy,
    start_sweep: Option<SweepSummary>,
    cleanup: Option<CleanupHandle>,
    sweeper: Option<SweeperHandle>,
}

impl std::fmt::Debug for SuiteContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuiteContext")
            .field("registry", &self.registry)
            .field("watchdog", &self.watchdog.is_some())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SuiteContext {
    /// Start against the real OS process table and memory counters.
    pub async fn start(config: Config) -> Self {
        let source: Arc<dyn ProcessSource> =
            Arc::new(SystemProcessSource::new(config.watchdog.unit_env_var.clone()));
        let probe: Arc<dyn MemoryProbe> = Arc::new(SystemMemoryProbe);
        Self::start_with(config, source, probe).await
    }

    /// Start with explicit process and memory backends.
    ///
    /// Runs the suite-start sweep, then spawns the cleanup scheduler and
    /// periodic sweeper when enabled.
    pub async fn start_with(
        config: Config,
        source: Arc<dyn ProcessSource>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        let registry = ResourceRegistry::from_config(&config.disposal).into_handle();
        let policy = SweepPolicy::from_config(&config.watchdog);
        let watchdog = config
            .watchdog
            .enabled
            .then(|| Arc::new(ProcessWatchdog::from_config(&config.watchdog, source)));

        let start_sweep = match &watchdog {
            Some(watchdog) => Some(sweep_blocking(Arc::clone(watchdog), policy).await),
            None => None,
        };

        let cleanup = config.cleanup.enabled.then(|| {
            let scheduler =
                PeriodicCleanupScheduler::from_config(&config.cleanup, Arc::clone(&registry), probe);
            spawn_cleanup_scheduler(
                Arc::new(scheduler),
                Duration::from_secs(config.cleanup.interval_secs),
            )
        });

        let sweeper = match (&watchdog, config.watchdog.interval()) {
            (Some(watchdog), Some(interval)) => Some(spawn_sweeper(Arc::clone(watchdog), interval)),
            _ => None,
        };

        info!(
            watchdog = watchdog.is_some(),
            cleanup = cleanup.is_some(),
            periodic_sweeps = sweeper.is_some(),
            deadline_secs = config.supervisor.deadline().as_secs(),
            "test suite supervision started"
        );

        Self {
            config,
            registry,
            watchdog,
            policy,
            start_sweep,
            cleanup,
            sweeper,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    #[must_use]
    pub fn watchdog(&self) -> Option<&Arc<ProcessWatchdog>> {
        self.watchdog.as_ref()
    }

    #[must_use]
    pub fn start_sweep(&self) -> Option<&SweepSummary> {
        self.start_sweep.as_ref()
    }

    fn supervisor_context(&self) -> SupervisorContext {
        SupervisorContext {
            registry: Arc::clone(&self.registry),
            watchdog: self.watchdog.clone(),
            policy: self.policy,
        }
    }

    /// Arm a supervisor with the configured deadline.
    #[must_use]
    pub fn supervise(&self, unit: impl Into<String>) -> TestTimeoutSupervisor {
        self.supervise_with(unit, self.config.supervisor.deadline())
    }

    #[must_use]
    pub fn supervise_with(&self, unit: impl Into<String>, deadline: Duration) -> TestTimeoutSupervisor {
        TestTimeoutSupervisor::arm(unit, deadline, self.supervisor_context())
    }

    /// Run one test unit under the configured deadline.
    pub async fn run_unit<F, T>(&self, unit: impl Into<String>, unit_future: F) -> UnitOutcome<T>
    where
        F: Future<Output = T>,
    {
        self.run_unit_with(unit, self.config.supervisor.deadline(), unit_future)
            .await
    }

    /// Run one test unit; on completion its resources are torn down, on
    /// timeout the future is dropped after forced cleanup.
    pub async fn run_unit_with<F, T>(
        &self,
        unit: impl Into<String>,
        deadline: Duration,
        unit_future: F,
    ) -> UnitOutcome<T>
    where
        F: Future<Output = T>,
    {
        let supervisor = self.supervise_with(unit, deadline);

        let output = tokio::select! {
            biased;
            output = unit_future => Some(output),
            () = supervisor.aborted() => None,
        };

        match output {
            Some(output) if supervisor.complete() => {
                let registry = Arc::clone(&self.registry);
                if let Err(err) = tokio::task::spawn_blocking(move || registry.teardown_all()).await {
                    warn!(unit = supervisor.unit(), error = %err, "unit teardown task failed");
                }
                UnitOutcome::Completed(output)
            }
            // Deadline fired while the unit was finishing: the timeout wins.
            Some(_) | None => {
                supervisor.aborted().await;
                UnitOutcome::TimedOut(supervisor.forced_cleanup())
            }
        }
    }

    /// Stop background tasks, shut the registry down once, run the
    /// suite-end sweep.
    pub async fn shutdown(mut self) -> SuiteReport {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.signal_shutdown();
            cleanup.abort();
            cleanup.join().await;
        }
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.signal_shutdown();
            sweeper.abort();
            sweeper.join().await;
        }

        let registry = Arc::clone(&self.registry);
        let teardown = tokio::task::spawn_blocking(move || registry.shutdown())
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "registry shutdown task failed");
                None
            });

        let end_sweep = match &self.watchdog {
            Some(watchdog) => Some(sweep_blocking(Arc::clone(watchdog), self.policy).await),
            None => None,
        };

        let report = SuiteReport {
            start_sweep: self.start_sweep.take(),
            teardown,
            end_sweep,
        };
        info!(
            disposed = report.teardown.as_ref().map_or(0, |t| t.disposed.len()),
            terminated = report.end_sweep.as_ref().map_or(0, |s| s.terminated),
            "test suite supervision stopped"
        );
        report
    }
}

impl Drop for SuiteContext {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.abort();
        }
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::Affinity;
    use crate::process_scan::{ProcessRecord, TerminationRequest};
    use crate::resource::{Disposable, SharedResource, StepResult};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct EmptySource;

    impl ProcessSource for EmptySource {
        fn snapshot(&self) -> crate::Result<Vec<ProcessRecord>> {
            Ok(Vec::new())
        }
        fn terminate(&self, _pid: u32) -> TerminationRequest {
            TerminationRequest::AlreadyGone
        }
        fn is_alive(&self, _pid: u32) -> bool {
            false
        }
    }

    struct NoPressure;

    impl MemoryProbe for NoPressure {
        fn used_percent(&self) -> Option<f64> {
            Some(1.0)
        }
    }

    struct Form(AtomicBool);

    impl Disposable for Form {
        fn type_signature(&self) -> &str {
            "MainForm"
        }
        fn dispose(&self) -> StepResult {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn suite() -> SuiteContext {
        SuiteContext::start_with(Config::default(), Arc::new(EmptySource), Arc::new(NoPressure)).await
    }

    #[tokio::test(start_paused = true)]
    async fn completed_unit_tears_down_its_resources() {
        let suite = suite().await;
        assert_eq!(suite.start_sweep().map(|s| s.scanned), Some(0));

        let form = Arc::new(Form(AtomicBool::new(false)));
        let shared: SharedResource = form.clone();
        let registry = Arc::clone(suite.registry());
        let outcome = suite
            .run_unit("unit", async move {
                registry.register(&shared, Affinity::Any);
                "ok"
            })
            .await;

        assert_eq!(outcome, UnitOutcome::Completed("ok"));
        assert!(form.0.load(Ordering::SeqCst));
        assert!(suite.registry().is_empty());
        suite.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn hung_unit_times_out() {
        let suite = suite().await;
        let outcome = suite
            .run_unit_with("hung", Duration::from_secs(5), std::future::pending::<()>())
            .await;
        assert!(outcome.is_timed_out());
        let UnitOutcome::TimedOut(Some(cleanup)) = outcome else {
            panic!("expected forced cleanup report");
        };
        assert!(cleanup.sweep.is_some());
        suite.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_reports_once() {
        let suite = suite().await;
        let registry = Arc::clone(suite.registry());
        let report = suite.shutdown().await;
        assert!(report.teardown.is_some());
        assert!(report.end_sweep.is_some());
        assert!(registry.is_shut_down());
        assert!(registry.shutdown().is_none());
    }
}
