//! Per-test-unit timeout supervision.
//!
//! [`TestTimeoutSupervisor::arm`] starts a [`WatchdogTimer`] for one test
//! unit. Exactly one of two things then happens:
//!
//! - the harness calls [`complete`](TestTimeoutSupervisor::complete) first:
//!   the timer is cancelled and the unit is `Completed`;
//! - the deadline passes first: the unit becomes `TimedOut`, the registry is
//!   torn down and stale processes are swept (on the blocking pool), then the
//!   abort signal is raised for [`aborted`](TestTimeoutSupervisor::aborted).
//!
//! This is the only component that forces teardown asynchronously.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::process_watchdog::{ProcessWatchdog, SweepPolicy, SweepSummary};
use crate::registry::{RegistryHandle, TeardownReport};
use crate::timer::WatchdogTimer;

const ARMED: u8 = 0;
const COMPLETED: u8 = 1;
const TIMED_OUT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Armed,
    Completed,
    TimedOut,
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Armed => write!(f, "armed"),
            Self::Completed => write!(f, "completed"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// What a forced cleanup acts on.
#[derive(Debug, Clone)]
pub struct SupervisorContext {
    pub registry: RegistryHandle,
    /// `None` when the process watchdog is disabled.
    pub watchdog: Option<Arc<ProcessWatchdog>>,
    pub policy: SweepPolicy,
}

impl SupervisorContext {
    fn force_cleanup(&self) -> ForcedCleanup {
        let teardown = self.registry.teardown_all();
        let sweep = self
            .watchdog
            .as_ref()
            .map(|watchdog| watchdog.sweep_with_policy(&self.policy));
        ForcedCleanup { teardown, sweep }
    }
}

/// Work done when a unit timed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForcedCleanup {
    pub teardown: TeardownReport,
    pub sweep: Option<SweepSummary>,
}

struct Shared {
    unit: String,
    deadline: Duration,
    timer: WatchdogTimer,
    state: AtomicU8,
    abort: watch::Sender<bool>,
    cleanup: Mutex<Option<ForcedCleanup>>,
}

impl Shared {
    fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(ARMED, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Deadline guard for one test unit.
pub struct TestTimeoutSupervisor {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for TestTimeoutSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestTimeoutSupervisor")
            .field("unit", &self.shared.unit)
            .field("deadline", &self.shared.deadline)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TestTimeoutSupervisor {
    /// Arm supervision for `unit`. Must be called inside a tokio runtime.
    #[must_use]
    pub fn arm(unit: impl Into<String>, deadline: Duration, context: SupervisorContext) -> Self {
        let unit = unit.into();
        let (abort, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            timer: WatchdogTimer::arm(unit.clone(), deadline),
            unit,
            deadline,
            state: AtomicU8::new(ARMED),
            abort,
            cleanup: Mutex::new(None),
        });
        debug!(unit = %shared.unit, deadline_secs = deadline.as_secs(), "supervisor armed");

        let task_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move { supervise(task_shared, context).await });
        Self { shared, task }
    }

    #[must_use]
    pub fn unit(&self) -> &str {
        &self.shared.unit
    }

    #[must_use]
    pub fn state(&self) -> UnitState {
        match self.shared.state.load(Ordering::Acquire) {
            ARMED => UnitState::Armed,
            COMPLETED => UnitState::Completed,
            _ => UnitState::TimedOut,
        }
    }

    /// Mark the unit finished and cancel its timer.
    ///
    /// Returns `false` if the unit had already timed out (or completed).
    pub fn complete(&self) -> bool {
        if !self.shared.transition(COMPLETED) {
            return false;
        }
        self.shared.timer.cancel();
        debug!(unit = %self.shared.unit, "supervised unit completed");
        true
    }

    /// Resolves once a timed-out unit's forced cleanup has finished. Never
    /// resolves for a unit that completed normally.
    pub async fn aborted(&self) {
        let mut rx = self.shared.abort.subscribe();
        if rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Cleanup report, once a forced cleanup has run.
    #[must_use]
    pub fn forced_cleanup(&self) -> Option<ForcedCleanup> {
        self.shared
            .cleanup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wait for the supervision task to end (cancel or forced cleanup).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

async fn supervise(shared: Arc<Shared>, context: SupervisorContext) {
    if !shared.timer.wait().await {
        return;
    }
    // Completion raced the deadline and won.
    if !shared.transition(TIMED_OUT) {
        return;
    }

    error!(
        unit = %shared.unit,
        deadline_secs = shared.deadline.as_secs(),
        "test unit exceeded its deadline, forcing cleanup"
    );

    match tokio::task::spawn_blocking(move || context.force_cleanup()).await {
        Ok(cleanup) => {
            info!(
                unit = %shared.unit,
                disposed = cleanup.teardown.disposed.len(),
                faulted = cleanup.teardown.faulted.len(),
                terminated = cleanup.sweep.as_ref().map_or(0, |s| s.terminated),
                "forced cleanup finished"
            );
            *shared.cleanup.lock().unwrap_or_else(|e| e.into_inner()) = Some(cleanup);
        }
        Err(err) => {
            error!(unit = %shared.unit, error = %err, "forced cleanup task failed");
        }
    }

    shared.abort.send_replace(true);
}
