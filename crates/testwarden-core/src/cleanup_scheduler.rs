//! Background cleanup scheduler.
//!
//! Every cycle prunes registry entries whose objects were already dropped.
//! When memory use is above the configured threshold it also runs a
//! reclamation pass: registry compaction plus any registered
//! [`ReclaimHook`]s. The scheduler never disposes live resources and never
//! touches OS processes.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::affinity::panic_message;
use crate::config::CleanupConfig;
use crate::memory_pressure::MemoryProbe;
use crate::registry::{CompactionStats, RegistryHandle};

/// Extra work to run during a reclamation pass (cache trims and the like).
pub trait ReclaimHook: Send + Sync {
    fn reclaim(&self);
}

impl<F> ReclaimHook for F
where
    F: Fn() + Send + Sync,
{
    fn reclaim(&self) {
        self();
    }
}

/// Outcome of one scheduler cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupCycleReport {
    pub pruned: usize,
    pub memory_used_percent: Option<f64>,
    /// Set when the reclamation pass ran.
    pub compaction: Option<CompactionStats>,
    pub hooks_run: usize,
    pub hook_failures: usize,
}

impl CleanupCycleReport {
    #[must_use]
    pub fn reclaimed(&self) -> bool {
        self.compaction.is_some()
    }
}

pub struct PeriodicCleanupScheduler {
    registry: RegistryHandle,
    probe: Arc<dyn MemoryProbe>,
    threshold_percent: f64,
    hooks: Vec<Arc<dyn ReclaimHook>>,
}

impl std::fmt::Debug for PeriodicCleanupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicCleanupScheduler")
            .field("threshold_percent", &self.threshold_percent)
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

impl PeriodicCleanupScheduler {
    #[must_use]
    pub fn new(registry: RegistryHandle, probe: Arc<dyn MemoryProbe>, threshold_percent: f64) -> Self {
        Self {
            registry,
            probe,
            threshold_percent,
            hooks: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_config(
        config: &CleanupConfig,
        registry: RegistryHandle,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self::new(registry, probe, config.memory_threshold_percent)
    }

    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn ReclaimHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// One prune pass, plus reclamation if memory is above threshold.
    pub fn run_cycle(&self) -> CleanupCycleReport {
        let mut report = CleanupCycleReport {
            pruned: self.registry.prune_dead(),
            memory_used_percent: self.probe.used_percent(),
            ..CleanupCycleReport::default()
        };

        let Some(used) = report.memory_used_percent else {
            return report;
        };
        if used <= self.threshold_percent {
            return report;
        }

        info!(
            used_percent = used,
            threshold_percent = self.threshold_percent,
            "memory pressure above threshold, reclaiming"
        );
        report.compaction = Some(self.registry.compact());
        for hook in &self.hooks {
            match catch_unwind(AssertUnwindSafe(|| hook.reclaim())) {
                Ok(()) => report.hooks_run += 1,
                Err(payload) => {
                    report.hook_failures += 1;
                    warn!(error = %panic_message(&*payload), "reclaim hook panicked");
                }
            }
        }
        report
    }
}

/// Handle returned by [`spawn_cleanup_scheduler`].
pub struct CleanupHandle {
    task: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl CleanupHandle {
    /// Signal the scheduler to stop at its next tick.
    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait for the scheduler task to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }

    /// Stop immediately.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Run `run_cycle` every `interval` on the blocking pool until shut down.
#[must_use]
pub fn spawn_cleanup_scheduler(
    scheduler: Arc<PeriodicCleanupScheduler>,
    interval: Duration,
) -> CleanupHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);

    let task = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        debug!(interval_secs = interval.as_secs(), "cleanup scheduler started");

        loop {
            ticker.tick().await;
            if flag.load(Ordering::SeqCst) {
                debug!("cleanup scheduler shutting down");
                break;
            }
            let cycle = Arc::clone(&scheduler);
            match tokio::task::spawn_blocking(move || cycle.run_cycle()).await {
                Ok(report) if report.pruned > 0 || report.reclaimed() => {
                    debug!(
                        pruned = report.pruned,
                        reclaimed = report.reclaimed(),
                        hooks_run = report.hooks_run,
                        "cleanup cycle"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "cleanup cycle task failed"),
            }
        }
    });

    CleanupHandle { task, shutdown }
}
