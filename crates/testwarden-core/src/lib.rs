//! testwarden-core: test-time resource teardown and process watchdog.
//!
//! Test suites that drive heavyweight objects (UI controls, app hosts,
//! child processes) tend to leak them when a test hangs or fails. This crate
//! keeps track of those objects and tears them down in a safe order, and it
//! reaps stale test processes left behind by earlier runs.
//!
//! # Architecture
//!
//! ```text
//! SuiteContext ──► ResourceRegistry ──► SafeDisposer ──► DisposalPlan
//!      │                  ▲                   │
//!      │                  │                   └──► OwnerToken (thread affinity)
//!      ├──► TestTimeoutSupervisor ──► WatchdogTimer
//!      ├──► PeriodicCleanupScheduler ──► MemoryProbe
//!      └──► ProcessWatchdog ──► ProcessClassifier ──► ProcessSource
//! ```
//!
//! # Modules
//!
//! - `resource`: the `Disposable` contract and resource identity
//! - `disposal_plan`: per-category disposal step sequences
//! - `affinity`: owner-thread marshaling with timeouts
//! - `registry`: weak-reference resource table and bulk teardown
//! - `disposer`: ordered, fault-isolated disposal of one resource tree
//! - `process_scan`: OS process table snapshots and termination
//! - `process_classifier`: conservative process classification
//! - `process_watchdog`: stale-process sweeps
//! - `timer`: single-shot watchdog timer
//! - `supervisor`: per-unit deadline supervision
//! - `memory_pressure`: memory usage probe
//! - `cleanup_scheduler`: periodic prune and reclamation
//! - `suite`: suite lifecycle wiring
//! - `config`, `logging`, `error`: ambient plumbing
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod affinity;
pub mod cleanup_scheduler;
pub mod config;
pub mod disposal_plan;
pub mod disposer;
pub mod error;
pub mod logging;
pub mod memory_pressure;
pub mod process_classifier;
pub mod process_scan;
pub mod process_watchdog;
pub mod registry;
pub mod resource;
pub mod suite;
pub mod supervisor;
pub mod timer;

pub use affinity::{Affinity, OwnerThread, OwnerToken};
pub use config::Config;
pub use disposal_plan::{DisposalStep, DisposalStrategySelector, ResourceCategory};
pub use disposer::DisposeOutcome;
pub use error::{Error, Result};
pub use process_classifier::{LaunchKind, ProcessClassification, ProcessClassifier};
pub use process_watchdog::{ProcessWatchdog, SweepPolicy, SweepSummary};
pub use registry::{RegistryHandle, ResourceRegistry, TeardownReport};
pub use resource::{Disposable, DisposeError, ResourceId, SharedResource, StepResult};
pub use suite::{SuiteContext, SuiteReport, UnitOutcome};
pub use supervisor::TestTimeoutSupervisor;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
