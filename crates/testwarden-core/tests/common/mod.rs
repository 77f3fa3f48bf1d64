//! Shared test infrastructure for testwarden-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::{FakeProcessSource, RecordingResource};
//! ```

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use testwarden_core::memory_pressure::MemoryProbe;
use testwarden_core::process_scan::{ProcessRecord, ProcessSource, TerminationRequest};
use testwarden_core::{Disposable, DisposeError, SharedResource, StepResult};

/// Pid the fake source reports for the test process itself.
pub const SELF_PID: u32 = 1;

/// Ordered log of disposal calls across resources.
pub type Journal = Arc<Mutex<Vec<String>>>;

#[must_use]
pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

#[must_use]
pub fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

/// Resource that appends `name:step` to a shared journal for every call.
pub struct RecordingResource {
    name: String,
    type_signature: String,
    journal: Journal,
    fail_dispose: bool,
}

impl RecordingResource {
    pub fn shared(name: &str, type_signature: &str, journal: &Journal) -> SharedResource {
        Arc::new(Self {
            name: name.to_string(),
            type_signature: type_signature.to_string(),
            journal: Arc::clone(journal),
            fail_dispose: false,
        })
    }

    pub fn failing(name: &str, type_signature: &str, journal: &Journal) -> SharedResource {
        Arc::new(Self {
            name: name.to_string(),
            type_signature: type_signature.to_string(),
            journal: Arc::clone(journal),
            fail_dispose: true,
        })
    }

    fn record(&self, step: &str) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("{}:{step}", self.name));
    }
}

impl Disposable for RecordingResource {
    fn type_signature(&self) -> &str {
        &self.type_signature
    }

    fn clear_bound_data(&self) -> StepResult {
        self.record("clear_bound_data");
        Ok(())
    }

    fn clear_items(&self) -> StepResult {
        self.record("clear_items");
        Ok(())
    }

    fn detach_events(&self) -> StepResult {
        self.record("detach_events");
        Ok(())
    }

    fn dispose(&self) -> StepResult {
        self.record("dispose");
        if self.fail_dispose {
            return Err(DisposeError::failed("handle already released"));
        }
        Ok(())
    }
}

/// Names whose `dispose` step appears in the journal, in order.
#[must_use]
pub fn disposed_names(journal: &Journal) -> Vec<String> {
    entries(journal)
        .into_iter()
        .filter_map(|e| e.strip_suffix(":dispose").map(str::to_string))
        .collect()
}

#[derive(Default)]
struct FakeState {
    records: Vec<ProcessRecord>,
    alive: HashSet<u32>,
    /// Processes that ignore termination.
    stubborn: HashSet<u32>,
    terminated: Vec<u32>,
    fail_snapshot: bool,
}

/// Scriptable process table.
#[derive(Clone, Default)]
pub struct FakeProcessSource {
    state: Arc<Mutex<FakeState>>,
}

impl FakeProcessSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a process with the given age and command line.
    pub fn spawn(&self, pid: u32, age_secs: u64, signature: &str) -> &Self {
        self.insert(ProcessRecord::new(pid, Duration::from_secs(age_secs)).with_signature(signature))
    }

    pub fn insert(&self, record: ProcessRecord) -> &Self {
        let mut state = self.state.lock().unwrap();
        state.alive.insert(record.pid);
        state.records.push(record);
        self
    }

    pub fn make_stubborn(&self, pid: u32) -> &Self {
        self.state.lock().unwrap().stubborn.insert(pid);
        self
    }

    pub fn fail_snapshots(&self) -> &Self {
        self.state.lock().unwrap().fail_snapshot = true;
        self
    }

    #[must_use]
    pub fn terminated(&self) -> Vec<u32> {
        self.state.lock().unwrap().terminated.clone()
    }
}

impl ProcessSource for FakeProcessSource {
    fn snapshot(&self) -> testwarden_core::Result<Vec<ProcessRecord>> {
        let state = self.state.lock().unwrap();
        if state.fail_snapshot {
            return Err(testwarden_core::Error::ProcessScan(
                "ps exited with status 1".to_string(),
            ));
        }
        Ok(state
            .records
            .iter()
            .filter(|r| state.alive.contains(&r.pid))
            .cloned()
            .collect())
    }

    fn terminate(&self, pid: u32) -> TerminationRequest {
        let mut state = self.state.lock().unwrap();
        if !state.alive.contains(&pid) {
            return TerminationRequest::AlreadyGone;
        }
        state.terminated.push(pid);
        if !state.stubborn.contains(&pid) {
            state.alive.remove(&pid);
        }
        TerminationRequest::Sent
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.state.lock().unwrap().alive.contains(&pid)
    }

    fn current_pid(&self) -> u32 {
        SELF_PID
    }
}

/// Memory probe with a fixed reading.
pub struct FixedMemory(pub Option<f64>);

impl MemoryProbe for FixedMemory {
    fn used_percent(&self) -> Option<f64> {
        self.0
    }
}
