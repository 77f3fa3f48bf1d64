//! Process classification for the orphan watchdog.
//!
//! Rules, first match wins:
//! 1. the current process is [`ProcessClassification::SelfProcess`];
//! 2. a unit marker in the environment, or a command line matching a
//!    configured marker, is [`ProcessClassification::KnownTest`];
//! 3. no signature at all is [`ProcessClassification::Unknown`];
//! 4. anything else is [`ProcessClassification::Foreign`].
//!
//! Matching is deliberately conservative: a process we cannot attribute is
//! never eligible for termination.

use serde::{Deserialize, Serialize};

use crate::config::WatchdogConfig;
use crate::process_scan::ProcessRecord;

/// How a known-test process was launched; drives the age policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchKind {
    /// Application build/run spawned by a test.
    BuildRun,
    /// Long-lived test runner host.
    TestHost,
}

impl std::fmt::Display for LaunchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuildRun => write!(f, "build_run"),
            Self::TestHost => write!(f, "test_host"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "class", content = "launch")]
pub enum ProcessClassification {
    #[serde(rename = "self")]
    SelfProcess,
    KnownTest(LaunchKind),
    Foreign,
    Unknown,
}

impl ProcessClassification {
    #[must_use]
    pub const fn launch_kind(self) -> Option<LaunchKind> {
        match self {
            Self::KnownTest(kind) => Some(kind),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProcessClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SelfProcess => write!(f, "self"),
            Self::KnownTest(kind) => write!(f, "known_test({kind})"),
            Self::Foreign => write!(f, "foreign"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Marker-based classifier.
#[derive(Debug, Clone, Default)]
pub struct ProcessClassifier {
    app_markers: Vec<String>,
    runner_markers: Vec<String>,
}

impl ProcessClassifier {
    /// Markers are matched case-insensitively as command-line substrings;
    /// blank markers are ignored.
    #[must_use]
    pub fn new<A, R>(app_markers: A, runner_markers: R) -> Self
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        R: IntoIterator,
        R::Item: AsRef<str>,
    {
        Self {
            app_markers: normalize(app_markers),
            runner_markers: normalize(runner_markers),
        }
    }

    #[must_use]
    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self::new(&config.app_markers, &config.test_runner_markers)
    }

    #[must_use]
    pub fn classify(&self, record: &ProcessRecord, current_pid: u32) -> ProcessClassification {
        if record.pid == current_pid {
            return ProcessClassification::SelfProcess;
        }

        let signature = record
            .signature
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let marked = record
            .owning_test
            .as_deref()
            .is_some_and(|unit| !unit.trim().is_empty());

        if let Some(signature) = signature {
            let lower = signature.to_lowercase();
            if self.runner_markers.iter().any(|m| lower.contains(m.as_str())) {
                return ProcessClassification::KnownTest(LaunchKind::TestHost);
            }
            if self.app_markers.iter().any(|m| lower.contains(m.as_str())) {
                return ProcessClassification::KnownTest(LaunchKind::BuildRun);
            }
        }

        // Stamped by a test unit but not a recognized host: an app launch.
        if marked {
            return ProcessClassification::KnownTest(LaunchKind::BuildRun);
        }

        match signature {
            None => ProcessClassification::Unknown,
            Some(_) => ProcessClassification::Foreign,
        }
    }
}

fn normalize<I>(markers: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    markers
        .into_iter()
        .map(|m| m.as_ref().trim().to_lowercase())
        .filter(|m| !m.is_empty())
        .collect()
}
