//! Safe disposal of one resource subtree.
//!
//! [`SafeDisposer`] runs a resource's [`DisposalPlan`](crate::disposal_plan::DisposalPlan)
//! and never propagates a failure: step errors and panics are caught, logged
//! and counted, and the next step still runs. Order for one resource:
//!
//! 1. suppress finalizer
//! 2. remove from parent (resource capability and registry link)
//! 3. category body steps (clear data source, clear items, detach events)
//! 4. children, fully, in registration order
//! 5. final dispose
//!
//! Steps for an owner-bound resource are marshaled through its
//! [`OwnerToken`](crate::affinity::OwnerToken).

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::affinity::{Affinity, MarshalError, panic_message};
use crate::config::DisposalConfig;
use crate::disposal_plan::DisposalStep;
use crate::registry::{Claim, Claimed, ResourceRegistry, TeardownReport};
use crate::resource::{DisposeError, ResourceId, StepResult};

/// Disposer tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisposerOptions {
    /// Tree depth past which a walk logs a warning.
    pub max_depth: usize,
    /// How long a marshaled step may wait to start.
    pub marshal_timeout: Duration,
}

impl Default for DisposerOptions {
    fn default() -> Self {
        Self::from_config(&DisposalConfig::default())
    }
}

impl DisposerOptions {
    #[must_use]
    pub fn from_config(config: &DisposalConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            marshal_timeout: config.marshal_timeout(),
        }
    }
}

/// Result of disposing one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisposeOutcome {
    /// Final dispose succeeded; entry removed.
    Disposed,
    /// Final dispose failed; entry kept as faulted.
    Faulted,
    /// Already disposed, disposing, or faulted. Nothing ran.
    AlreadyDisposed,
    /// Object was collected before it could be claimed.
    Expired,
    /// No such entry.
    Unknown,
}

impl std::fmt::Display for DisposeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disposed => write!(f, "disposed"),
            Self::Faulted => write!(f, "faulted"),
            Self::AlreadyDisposed => write!(f, "already_disposed"),
            Self::Expired => write!(f, "expired"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

enum Frame {
    Enter { id: ResourceId, depth: usize },
    Finish { id: ResourceId, claimed: Claimed },
}

enum Entered {
    Walk {
        claimed: Claimed,
        children: Vec<ResourceId>,
    },
    Done(DisposeOutcome),
}

/// Disposes resources registered in one registry, accumulating a report.
pub struct SafeDisposer<'a> {
    registry: &'a ResourceRegistry,
    options: DisposerOptions,
    visited: HashSet<ResourceId>,
    report: TeardownReport,
}

impl<'a> SafeDisposer<'a> {
    #[must_use]
    pub fn new(registry: &'a ResourceRegistry) -> Self {
        Self {
            registry,
            options: *registry.options(),
            visited: HashSet::new(),
            report: TeardownReport::default(),
        }
    }

    /// Dispose `root` and its subtree. Never panics, never errors.
    ///
    /// The walk is an explicit post-order stack: a node's final dispose is
    /// queued below its children, so it runs only after every child has
    /// been processed, however deep the tree.
    pub fn dispose(&mut self, root: ResourceId) -> DisposeOutcome {
        let mut stack = vec![Frame::Enter { id: root, depth: 0 }];
        let mut root_outcome = DisposeOutcome::AlreadyDisposed;

        while let Some(frame) = stack.pop() {
            let (id, outcome) = match frame {
                Frame::Enter { id, depth } => match self.enter(id, depth) {
                    Entered::Walk { claimed, children } => {
                        stack.push(Frame::Finish { id, claimed });
                        stack.extend(children.into_iter().rev().map(|child| Frame::Enter {
                            id: child,
                            depth: depth + 1,
                        }));
                        continue;
                    }
                    Entered::Done(outcome) => (id, outcome),
                },
                Frame::Finish { id, claimed } => (id, self.finish(id, &claimed)),
            };
            if id == root {
                root_outcome = outcome;
            }
        }
        root_outcome
    }

    /// Everything disposed so far through this disposer.
    #[must_use]
    pub fn into_report(self) -> TeardownReport {
        self.report
    }

    /// Claim `id` and run every step up to its children.
    fn enter(&mut self, id: ResourceId, depth: usize) -> Entered {
        if !self.visited.insert(id) {
            return Entered::Done(DisposeOutcome::AlreadyDisposed);
        }

        let claimed = match self.registry.claim(id) {
            Claim::Claimed(claimed) => claimed,
            Claim::AlreadyDisposed => return Entered::Done(DisposeOutcome::AlreadyDisposed),
            Claim::Expired => {
                self.report.expired += 1;
                tracing::debug!(resource_id = %id, "resource collected before disposal");
                return Entered::Done(DisposeOutcome::Expired);
            }
            Claim::Unknown => return Entered::Done(DisposeOutcome::Unknown),
        };

        if claimed.resource.is_disposed() {
            self.registry.unlink_from_parent(id);
            self.registry.mark_disposed(id);
            tracing::debug!(resource_id = %id, "resource disposed externally");
            return Entered::Done(DisposeOutcome::AlreadyDisposed);
        }

        if depth == self.options.max_depth {
            tracing::warn!(
                resource_id = %id,
                max_depth = self.options.max_depth,
                "resource tree deeper than max_depth"
            );
        }

        self.run_step(id, &claimed, DisposalStep::SuppressFinalizer);
        self.run_step(id, &claimed, DisposalStep::RemoveFromParent);
        self.registry.unlink_from_parent(id);

        for step in claimed.category.plan().body() {
            self.run_step(id, &claimed, step);
        }

        let children = self.registry.children_of(id);
        Entered::Walk { claimed, children }
    }

    /// Final dispose, once every child has been processed.
    fn finish(&mut self, id: ResourceId, claimed: &Claimed) -> DisposeOutcome {
        match self.execute(claimed, DisposalStep::FinalDispose) {
            Ok(()) => {
                self.registry.mark_disposed(id);
                self.report.disposed.push(id);
                tracing::debug!(
                    resource_id = %id,
                    type_signature = %claimed.type_signature,
                    category = %claimed.category,
                    "resource disposed"
                );
                DisposeOutcome::Disposed
            }
            Err(err) => {
                self.registry.mark_faulted(id, err.to_string());
                self.report.faulted.push(id);
                tracing::warn!(
                    resource_id = %id,
                    type_signature = %claimed.type_signature,
                    error = %err,
                    "final dispose failed, resource left faulted"
                );
                DisposeOutcome::Faulted
            }
        }
    }

    /// Run a non-terminal step; failures are logged and counted.
    fn run_step(&mut self, id: ResourceId, claimed: &Claimed, step: DisposalStep) {
        if let Err(err) = self.execute(claimed, step) {
            self.report.step_failures += 1;
            tracing::warn!(
                resource_id = %id,
                type_signature = %claimed.type_signature,
                %step,
                error = %err,
                "disposal step failed, continuing"
            );
        }
    }

    fn execute(&mut self, claimed: &Claimed, step: DisposalStep) -> StepResult {
        match &claimed.affinity {
            Affinity::Any => catch_unwind(AssertUnwindSafe(|| step.apply(&*claimed.resource)))
                .unwrap_or_else(|payload| Err(DisposeError::Panicked(panic_message(&*payload)))),
            Affinity::Owned(token) => {
                let resource = Arc::clone(&claimed.resource);
                match token.run(move || step.apply(&*resource), self.options.marshal_timeout) {
                    Ok(marshaled) => {
                        if marshaled.is_fallback() {
                            self.report.fallbacks += 1;
                        }
                        marshaled.into_inner()
                    }
                    Err(MarshalError::Timeout { timeout_ms }) => {
                        Err(DisposeError::MarshalTimeout { timeout_ms })
                    }
                    Err(MarshalError::Panicked(message)) => Err(DisposeError::Panicked(message)),
                }
            }
        }
    }
}
