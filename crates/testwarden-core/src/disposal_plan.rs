//! Disposal strategy selection.
//!
//! Maps a resource's type signature to a [`ResourceCategory`] and the ordered
//! [`DisposalPlan`] for that category. Grid-like and list-like controls are
//! known to raise from stale data-binding callbacks during teardown, so their
//! plans unbind data and clear item collections before the generic steps.
//!
//! | Category | Steps between the common prologue and final dispose |
//! |----------|------------------------------------------------------|
//! | grid     | clear data source, clear items, detach events        |
//! | list     | clear data source, clear items, detach events        |
//! | generic  | detach events                                        |
//!
//! Every plan opens with suppress-finalizer and remove-from-parent and ends
//! with final-dispose. Selection is pure and total.

use serde::{Deserialize, Serialize};

use crate::resource::{Disposable, StepResult};

/// Abstract teardown step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisposalStep {
    SuppressFinalizer,
    RemoveFromParent,
    ClearDataSource,
    ClearItems,
    DetachEvents,
    FinalDispose,
}

impl std::fmt::Display for DisposalStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SuppressFinalizer => write!(f, "suppress_finalizer"),
            Self::RemoveFromParent => write!(f, "remove_from_parent"),
            Self::ClearDataSource => write!(f, "clear_data_source"),
            Self::ClearItems => write!(f, "clear_items"),
            Self::DetachEvents => write!(f, "detach_events"),
            Self::FinalDispose => write!(f, "final_dispose"),
        }
    }
}

impl DisposalStep {
    /// Invoke the matching capability on a resource.
    pub fn apply(self, resource: &dyn Disposable) -> StepResult {
        match self {
            Self::SuppressFinalizer => resource.suppress_finalizer(),
            Self::RemoveFromParent => resource.remove_from_parent(),
            Self::ClearDataSource => resource.clear_bound_data(),
            Self::ClearItems => resource.clear_items(),
            Self::DetachEvents => resource.detach_events(),
            Self::FinalDispose => resource.dispose(),
        }
    }
}

/// Known resource categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceCategory {
    Grid,
    List,
    Generic,
}

impl std::fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Grid => write!(f, "grid"),
            Self::List => write!(f, "list"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

const GRID_STEPS: &[DisposalStep] = &[
    DisposalStep::SuppressFinalizer,
    DisposalStep::RemoveFromParent,
    DisposalStep::ClearDataSource,
    DisposalStep::ClearItems,
    DisposalStep::DetachEvents,
    DisposalStep::FinalDispose,
];

const LIST_STEPS: &[DisposalStep] = GRID_STEPS;

const GENERIC_STEPS: &[DisposalStep] = &[
    DisposalStep::SuppressFinalizer,
    DisposalStep::RemoveFromParent,
    DisposalStep::DetachEvents,
    DisposalStep::FinalDispose,
];

impl ResourceCategory {
    #[must_use]
    pub const fn plan(self) -> DisposalPlan {
        let steps = match self {
            Self::Grid => GRID_STEPS,
            Self::List => LIST_STEPS,
            Self::Generic => GENERIC_STEPS,
        };
        DisposalPlan {
            category: self,
            steps,
        }
    }
}

/// Ordered, immutable sequence of steps for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisposalPlan {
    pub category: ResourceCategory,
    steps: &'static [DisposalStep],
}

impl DisposalPlan {
    #[must_use]
    pub fn steps(&self) -> &'static [DisposalStep] {
        self.steps
    }

    /// Steps the disposer runs before recursing into children: everything
    /// except the prologue and the terminal dispose.
    pub fn body(&self) -> impl Iterator<Item = DisposalStep> + 'static {
        self.steps.iter().copied().filter(|step| {
            !matches!(
                step,
                DisposalStep::SuppressFinalizer
                    | DisposalStep::RemoveFromParent
                    | DisposalStep::FinalDispose
            )
        })
    }

    #[must_use]
    pub fn contains(&self, step: DisposalStep) -> bool {
        self.steps.contains(&step)
    }
}

/// Default grid-like type-name markers (matched case-insensitively).
pub const DEFAULT_GRID_MARKERS: &[&str] = &["grid", "table", "sheet"];

/// Default list-like type-name markers (matched case-insensitively).
pub const DEFAULT_LIST_MARKERS: &[&str] = &["list", "combo", "tree"];

/// Picks a disposal plan from a type signature.
#[derive(Debug, Clone)]
pub struct DisposalStrategySelector {
    grid_markers: Vec<String>,
    list_markers: Vec<String>,
}

impl Default for DisposalStrategySelector {
    fn default() -> Self {
        Self {
            grid_markers: DEFAULT_GRID_MARKERS.iter().map(|m| (*m).to_string()).collect(),
            list_markers: DEFAULT_LIST_MARKERS.iter().map(|m| (*m).to_string()).collect(),
        }
    }
}

impl DisposalStrategySelector {
    /// Default markers extended with extra ones from configuration.
    #[must_use]
    pub fn with_extra_markers(grid: &[String], list: &[String]) -> Self {
        let mut selector = Self::default();
        selector
            .grid_markers
            .extend(grid.iter().map(|m| m.to_lowercase()));
        selector
            .list_markers
            .extend(list.iter().map(|m| m.to_lowercase()));
        selector
    }

    /// Classify a type signature. Grid markers win over list markers, so
    /// `ListGridView` is treated as a grid.
    #[must_use]
    pub fn categorize(&self, type_signature: &str) -> ResourceCategory {
        let lower = type_signature.to_lowercase();
        if self
            .grid_markers
            .iter()
            .any(|m| !m.is_empty() && lower.contains(m.as_str()))
        {
            ResourceCategory::Grid
        } else if self
            .list_markers
            .iter()
            .any(|m| !m.is_empty() && lower.contains(m.as_str()))
        {
            ResourceCategory::List
        } else {
            ResourceCategory::Generic
        }
    }

    #[must_use]
    pub fn select(&self, type_signature: &str) -> DisposalPlan {
        self.categorize(type_signature).plan()
    }
}
