//! Resource model: the capability surface a disposable UI object exposes to
//! the teardown machinery.
//!
//! A resource is any object a test unit creates and must tear down again:
//! forms, grids, list controls, their child controls. The registry never owns
//! them; it keeps a `Weak<dyn Disposable>` and calls back through the
//! capability methods below when a teardown runs.
//!
//! Category-specific cleanup (unbinding a grid's data source, clearing a
//! list's items) is an explicit method with a no-op default, so a resource
//! only implements the capabilities it actually has.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable identity of a registered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub u64);

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "res-{}", self.0)
    }
}

/// Failure of a single disposal step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisposeError {
    /// The resource reported a failure for this step.
    #[error("{0}")]
    Failed(String),

    /// The step panicked; the payload message is preserved when it was a string.
    #[error("step panicked: {0}")]
    Panicked(String),

    /// The owning thread never picked the step up.
    #[error("owning thread did not run the step within {timeout_ms} ms")]
    MarshalTimeout { timeout_ms: u64 },
}

impl DisposeError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Result of one capability call.
pub type StepResult = Result<(), DisposeError>;

/// Capability interface implemented by every managed resource.
///
/// All methods except [`dispose`](Disposable::dispose) default to no-ops.
/// Implementations must tolerate being called from the owning thread only;
/// the disposer guarantees that routing.
pub trait Disposable: Send + Sync {
    /// Runtime type signature used to pick a disposal plan (e.g. `VehicleGridView`).
    fn type_signature(&self) -> &str;

    /// Whether the object was already disposed outside the registry.
    fn is_disposed(&self) -> bool {
        false
    }

    /// Unbind any data source feeding the control.
    fn clear_bound_data(&self) -> StepResult {
        Ok(())
    }

    /// Clear row/item collections.
    fn clear_items(&self) -> StepResult {
        Ok(())
    }

    /// Detach event handlers wired to or from the control.
    fn detach_events(&self) -> StepResult {
        Ok(())
    }

    /// Suppress any deferred finalization hook.
    fn suppress_finalizer(&self) -> StepResult {
        Ok(())
    }

    /// Remove the control from its parent's child collection.
    fn remove_from_parent(&self) -> StepResult {
        Ok(())
    }

    /// Final release of the object.
    fn dispose(&self) -> StepResult;
}

/// Shared handle type the registry hands out weak references to.
pub type SharedResource = Arc<dyn Disposable>;

/// Lifecycle state of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisposalState {
    /// Registered and not yet torn down.
    Live,
    /// Claimed by a disposer; steps are running.
    Disposing,
    /// Final dispose succeeded.
    Disposed,
    /// Final dispose failed; entry kept for diagnostics.
    Faulted,
}

impl DisposalState {
    /// Whether a disposer may still claim this entry.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Live)
    }
}

impl std::fmt::Display for DisposalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Disposing => write!(f, "disposing"),
            Self::Disposed => write!(f, "disposed"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

/// Identity of the underlying allocation, used to detect re-registration.
pub(crate) fn object_key(resource: &SharedResource) -> usize {
    Arc::as_ptr(resource).cast::<()>() as usize
}
