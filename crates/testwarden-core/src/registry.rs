//! Resource registry.
//!
//! One [`ResourceRegistry`] lives for the whole test process behind a
//! [`RegistryHandle`]. Test units register the UI objects they create; the
//! registry only holds `Weak` references, so an object dropped by its test is
//! pruned rather than leaked.
//!
//! All mutable state sits behind one mutex. The lock is never held while
//! calling into a resource: disposal claims an entry under the lock
//! (`Live -> Disposing`), releases it, runs the plan, then re-acquires it to
//! record the outcome.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};

use crate::affinity::Affinity;
use crate::config::DisposalConfig;
use crate::disposal_plan::{DisposalStrategySelector, ResourceCategory};
use crate::disposer::{DisposeOutcome, DisposerOptions, SafeDisposer};
use crate::resource::{Disposable, DisposalState, ResourceId, SharedResource, object_key};

/// Process-wide shared registry.
pub type RegistryHandle = Arc<ResourceRegistry>;

struct Entry {
    resource: Weak<dyn Disposable>,
    key: usize,
    affinity: Affinity,
    type_signature: String,
    category: ResourceCategory,
    parent: Option<ResourceId>,
    children: Vec<ResourceId>,
    state: DisposalState,
    last_error: Option<String>,
}

impl Entry {
    fn is_alive(&self) -> bool {
        self.resource.strong_count() > 0
    }
}

#[derive(Default)]
struct ResourceTable {
    entries: HashMap<ResourceId, Entry>,
    by_key: HashMap<usize, ResourceId>,
    next_id: u64,
}

impl ResourceTable {
    fn remove(&mut self, id: ResourceId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        if self.by_key.get(&entry.key) == Some(&id) {
            self.by_key.remove(&entry.key);
        }
        if let Some(parent) = entry.parent {
            if let Some(parent_entry) = self.entries.get_mut(&parent) {
                parent_entry.children.retain(|child| *child != id);
            }
        }
        for child in &entry.children {
            if let Some(child_entry) = self.entries.get_mut(child) {
                child_entry.parent = None;
            }
        }
        Some(entry)
    }

    /// Whether linking `child` under `parent` would close a loop.
    fn would_cycle(&self, child: ResourceId, parent: ResourceId) -> bool {
        let mut cursor = Some(parent);
        let mut hops = 0usize;
        while let Some(current) = cursor {
            if current == child || hops > self.entries.len() {
                return true;
            }
            cursor = self.entries.get(&current).and_then(|e| e.parent);
            hops += 1;
        }
        false
    }
}

/// Everything the disposer needs after a successful claim.
pub(crate) struct Claimed {
    pub resource: SharedResource,
    pub affinity: Affinity,
    pub category: ResourceCategory,
    pub type_signature: String,
}

pub(crate) enum Claim {
    Claimed(Claimed),
    AlreadyDisposed,
    Expired,
    Unknown,
}

/// Diagnostic view of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub id: ResourceId,
    pub type_signature: String,
    pub category: ResourceCategory,
    pub state: DisposalState,
    pub parent: Option<ResourceId>,
    pub children: Vec<ResourceId>,
    pub alive: bool,
    pub owner: Option<String>,
    pub last_error: Option<String>,
}

/// Outcome of a [`ResourceRegistry::teardown_all`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    /// Another teardown was already running; nothing was done.
    pub skipped: bool,
    /// Successfully disposed resources, in disposal order.
    pub disposed: Vec<ResourceId>,
    /// Resources whose final dispose failed.
    pub faulted: Vec<ResourceId>,
    /// Entries found collected when claimed.
    pub expired: usize,
    /// Non-terminal step failures (logged and skipped).
    pub step_failures: usize,
    /// Steps run on the caller because the owner thread was gone.
    pub fallbacks: usize,
    /// Dead entries removed after the pass.
    pub pruned: usize,
}

impl TeardownReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Number of resources the pass touched.
    #[must_use]
    pub fn events(&self) -> usize {
        self.disposed.len() + self.faulted.len()
    }
}

/// Capacity reclaimed by [`ResourceRegistry::compact`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionStats {
    pub before_len: usize,
    pub before_capacity: usize,
    pub after_len: usize,
    pub after_capacity: usize,
}

impl CompactionStats {
    #[must_use]
    pub fn freed_slots(self) -> usize {
        self.before_capacity.saturating_sub(self.after_capacity)
    }
}

struct InProgressGuard<'a>(&'a AtomicBool);

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Weakly-held table of live test resources.
pub struct ResourceRegistry {
    table: Mutex<ResourceTable>,
    selector: DisposalStrategySelector,
    options: DisposerOptions,
    teardown_in_progress: AtomicBool,
    shut_down: AtomicBool,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new(DisposalStrategySelector::default(), DisposerOptions::default())
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("len", &self.len())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl ResourceRegistry {
    #[must_use]
    pub fn new(selector: DisposalStrategySelector, options: DisposerOptions) -> Self {
        Self {
            table: Mutex::new(ResourceTable::default()),
            selector,
            options,
            teardown_in_progress: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn from_config(config: &DisposalConfig) -> Self {
        Self::new(
            DisposalStrategySelector::with_extra_markers(&config.grid_markers, &config.list_markers),
            DisposerOptions::from_config(config),
        )
    }

    /// Wrap in the shared handle passed to test units.
    #[must_use]
    pub fn into_handle(self) -> RegistryHandle {
        Arc::new(self)
    }

    fn lock(&self) -> MutexGuard<'_, ResourceTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn options(&self) -> &DisposerOptions {
        &self.options
    }

    /// Register a root resource.
    ///
    /// Returns `None` for an already-disposed object or after shutdown.
    /// Registering the same object twice returns the existing id.
    pub fn register(&self, resource: &SharedResource, affinity: Affinity) -> Option<ResourceId> {
        self.register_inner(resource, affinity, None)
    }

    /// Register a resource under `parent`.
    ///
    /// An unknown or non-live parent, or a link that would form a cycle, is
    /// dropped with a warning and the resource becomes a root. Re-registering
    /// an existing root with a parent adopts it under that parent.
    pub fn register_child(
        &self,
        resource: &SharedResource,
        affinity: Affinity,
        parent: ResourceId,
    ) -> Option<ResourceId> {
        self.register_inner(resource, affinity, Some(parent))
    }

    /// Register from a weak handle; an expired handle is a no-op.
    pub fn register_weak(
        &self,
        resource: &Weak<dyn Disposable>,
        affinity: Affinity,
    ) -> Option<ResourceId> {
        let strong = resource.upgrade()?;
        self.register_inner(&strong, affinity, None)
    }

    fn register_inner(
        &self,
        resource: &SharedResource,
        affinity: Affinity,
        parent: Option<ResourceId>,
    ) -> Option<ResourceId> {
        if self.is_shut_down() {
            tracing::warn!(
                type_signature = resource.type_signature(),
                "registration after registry shutdown rejected"
            );
            return None;
        }
        if resource.is_disposed() {
            tracing::debug!(
                type_signature = resource.type_signature(),
                "ignoring registration of disposed resource"
            );
            return None;
        }
        let type_signature = resource.type_signature().to_string();
        let category = self.selector.categorize(&type_signature);
        let key = object_key(resource);

        let mut table = self.lock();

        if let Some(&existing) = table.by_key.get(&key) {
            let stale = table.entries.get(&existing).is_none_or(|e| !e.is_alive());
            if stale {
                // Allocation reused after the old object was dropped.
                table.remove(existing);
            } else {
                if let Some(parent) = parent {
                    adopt(&mut table, existing, parent);
                }
                return Some(existing);
            }
        }

        table.next_id += 1;
        let id = ResourceId(table.next_id);
        let parent = parent.and_then(|parent| accept_parent(&table, id, parent));
        if let Some(parent) = parent {
            if let Some(parent_entry) = table.entries.get_mut(&parent) {
                parent_entry.children.push(id);
            }
        }
        table.entries.insert(
            id,
            Entry {
                resource: Arc::downgrade(resource),
                key,
                affinity,
                type_signature,
                category,
                parent,
                children: Vec::new(),
                state: DisposalState::Live,
                last_error: None,
            },
        );
        table.by_key.insert(key, id);
        drop(table);

        tracing::trace!(resource_id = %id, parent = ?parent, %category, "resource registered");
        Some(id)
    }

    /// Dispose one resource (and its subtree) immediately.
    pub fn dispose(&self, id: ResourceId) -> DisposeOutcome {
        SafeDisposer::new(self).dispose(id)
    }

    /// Tear down every registered resource, most recently registered first.
    ///
    /// Idempotent: a second pass finds nothing live and does nothing. A call
    /// made while another teardown is running returns a skipped report.
    pub fn teardown_all(&self) -> TeardownReport {
        if self.teardown_in_progress.swap(true, Ordering::AcqRel) {
            tracing::debug!("teardown already in progress, skipping");
            return TeardownReport::skipped();
        }
        let _guard = InProgressGuard(&self.teardown_in_progress);

        let mut ids: Vec<ResourceId> = {
            let table = self.lock();
            table
                .entries
                .iter()
                .filter(|(_, entry)| entry.state.is_live())
                .map(|(id, _)| *id)
                .collect()
        };
        ids.sort_unstable_by(|a, b| b.cmp(a));

        let mut disposer = SafeDisposer::new(self);
        for id in ids {
            disposer.dispose(id);
        }
        let mut report = disposer.into_report();
        report.pruned = self.prune_dead();

        if report.events() > 0 || report.expired > 0 {
            tracing::info!(
                disposed = report.disposed.len(),
                faulted = report.faulted.len(),
                expired = report.expired,
                step_failures = report.step_failures,
                fallbacks = report.fallbacks,
                "teardown complete"
            );
        }
        report
    }

    /// Remove entries whose object has been dropped.
    pub fn prune_dead(&self) -> usize {
        let mut table = self.lock();
        let dead: Vec<ResourceId> = table
            .entries
            .iter()
            .filter(|(_, entry)| entry.state != DisposalState::Disposing && !entry.is_alive())
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            table.remove(*id);
        }
        drop(table);
        if !dead.is_empty() {
            tracing::debug!(pruned = dead.len(), "pruned dead registry entries");
        }
        dead.len()
    }

    /// Shrink table capacity left over from churn.
    pub fn compact(&self) -> CompactionStats {
        let mut table = self.lock();
        let before_len = table.entries.len();
        let before_capacity = table.entries.capacity();
        if table.entries.capacity() > table.entries.len().saturating_mul(2) {
            table.entries.shrink_to_fit();
            table.by_key.shrink_to_fit();
        }
        for entry in table.entries.values_mut() {
            entry.children.shrink_to_fit();
        }
        CompactionStats {
            before_len,
            before_capacity,
            after_len: table.entries.len(),
            after_capacity: table.entries.capacity(),
        }
    }

    /// Tear everything down once and reject later registrations.
    ///
    /// Returns `None` when the registry was already shut down.
    pub fn shutdown(&self) -> Option<TeardownReport> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return None;
        }
        let report = self.teardown_all();
        tracing::debug!(remaining = self.len(), "registry shut down");
        Some(report)
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn state(&self, id: ResourceId) -> Option<DisposalState> {
        self.lock().entries.get(&id).map(|entry| entry.state)
    }

    /// All entries, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ResourceSnapshot> {
        let table = self.lock();
        let mut snapshot: Vec<ResourceSnapshot> = table
            .entries
            .iter()
            .map(|(id, entry)| ResourceSnapshot {
                id: *id,
                type_signature: entry.type_signature.clone(),
                category: entry.category,
                state: entry.state,
                parent: entry.parent,
                children: entry.children.clone(),
                alive: entry.is_alive(),
                owner: entry.affinity.owner_name().map(str::to_string),
                last_error: entry.last_error.clone(),
            })
            .collect();
        snapshot.sort_by_key(|s| s.id);
        snapshot
    }

    /// Entries left behind by a failed final dispose.
    #[must_use]
    pub fn faulted(&self) -> Vec<ResourceSnapshot> {
        self.snapshot()
            .into_iter()
            .filter(|s| s.state == DisposalState::Faulted)
            .collect()
    }

    // Disposer bookkeeping. Each call takes and releases the lock.

    pub(crate) fn claim(&self, id: ResourceId) -> Claim {
        let mut table = self.lock();
        let Some(entry) = table.entries.get_mut(&id) else {
            return Claim::Unknown;
        };
        if !entry.state.is_live() {
            return Claim::AlreadyDisposed;
        }
        let Some(resource) = entry.resource.upgrade() else {
            table.remove(id);
            return Claim::Expired;
        };
        entry.state = DisposalState::Disposing;
        Claim::Claimed(Claimed {
            resource,
            affinity: entry.affinity.clone(),
            category: entry.category,
            type_signature: entry.type_signature.clone(),
        })
    }

    pub(crate) fn unlink_from_parent(&self, id: ResourceId) {
        let mut table = self.lock();
        let Some(parent) = table.entries.get_mut(&id).and_then(|e| e.parent.take()) else {
            return;
        };
        if let Some(parent_entry) = table.entries.get_mut(&parent) {
            parent_entry.children.retain(|child| *child != id);
        }
    }

    pub(crate) fn children_of(&self, id: ResourceId) -> Vec<ResourceId> {
        self.lock()
            .entries
            .get(&id)
            .map(|e| e.children.clone())
            .unwrap_or_default()
    }

    pub(crate) fn mark_disposed(&self, id: ResourceId) {
        self.lock().remove(id);
    }

    pub(crate) fn mark_faulted(&self, id: ResourceId, error: String) {
        if let Some(entry) = self.lock().entries.get_mut(&id) {
            entry.state = DisposalState::Faulted;
            entry.last_error = Some(error);
        }
    }
}

fn accept_parent(table: &ResourceTable, child: ResourceId, parent: ResourceId) -> Option<ResourceId> {
    match table.entries.get(&parent) {
        None => {
            tracing::warn!(resource_id = %child, parent = %parent, "unknown parent, registering as root");
            None
        }
        Some(entry) if !entry.state.is_live() => {
            tracing::warn!(
                resource_id = %child,
                parent = %parent,
                parent_state = %entry.state,
                "parent is not live, registering as root"
            );
            None
        }
        Some(_) if table.would_cycle(child, parent) => {
            tracing::warn!(resource_id = %child, parent = %parent, "parent link would form a cycle, dropped");
            None
        }
        Some(_) => Some(parent),
    }
}

fn adopt(table: &mut ResourceTable, id: ResourceId, parent: ResourceId) {
    let current = table.entries.get(&id).and_then(|e| e.parent);
    if current == Some(parent) {
        return;
    }
    if current.is_some() {
        tracing::debug!(resource_id = %id, "resource already has a parent, keeping it");
        return;
    }
    let Some(parent) = accept_parent(table, id, parent) else {
        return;
    };
    if let Some(entry) = table.entries.get_mut(&id) {
        entry.parent = Some(parent);
    }
    if let Some(parent_entry) = table.entries.get_mut(&parent) {
        parent_entry.children.push(id);
    }
}

/// Ids reachable from `root` (inclusive), for diagnostics and tests.
#[must_use]
pub fn subtree(snapshot: &[ResourceSnapshot], root: ResourceId) -> Vec<ResourceId> {
    let by_id: HashMap<ResourceId, &ResourceSnapshot> =
        snapshot.iter().map(|s| (s.id, s)).collect();
    let mut seen = HashSet::new();
    let mut stack = vec![root];
    let mut out = Vec::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(node) = by_id.get(&id) {
            out.push(id);
            stack.extend(node.children.iter().rev().copied());
        }
    }
    out
}
