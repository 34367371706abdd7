//! Dependency Graph Runtime
//!
//! The runtime owns the global dependency graph: which subscribers (computed
//! values and effects) depend on which sources (cells and computed outputs).
//!
//! Update propagation is push-staleness / pull-value:
//!
//! 1. A cell write calls [`notify_write`] with the cell's source id.
//! 2. Every computed dependent is marked stale. Marking a computed stale
//!    cascades a notification for the computed's own source id, so chains of
//!    computeds are invalidated without evaluating anything.
//! 3. Every effect dependent is scheduled. Outside a batch it runs at once;
//!    inside a batch it is queued and coalesced until the outermost batch
//!    exits.
//! 4. Values are recomputed lazily, on the next read of each stale computed.
//!
//! The registry holds weak references so dropping a computed or effect
//! retires it; dead entries are pruned during notification. Locks are never
//! held while subscriber code runs.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::RwLock;
use tracing::trace;

/// Counter for source ids. Cells and computed outputs share one id space so
/// the dependents map can treat them uniformly.
static SOURCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Allocate a fresh source id.
pub(crate) fn next_source_id() -> u64 {
    SOURCE_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Unique identifier for a subscriber (a computed value or an effect).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// What a subscriber wants done after a dependency of it changed.
pub(crate) enum Invalidation {
    /// The subscriber went stale and its own readers must be told; carries
    /// the subscriber's source id (computed values).
    Cascade(u64),
    /// The subscriber wants to run (effects).
    Schedule,
    /// Nothing to do: already stale, or disposed.
    Quiet,
}

/// A computation registered with the runtime.
pub(crate) trait Dependent: Send + Sync {
    fn subscriber_id(&self) -> SubscriberId;

    /// React to a dependency change. Must not run user code.
    fn invalidate(&self) -> Invalidation;

    /// Execute the subscriber (effects only; computeds are pull-driven and
    /// never scheduled).
    fn run(&self);
}

static REGISTRY: OnceLock<RwLock<HashMap<SubscriberId, Weak<dyn Dependent>>>> = OnceLock::new();
static DEPENDENTS: OnceLock<RwLock<HashMap<u64, HashSet<SubscriberId>>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<SubscriberId, Weak<dyn Dependent>>> {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

fn dependents() -> &'static RwLock<HashMap<u64, HashSet<SubscriberId>>> {
    DEPENDENTS.get_or_init(|| RwLock::new(HashMap::new()))
}

thread_local! {
    /// Batch nesting depth and the effects queued while batching.
    static BATCH: RefCell<BatchState> = RefCell::new(BatchState::default());
}

#[derive(Default)]
struct BatchState {
    depth: usize,
    pending: Vec<SubscriberId>,
}

/// Register a subscriber. The runtime keeps only a weak reference.
pub(crate) fn register(dependent: Arc<dyn Dependent>) {
    let id = dependent.subscriber_id();
    registry().write().insert(id, Arc::downgrade(&dependent));
}

/// Record that `subscriber` read `source`.
pub(crate) fn record_read(source: u64, subscriber: SubscriberId) {
    dependents()
        .write()
        .entry(source)
        .or_default()
        .insert(subscriber);
}

/// Forget every read previously recorded for `subscriber`. Called before a
/// computed or effect re-runs, so dependencies reflect the latest execution.
pub(crate) fn clear_reads(subscriber: SubscriberId) {
    let mut map = dependents().write();
    map.retain(|_, subs| {
        subs.remove(&subscriber);
        !subs.is_empty()
    });
}

/// Drop a subscriber from the graph entirely.
pub(crate) fn retire(subscriber: SubscriberId) {
    registry().write().remove(&subscriber);
    clear_reads(subscriber);
}

/// Notify every dependent of `source` that it changed.
///
/// Computed dependents go stale and cascade; effect dependents are scheduled.
pub(crate) fn notify_write(source: u64) {
    let subscriber_ids: Vec<SubscriberId> = {
        let map = dependents().read();
        match map.get(&source) {
            Some(subs) => subs.iter().copied().collect(),
            None => return,
        }
    };

    let mut live: Vec<Arc<dyn Dependent>> = Vec::with_capacity(subscriber_ids.len());
    let mut dead: Vec<SubscriberId> = Vec::new();
    {
        let reg = registry().read();
        for id in subscriber_ids {
            match reg.get(&id).and_then(Weak::upgrade) {
                Some(dep) => live.push(dep),
                None => dead.push(id),
            }
        }
    }
    if !dead.is_empty() {
        prune(&dead);
    }

    trace!(source, dependents = live.len(), "notify write");

    for dependent in live {
        match dependent.invalidate() {
            Invalidation::Cascade(derived_source) => notify_write(derived_source),
            Invalidation::Schedule => schedule(dependent),
            Invalidation::Quiet => {}
        }
    }
}

fn prune(dead: &[SubscriberId]) {
    let mut reg = registry().write();
    for id in dead {
        reg.remove(id);
    }
    drop(reg);
    let mut map = dependents().write();
    map.retain(|_, subs| {
        for id in dead {
            subs.remove(id);
        }
        !subs.is_empty()
    });
}

/// Run an effect now, or queue it if a batch is open on this thread.
fn schedule(dependent: Arc<dyn Dependent>) {
    let queued = BATCH.with(|batch| {
        let mut batch = batch.borrow_mut();
        if batch.depth == 0 {
            return false;
        }
        let id = dependent.subscriber_id();
        if !batch.pending.contains(&id) {
            batch.pending.push(id);
        }
        true
    });

    if !queued {
        dependent.run();
    }
}

/// Group writes so effect subscribers are notified once, after `f` returns,
/// instead of once per write. Writes inside the batch are applied to storage
/// immediately; reads inside the same batch observe up-to-date values. Only
/// effect notification is deferred and coalesced. Batches nest; the queue
/// drains when the outermost batch exits.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    BATCH.with(|batch| batch.borrow_mut().depth += 1);
    let result = f();
    let pending = BATCH.with(|batch| {
        let mut batch = batch.borrow_mut();
        batch.depth -= 1;
        if batch.depth == 0 {
            std::mem::take(&mut batch.pending)
        } else {
            Vec::new()
        }
    });

    for id in pending {
        let dependent = registry().read().get(&id).and_then(Weak::upgrade);
        if let Some(dependent) = dependent {
            dependent.run();
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct Probe {
        id: SubscriberId,
        source: Option<u64>,
        stale: AtomicBool,
        runs: AtomicUsize,
    }

    impl Probe {
        fn lazy(source: u64) -> Arc<Self> {
            Arc::new(Self {
                id: SubscriberId::new(),
                source: Some(source),
                stale: AtomicBool::new(false),
                runs: AtomicUsize::new(0),
            })
        }

        fn eager() -> Arc<Self> {
            Arc::new(Self {
                id: SubscriberId::new(),
                source: None,
                stale: AtomicBool::new(false),
                runs: AtomicUsize::new(0),
            })
        }
    }

    impl Dependent for Probe {
        fn subscriber_id(&self) -> SubscriberId {
            self.id
        }

        fn invalidate(&self) -> Invalidation {
            match self.source {
                Some(source) => {
                    if self.stale.swap(true, Ordering::SeqCst) {
                        Invalidation::Quiet
                    } else {
                        Invalidation::Cascade(source)
                    }
                }
                None => Invalidation::Schedule,
            }
        }

        fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn notify_marks_lazy_dependents_stale() {
        let source = next_source_id();
        let probe = Probe::lazy(next_source_id());
        register(probe.clone());
        record_read(source, probe.id);

        notify_write(source);
        assert!(probe.stale.load(Ordering::SeqCst));
        assert_eq!(probe.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn staleness_cascades_through_derived_sources() {
        let cell = next_source_id();
        let inner = Probe::lazy(next_source_id());
        let outer = Probe::lazy(next_source_id());
        register(inner.clone());
        register(outer.clone());

        record_read(cell, inner.id);
        record_read(inner.source.unwrap(), outer.id);

        notify_write(cell);
        assert!(inner.stale.load(Ordering::SeqCst));
        assert!(outer.stale.load(Ordering::SeqCst));
    }

    #[test]
    fn eager_dependents_run_immediately_outside_batch() {
        let source = next_source_id();
        let probe = Probe::eager();
        register(probe.clone());
        record_read(source, probe.id);

        notify_write(source);
        assert_eq!(probe.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn batch_coalesces_eager_runs() {
        let a = next_source_id();
        let b = next_source_id();
        let probe = Probe::eager();
        register(probe.clone());
        record_read(a, probe.id);
        record_read(b, probe.id);

        batch(|| {
            notify_write(a);
            notify_write(b);
            notify_write(a);
            assert_eq!(probe.runs.load(Ordering::SeqCst), 0);
        });

        assert_eq!(probe.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_batches_drain_at_outermost_exit() {
        let source = next_source_id();
        let probe = Probe::eager();
        register(probe.clone());
        record_read(source, probe.id);

        batch(|| {
            batch(|| notify_write(source));
            assert_eq!(probe.runs.load(Ordering::SeqCst), 0);
        });
        assert_eq!(probe.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_reads_detaches_subscriber() {
        let source = next_source_id();
        let probe = Probe::eager();
        register(probe.clone());
        record_read(source, probe.id);

        clear_reads(probe.id);
        notify_write(source);
        assert_eq!(probe.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let source = next_source_id();
        let probe = Probe::eager();
        let id = probe.id;
        register(probe.clone());
        record_read(source, id);
        drop(probe);

        notify_write(source);
        assert!(!registry().read().contains_key(&id));
    }
}
