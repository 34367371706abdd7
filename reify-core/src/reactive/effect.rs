//! Effect Implementation
//!
//! An Effect is a side-effecting subscriber: it runs once on creation to
//! establish its dependencies, then re-runs whenever any of them changes.
//! Inside [`batch`](super::runtime::batch) re-runs are coalesced and happen
//! once, after the outermost batch exits.
//!
//! Dependencies are re-collected on every run, so an effect that branches
//! only observes the cells its latest execution actually read.
//!
//! The [`Effect`] handle returned by [`effect`] is the disposer: calling
//! [`dispose`](Effect::dispose) — or dropping the last handle — retires the
//! subscription.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::trace;

use super::context;
use super::runtime::{self, Dependent, Invalidation, SubscriberId};

/// A running side-effecting subscription. Doubles as its own disposer.
pub struct Effect {
    inner: Arc<Inner>,
}

struct Inner {
    subscriber: SubscriberId,
    action: Box<dyn Fn() + Send + Sync>,
    disposed: AtomicBool,
}

impl Inner {
    fn execute(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        runtime::clear_reads(self.subscriber);
        let _frame = context::observe(self.subscriber);
        (self.action)();
    }
}

impl Dependent for Inner {
    fn subscriber_id(&self) -> SubscriberId {
        self.subscriber
    }

    fn invalidate(&self) -> Invalidation {
        if self.disposed.load(Ordering::SeqCst) {
            Invalidation::Quiet
        } else {
            Invalidation::Schedule
        }
    }

    fn run(&self) {
        self.execute();
    }
}

/// Subscribe `action` to every reactive value it reads. Runs immediately,
/// then again after each change. The returned handle is the disposer.
pub fn effect<F>(action: F) -> Effect
where
    F: Fn() + Send + Sync + 'static,
{
    let inner = Arc::new(Inner {
        subscriber: SubscriberId::new(),
        action: Box::new(action),
        disposed: AtomicBool::new(false),
    });
    runtime::register(inner.clone());
    inner.execute();
    Effect { inner }
}

impl Effect {
    /// Stop the effect. It will not run again.
    pub fn dispose(&self) {
        if !self.inner.disposed.swap(true, Ordering::SeqCst) {
            trace!("effect disposed");
            runtime::retire(self.inner.subscriber);
        }
    }

    /// Whether the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }
}

impl Clone for Effect {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{batch, Cell, Computed};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn effect_runs_on_creation() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_probe = runs.clone();

        let _effect = effect(move || {
            runs_probe.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn effect_reruns_on_dependency_write() {
        let cell = Cell::new(0);
        let seen = Arc::new(AtomicUsize::new(usize::MAX));

        let cell_read = cell.clone();
        let seen_probe = seen.clone();
        let _effect = effect(move || {
            seen_probe.store(cell_read.get() as usize, Ordering::SeqCst);
        });

        assert_eq!(seen.load(Ordering::SeqCst), 0);

        cell.set(42);
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn effect_observes_computed_values() {
        let cell = Cell::new(1);

        let cell_read = cell.clone();
        let tripled = Computed::new(move || cell_read.get() * 3);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_probe = seen.clone();
        let _effect = effect(move || {
            seen_probe.store(tripled.get() as usize, Ordering::SeqCst);
        });

        assert_eq!(seen.load(Ordering::SeqCst), 3);

        cell.set(5);
        assert_eq!(seen.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn disposed_effect_does_not_run() {
        let cell = Cell::new(0);
        let runs = Arc::new(AtomicUsize::new(0));

        let cell_read = cell.clone();
        let runs_probe = runs.clone();
        let handle = effect(move || {
            cell_read.get();
            runs_probe.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);

        handle.dispose();
        assert!(handle.is_disposed());

        cell.set(1);
        cell.set(2);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn batched_writes_notify_once() {
        let a = Cell::new(0);
        let b = Cell::new(0);
        let runs = Arc::new(AtomicUsize::new(0));

        let (a_read, b_read) = (a.clone(), b.clone());
        let runs_probe = runs.clone();
        let _effect = effect(move || {
            a_read.get();
            b_read.get();
            runs_probe.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);

        batch(|| {
            a.set(1);
            b.set(2);
            a.set(3);
            // Storage is updated immediately inside the batch.
            assert_eq!(a.peek(), 3);
            assert_eq!(runs.load(Ordering::SeqCst), 1);
        });

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn effect_retracks_after_branch_switch() {
        let gate = Cell::new(true);
        let left = Cell::new(0);
        let right = Cell::new(0);
        let runs = Arc::new(AtomicUsize::new(0));

        let (gate_read, left_read, right_read) = (gate.clone(), left.clone(), right.clone());
        let runs_probe = runs.clone();
        let _effect = effect(move || {
            if gate_read.get() {
                left_read.get();
            } else {
                right_read.get();
            }
            runs_probe.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);

        gate.set(false);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // `left` is no longer observed.
        left.set(99);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        right.set(7);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
