//! Computed Implementation
//!
//! A Computed is a cached derived value that re-evaluates only when a
//! dependency changes.
//!
//! 1. Creation stores the computation without running it.
//!
//! 2. The first read evaluates the computation inside an observer frame,
//!    records every cell and computed it reads, caches the result, and
//!    transitions to `Valid`.
//!
//! 3. When any recorded dependency writes a new value, the computed goes
//!    `Stale` and cascades the notification to its own readers. No value is
//!    produced until the next read.
//!
//! 4. A read of a stale computed clears the old dependency set, re-evaluates,
//!    and caches the fresh result.
//!
//! A computed is itself a source: reading it inside another computed or an
//! effect records a dependency on its output, so chains compose without any
//! special handling.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use super::context;
use super::runtime::{self, Dependent, Invalidation, SubscriberId};

/// Cache state of a computed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeState {
    /// Never evaluated.
    Uncomputed,

    /// The cached value is up-to-date.
    Valid,

    /// A dependency changed since the cache was filled; the next read
    /// re-evaluates.
    Stale,
}

/// A lazily-evaluated, cached derivation.
pub struct Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    /// Source id under which readers of this computed are recorded.
    source: u64,

    /// Subscriber id under which this computed's own reads are recorded.
    subscriber: SubscriberId,

    compute: Box<dyn Fn() -> T + Send + Sync>,

    state: RwLock<ComputeState>,

    cached: RwLock<Option<T>>,
}

impl<T> Dependent for Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn subscriber_id(&self) -> SubscriberId {
        self.subscriber
    }

    fn invalidate(&self) -> Invalidation {
        let mut state = self.state.write();
        match *state {
            ComputeState::Valid => {
                *state = ComputeState::Stale;
                trace!(source = self.source, "computed stale");
                Invalidation::Cascade(self.source)
            }
            ComputeState::Uncomputed | ComputeState::Stale => Invalidation::Quiet,
        }
    }

    fn run(&self) {
        // Computeds are pull-driven; the runtime never schedules them.
        debug_assert!(false, "computed scheduled as if it were an effect");
    }
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new computed with the given computation function.
    ///
    /// The computation does not run until the first read.
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let inner = Arc::new(Inner {
            source: runtime::next_source_id(),
            subscriber: SubscriberId::new(),
            compute: Box::new(compute),
            state: RwLock::new(ComputeState::Uncomputed),
            cached: RwLock::new(None),
        });
        runtime::register(inner.clone());
        Self { inner }
    }

    /// The computed's source id.
    pub fn id(&self) -> u64 {
        self.inner.source
    }

    /// Get the current value, re-evaluating if the cache is stale.
    ///
    /// Inside another computed or an effect this also records a dependency
    /// on this computed's output.
    pub fn get(&self) -> T {
        context::on_read(self.inner.source);
        self.resolve()
    }

    /// Get the current value without recording a dependency for the caller.
    ///
    /// The computation itself still tracks its own dependencies if it has to
    /// re-evaluate.
    pub fn peek(&self) -> T {
        self.resolve()
    }

    /// Current cache state.
    pub fn state(&self) -> ComputeState {
        *self.inner.state.read()
    }

    fn resolve(&self) -> T {
        if *self.inner.state.read() == ComputeState::Valid {
            return self
                .inner
                .cached
                .read()
                .clone()
                .expect("valid computed holds a cached value");
        }

        // Evaluate inside an observer frame so every read lands in the
        // dependency graph. Old reads are cleared first: a branch the
        // previous evaluation took may be unreachable now.
        runtime::clear_reads(self.inner.subscriber);
        let value = {
            let _frame = context::observe(self.inner.subscriber);
            (self.inner.compute)()
        };

        *self.inner.cached.write() = Some(value.clone());
        *self.inner.state.write() = ComputeState::Valid;
        trace!(source = self.inner.source, "computed refreshed");
        value
    }
}

impl<T> Clone for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Computed<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.inner.source)
            .field("state", &self.state())
            .finish()
    }
}
