//! Cell Implementation
//!
//! A Cell is the atomic reactive primitive: observable storage for one
//! value.
//!
//! 1. Reading a cell inside a tracking context (a computed or an effect)
//!    registers the current computation as a dependent.
//!
//! 2. Writing a cell a value that differs from the stored one notifies every
//!    dependent through the runtime. Writing an equal value is a no-op, so a
//!    dependency version only advances when the value actually changes.
//!
//! Cells are cheap to clone; clones share the same storage and identity.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use super::context;
use super::runtime;

/// A reactive cell holding a value of type `T`.
///
/// # Example
///
/// ```rust,ignore
/// let count = Cell::new(0);
///
/// // Read the value (tracked inside computeds/effects)
/// let value = count.get();
///
/// // Update the value (notifies dependents)
/// count.set(5);
/// ```
pub struct Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Source id in the dependency graph.
    id: u64,

    /// The current value.
    value: Arc<RwLock<T>>,
}

impl<T> Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a new cell with the given initial value.
    pub fn new(value: T) -> Self {
        Self {
            id: runtime::next_source_id(),
            value: Arc::new(RwLock::new(value)),
        }
    }

    /// The cell's source id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the current value.
    ///
    /// Inside a computed or effect this registers the current computation as
    /// a dependent of the cell.
    pub fn get(&self) -> T {
        context::on_read(self.id);
        self.value.read().clone()
    }

    /// Get the current value without recording a dependency.
    pub fn peek(&self) -> T {
        self.value.read().clone()
    }

    /// Set a new value and notify dependents.
    ///
    /// Writing a value equal to the stored one changes nothing and notifies
    /// nobody.
    pub fn set(&self, value: T) {
        let changed = {
            let mut stored = self.value.write();
            if *stored == value {
                false
            } else {
                *stored = value;
                true
            }
        };

        if changed {
            trace!(cell = self.id, "cell write");
            runtime::notify_write(self.id);
        }
    }

    /// Update the value using a function of the current value.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let next = f(&self.value.read());
        self.set(next);
    }
}

impl<T> Clone for Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            value: Arc::clone(&self.value),
        }
    }
}

impl<T> Debug for Cell<T>
where
    T: Clone + PartialEq + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.id)
            .field("value", &self.peek())
            .finish()
    }
}
