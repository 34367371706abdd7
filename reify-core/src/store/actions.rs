//! Action layer.
//!
//! Actions are named mutator functions bound to the store's root node. They
//! live in their own namespace, outside the wrapped tree, and call the same
//! node operations any other caller would. The store imposes no locking or
//! queuing around them: an async caller that clones the root node mutates
//! immediately at whatever point it resumes.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use super::error::StoreError;
use super::node::Node;
use super::value::Value;

/// A named mutator: receives the store root and positional arguments.
pub type ActionFn = Arc<dyn Fn(&Node, &[Value]) -> Result<Value, StoreError> + Send + Sync>;

/// Wrap a closure as an [`ActionFn`].
pub fn action<F>(f: F) -> ActionFn
where
    F: Fn(&Node, &[Value]) -> Result<Value, StoreError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Accessor over the attached action namespace, bound to the root node.
#[derive(Clone)]
pub struct Actions {
    root: Node,
    table: Arc<IndexMap<String, ActionFn>>,
}

impl Actions {
    pub(crate) fn new(root: Node) -> Self {
        Self {
            root,
            table: Arc::new(IndexMap::new()),
        }
    }

    /// New namespace with `entries` merged in; later attachments shadow
    /// earlier names.
    pub(crate) fn extend<K, I>(&self, entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ActionFn)>,
    {
        let mut table = (*self.table).clone();
        for (name, f) in entries {
            table.insert(name.into(), f);
        }
        Self {
            root: self.root.clone(),
            table: Arc::new(table),
        }
    }

    /// Call the named action with the store root and `args`.
    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<Value, StoreError> {
        let f = self
            .table
            .get(name)
            .ok_or_else(|| StoreError::UnknownAction(name.to_string()))?;
        debug!(action = name, "action dispatch");
        f(&self.root, args)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    /// Attached action names, in attachment order.
    pub fn names(&self) -> Vec<String> {
        self.table.keys().cloned().collect()
    }
}
