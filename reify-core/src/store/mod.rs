//! Reactive Deep-State Container
//!
//! [`reify`] wraps a plain nested [`Value`] tree so that every primitive
//! leaf becomes an independently observable cell, derived values declared
//! with [`Value::computed`] are lazily evaluated and cached, and structural
//! mutation is governed by an explicit schema policy.
//!
//! # Construction
//!
//! The tree is wrapped bottom-up: each plain object or array becomes a
//! [`Node`] owning one slot per property. After the whole tree exists the
//! root node is anchored into every descendant, so computed definitions can
//! cross-reference any part of the tree through their `root` argument.
//! Definitions are not evaluated until first read, strictly after anchoring.
//!
//! # Example
//!
//! ```rust,ignore
//! use reify_core::store::{reify, Value};
//!
//! let store = reify(Value::object([
//!     ("count", Value::from(2)),
//!     ("double", Value::computed(|this, _root| {
//!         let count = this.read("count")?.into_value().and_then(|v| v.as_i64());
//!         Ok(Value::from(count.unwrap_or(0) * 2))
//!     })),
//! ]))?;
//!
//! let state = store.state();
//! assert_eq!(state.read("double")?.into_value(), Some(Value::Int(4)));
//! state.write("count", Value::from(3))?;
//! assert_eq!(state.read("double")?.into_value(), Some(Value::Int(6)));
//! ```

mod actions;
mod error;
mod node;
mod policy;
mod snapshot;
mod value;

pub use actions::{action, ActionFn, Actions};
pub use error::{DerivationError, StoreError};
pub use node::{CellView, Node, NodeKind, Read, CELL_VIEW_PREFIX};
pub use policy::{Options, Policy};
pub use value::{shallow, ComputedFn, Opaque, Value};

use tracing::debug;

/// A wrapped state tree: the root node, its mutation policy, and an action
/// namespace.
#[derive(Clone)]
pub struct Store {
    root: Node,
    actions: Actions,
}

/// Wrap `initial` with the default strict policy.
pub fn reify(initial: Value) -> Result<Store, StoreError> {
    reify_with(initial, Options::default())
}

/// Wrap `initial` with explicit options.
///
/// The initial tree must be a plain object; any other shape fails with
/// [`StoreError::Validation`]. The policy is fixed for the store's lifetime.
pub fn reify_with(initial: Value, options: Options) -> Result<Store, StoreError> {
    let map = match initial {
        Value::Object(map) => map,
        other => {
            return Err(StoreError::Validation(format!(
                "initial tree must be a plain object, got {}",
                other.kind_name()
            )))
        }
    };
    let policy: Policy = options.into();
    let root = Node::from_object(map, policy)?;
    root.bind_root(&root);
    debug!(?policy, "store constructed");
    Ok(Store {
        actions: Actions::new(root.clone()),
        root,
    })
}

impl Store {
    /// The root node. Every read and write flows through node operations.
    pub fn state(&self) -> &Node {
        &self.root
    }

    /// The store's schema-enforcement level.
    pub fn policy(&self) -> Policy {
        self.root.policy()
    }

    /// Bind named actions to the root node. Returns the store with the
    /// actions merged into its namespace; later attachments shadow earlier
    /// names.
    pub fn attach<K, I>(mut self, entries: I) -> Store
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ActionFn)>,
    {
        self.actions = self.actions.extend(entries);
        self
    }

    /// The attached action namespace.
    pub fn actions(&self) -> &Actions {
        &self.actions
    }

    /// Structural snapshot of the whole tree (computed properties omitted).
    pub fn snapshot(&self) -> Value {
        self.root.snapshot()
    }

    /// Snapshot rendered as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        self.snapshot().to_json()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("policy", &self.policy())
            .field("root", &self.root)
            .finish()
    }
}
