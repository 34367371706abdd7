//! Reify Core
//!
//! This crate provides the core runtime for the Reify reactive deep-state
//! container. It implements:
//!
//! - Reactive primitives (cells, computed values, effects, batching)
//! - A deep-state store that wraps a nested data tree in observable nodes
//! - Lazily-cached computed properties with automatic invalidation
//! - Strict/permissive schema enforcement with per-subtree shallow opt-out
//! - An action namespace bound to the store root
//! - Structural serialization that omits derived state
//!
//! # Architecture
//!
//! The crate is organized into two modules:
//!
//! - `reactive`: the dependency-graph engine — cells, computed values,
//!   effects, and batching. The store consumes it through a narrow contract
//!   (`get`/`set`/`peek`, `batch`, `effect`), so the engine is swappable.
//! - `store`: the deep-state container — node tree, mutation policy,
//!   actions, escape hatch, and serialization.
//!
//! # Example
//!
//! ```rust,ignore
//! use reify_core::{reify, Value};
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
//! state.write("count", Value::from(5))?;
//! assert_eq!(state.read("double")?.into_value(), Some(Value::Int(10)));
//! ```

pub mod reactive;
pub mod store;

pub use reactive::{batch, effect, untracked, Cell, ComputeState, Computed, Effect};
pub use store::{
    action, reify, reify_with, shallow, ActionFn, Actions, CellView, ComputedFn,
    DerivationError, Node, NodeKind, Opaque, Options, Policy, Read, Store, StoreError, Value,
};
