//! Nodes and slots.
//!
//! A [`Node`] wraps one plain object or array from the wrapped tree. It owns
//! an ordered mapping from key to [`Slot`], where each slot is either a
//! primitive cell, a nested child node, a raw opaque cell (shallow), or a
//! computed definition with its lazily-created cache.
//!
//! The mutation contract lives in four methods — [`read`](Node::read),
//! [`write`](Node::write), [`has`](Node::has), [`delete`](Node::delete) —
//! plus the array primitives [`push`](Node::push), [`pop`](Node::pop),
//! [`splice`](Node::splice) and [`set_len`](Node::set_len), each with its
//! own invalidation contract against the array's version cell.
//!
//! Reads are permissive (absent keys read as [`Read::Absent`] under either
//! policy); writes and deletes are policed. Key names prefixed with `$`
//! answer with the raw cell behind the property instead of its value.

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::reactive::{Cell, Computed};

use super::error::{DerivationError, StoreError};
use super::policy::Policy;
use super::value::{ComputedFn, Value};

/// Marker prefix for cell-view (escape hatch) keys.
pub const CELL_VIEW_PREFIX: char = '$';

/// Returns the property name behind a cell-view key, if `key` is one.
fn cell_view_target(key: &str) -> Option<&str> {
    key.strip_prefix(CELL_VIEW_PREFIX)
        .filter(|rest| !rest.is_empty())
}

/// Strict decimal array index.
fn parse_index(key: &str) -> Option<usize> {
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

/// The kind of plain value a node wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Object,
    Array,
}

/// One slot in a node's key→value table.
#[derive(Clone)]
enum Slot {
    /// Primitive leaf backed by a cell for its entire lifetime.
    Stored(Cell<Value>),

    /// Nested object/array backed by its own node.
    Child(Node),

    /// Shallow-marked value: cell-backed so replacing the whole reference is
    /// observed, contents never recursed into.
    Raw(Cell<Value>),

    /// Declared derivation plus its at-most-once cache.
    Derived(DerivedSlot),
}

#[derive(Clone)]
struct DerivedSlot {
    def: ComputedFn,
    cache: Arc<OnceLock<Computed<Result<Value, DerivationError>>>>,
}

impl DerivedSlot {
    fn new(def: ComputedFn) -> Self {
        Self {
            def,
            cache: Arc::new(OnceLock::new()),
        }
    }
}

enum Body {
    Object(IndexMap<String, Slot>),
    Array(ArrayBody),
}

struct ArrayBody {
    /// Sparse storage: `None` is a hole left by index deletion.
    items: Vec<Option<Slot>>,

    /// Bumped by exactly 1 for every shape change the cell mechanism cannot
    /// observe (deletion, append, remove-last, splice, length-assign, slot
    /// creation or replacement at an index). Indexed and `length` reads
    /// track it.
    version: Cell<u64>,
}

struct NodeInner {
    policy: Policy,
    /// Non-owning anchor to the store root, set exactly once after the whole
    /// tree exists.
    root: OnceLock<Weak<NodeInner>>,
    body: RwLock<Body>,
}

/// Wrapped representation of one plain object or array.
///
/// Cheap to clone; clones share identity and storage.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

/// Outcome of a [`Node::read`].
#[derive(Debug, Clone)]
pub enum Read {
    /// The key names neither a slot nor a computed definition.
    Absent,
    /// A primitive, raw opaque, or computed value.
    Value(Value),
    /// A nested node.
    Node(Node),
    /// The raw cell behind a `$`-prefixed key.
    Cell(CellView),
}

impl Read {
    pub fn is_absent(&self) -> bool {
        matches!(self, Read::Absent)
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Read::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_node(self) -> Option<Node> {
        match self {
            Read::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn into_cell(self) -> Option<CellView> {
        match self {
            Read::Cell(c) => Some(c),
            _ => None,
        }
    }
}

/// Escape-hatch handle over the cell behind a stored or computed property.
#[derive(Clone)]
pub enum CellView {
    /// Cell behind a stored (or raw opaque) property.
    Stored(Cell<Value>),
    /// Cache behind a computed property; read-only.
    Derived(Computed<Result<Value, DerivationError>>),
}

impl CellView {
    /// Current value; a tracked read, like reading the property itself.
    pub fn value(&self) -> Result<Value, StoreError> {
        match self {
            CellView::Stored(cell) => Ok(cell.get()),
            CellView::Derived(computed) => computed.get().map_err(StoreError::from),
        }
    }

    /// Current value without recording a dependency for the caller.
    pub fn peek(&self) -> Result<Value, StoreError> {
        match self {
            CellView::Stored(cell) => Ok(cell.peek()),
            CellView::Derived(computed) => computed.peek().map_err(StoreError::from),
        }
    }

    /// Set the stored value through the cell. Fails for derived cells, which
    /// only recompute from their definition.
    pub fn set(&self, value: Value) -> Result<(), StoreError> {
        match self {
            CellView::Stored(cell) => {
                cell.set(value);
                Ok(())
            }
            CellView::Derived(_) => Err(StoreError::SchemaViolation(
                "derived cell is read-only; it recomputes from its definition".to_string(),
            )),
        }
    }
}

impl fmt::Debug for CellView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellView::Stored(cell) => f.debug_tuple("Stored").field(cell).finish(),
            CellView::Derived(_) => write!(f, "Derived(..)"),
        }
    }
}

impl Node {
    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    pub(crate) fn from_object(
        map: IndexMap<String, Value>,
        policy: Policy,
    ) -> Result<Node, StoreError> {
        let mut slots = IndexMap::with_capacity(map.len());
        for (key, value) in map {
            if cell_view_target(&key).is_some() {
                return Err(StoreError::Validation(format!(
                    "property name `{key}` collides with the `{CELL_VIEW_PREFIX}` cell-view prefix"
                )));
            }
            slots.insert(key, build_slot(value, policy)?);
        }
        Ok(Self::with_body(policy, Body::Object(slots)))
    }

    pub(crate) fn from_array(items: Vec<Value>, policy: Policy) -> Result<Node, StoreError> {
        let mut slots = Vec::with_capacity(items.len());
        for value in items {
            slots.push(Some(build_slot(value, policy)?));
        }
        Ok(Self::with_body(
            policy,
            Body::Array(ArrayBody {
                items: slots,
                version: Cell::new(0),
            }),
        ))
    }

    fn with_body(policy: Policy, body: Body) -> Node {
        Node {
            inner: Arc::new(NodeInner {
                policy,
                root: OnceLock::new(),
                body: RwLock::new(body),
            }),
        }
    }

    /// Anchor this node and every descendant to the store root. Called once
    /// after full-tree construction, and again for subtrees grafted in by
    /// permissive writes.
    pub(crate) fn bind_root(&self, root: &Node) {
        let _ = self.inner.root.set(Arc::downgrade(&root.inner));
        for child in self.child_nodes() {
            child.bind_root(root);
        }
    }

    /// The store root, if this node is still anchored to a live store.
    pub fn root(&self) -> Option<Node> {
        self.inner
            .root
            .get()
            .and_then(Weak::upgrade)
            .map(|inner| Node { inner })
    }

    fn child_nodes(&self) -> Vec<Node> {
        match &*self.inner.body.read() {
            Body::Object(slots) => slots
                .values()
                .filter_map(|slot| match slot {
                    Slot::Child(node) => Some(node.clone()),
                    _ => None,
                })
                .collect(),
            Body::Array(array) => array
                .items
                .iter()
                .flatten()
                .filter_map(|slot| match slot {
                    Slot::Child(node) => Some(node.clone()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Build a slot for a freshly written value and anchor any new subtree.
    fn build_anchored_slot(&self, value: Value) -> Result<Slot, StoreError> {
        let slot = build_slot(value, self.inner.policy)?;
        if let Slot::Child(node) = &slot {
            if let Some(root) = self.root() {
                node.bind_root(&root);
            }
        }
        Ok(slot)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn kind(&self) -> NodeKind {
        match &*self.inner.body.read() {
            Body::Object(_) => NodeKind::Object,
            Body::Array(_) => NodeKind::Array,
        }
    }

    pub fn policy(&self) -> Policy {
        self.inner.policy
    }

    /// Property names of an object node, in declaration order. Empty for
    /// arrays.
    pub fn keys(&self) -> Vec<String> {
        match &*self.inner.body.read() {
            Body::Object(slots) => slots.keys().cloned().collect(),
            Body::Array(_) => Vec::new(),
        }
    }

    /// Element count of an array node (holes included). Untracked; the
    /// tracked equivalent is `read("length")`.
    pub fn len(&self) -> Option<usize> {
        match &*self.inner.body.read() {
            Body::Array(array) => Some(array.items.len()),
            Body::Object(_) => None,
        }
    }

    pub fn is_empty(&self) -> Option<bool> {
        self.len().map(|len| len == 0)
    }

    /// Current value of an array node's version cell. Untracked.
    pub fn shape_version(&self) -> Option<u64> {
        match &*self.inner.body.read() {
            Body::Array(array) => Some(array.version.peek()),
            Body::Object(_) => None,
        }
    }

    /// True iff `key` names a slot or a computed definition. Cell-view keys
    /// are not properties.
    pub fn has(&self, key: &str) -> bool {
        if cell_view_target(key).is_some() {
            return false;
        }
        match &*self.inner.body.read() {
            Body::Object(slots) => slots.contains_key(key),
            Body::Array(array) => {
                if key == "length" {
                    return true;
                }
                match parse_index(key) {
                    Some(index) => array.items.get(index).is_some_and(Option::is_some),
                    None => false,
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Read a property.
    ///
    /// Absent keys read as [`Read::Absent`] under either policy. A
    /// `$`-prefixed key answers with the raw cell behind the property. A
    /// computed property evaluates lazily; a failing definition surfaces the
    /// same [`StoreError::Derivation`] on every read until a dependency
    /// changes.
    pub fn read(&self, key: &str) -> Result<Read, StoreError> {
        if let Some(name) = cell_view_target(key) {
            return Ok(self.read_cell_view(name));
        }

        enum Lookup {
            Slot(Option<Slot>),
            // Index reads depend on array shape: after a splice or pop the
            // same index can name a different slot, which no cell write
            // announces. `length` reads depend on shape by definition.
            Indexed(Option<Slot>, Cell<u64>),
            Length(i64, Cell<u64>),
        }

        let lookup = {
            let body = self.inner.body.read();
            match &*body {
                Body::Object(slots) => Lookup::Slot(slots.get(key).cloned()),
                Body::Array(array) => {
                    if key == "length" {
                        Lookup::Length(array.items.len() as i64, array.version.clone())
                    } else {
                        match parse_index(key) {
                            Some(index) => Lookup::Indexed(
                                array.items.get(index).cloned().flatten(),
                                array.version.clone(),
                            ),
                            None => Lookup::Slot(None),
                        }
                    }
                }
            }
        };

        let slot = match lookup {
            Lookup::Slot(slot) => slot,
            Lookup::Indexed(slot, version) => {
                version.get();
                slot
            }
            Lookup::Length(len, version) => {
                version.get();
                return Ok(Read::Value(Value::Int(len)));
            }
        };

        match slot {
            None => Ok(Read::Absent),
            Some(slot) => self.realize(slot),
        }
    }

    fn read_cell_view(&self, name: &str) -> Read {
        let slot = {
            let body = self.inner.body.read();
            match &*body {
                Body::Object(slots) => slots.get(name).cloned(),
                Body::Array(array) => parse_index(name)
                    .and_then(|index| array.items.get(index).cloned())
                    .flatten(),
            }
        };
        match slot {
            Some(Slot::Stored(cell)) | Some(Slot::Raw(cell)) => {
                Read::Cell(CellView::Stored(cell))
            }
            Some(Slot::Derived(derived)) => {
                Read::Cell(CellView::Derived(self.derived_cache(&derived)))
            }
            // No single cell stands behind a nested subtree.
            Some(Slot::Child(_)) | None => Read::Absent,
        }
    }

    fn realize(&self, slot: Slot) -> Result<Read, StoreError> {
        match slot {
            Slot::Stored(cell) | Slot::Raw(cell) => Ok(Read::Value(cell.get())),
            Slot::Child(node) => Ok(Read::Node(node)),
            Slot::Derived(derived) => self
                .derived_cache(&derived)
                .get()
                .map(Read::Value)
                .map_err(StoreError::from),
        }
    }

    /// The at-most-once cache behind a computed definition, bound to this
    /// node and the store root. Evaluation happens on read, strictly after
    /// root binding, so `root` is always valid when a definition runs.
    fn derived_cache(&self, derived: &DerivedSlot) -> Computed<Result<Value, DerivationError>> {
        derived
            .cache
            .get_or_init(|| {
                let def = derived.def.clone();
                let this = Arc::downgrade(&self.inner);
                Computed::new(move || {
                    let inner = this
                        .upgrade()
                        .ok_or_else(|| DerivationError::new("node detached from its store"))?;
                    let node = Node { inner };
                    let root = node
                        .root()
                        .ok_or_else(|| DerivationError::new("store root unavailable"))?;
                    def(&node, &root)
                })
            })
            .clone()
    }

    // ------------------------------------------------------------------
    // Write
    // ------------------------------------------------------------------

    /// Write a property.
    ///
    /// Primitive and raw slots take the new value through their cell. A
    /// nested non-shallow subtree can never be replaced under strict policy;
    /// permissive policy rebuilds the slot from the new value's shape.
    /// Absent keys are created under permissive policy only. Writes to
    /// `$`-prefixed keys always fail.
    pub fn write(&self, key: &str, value: Value) -> Result<(), StoreError> {
        if cell_view_target(key).is_some() {
            return Err(StoreError::SchemaViolation(format!(
                "cannot assign to cell view `{key}`; mutate through the cell's value accessor instead"
            )));
        }
        trace!(key, value = value.kind_name(), "node write");
        match self.kind() {
            NodeKind::Object => self.write_object(key, value),
            NodeKind::Array => self.write_array(key, value),
        }
    }

    fn write_object(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let existing = {
            let body = self.inner.body.read();
            match &*body {
                Body::Object(slots) => slots.get(key).cloned(),
                Body::Array(_) => unreachable!("object write dispatched to array body"),
            }
        };

        match existing {
            Some(Slot::Stored(cell)) | Some(Slot::Raw(cell)) => {
                reject_computed_payload(&value)?;
                cell.set(value);
                Ok(())
            }
            Some(Slot::Derived(_)) => Err(StoreError::SchemaViolation(format!(
                "cannot assign to computed property `{key}`"
            ))),
            Some(Slot::Child(_)) => {
                if !self.inner.policy.is_permissive() {
                    return Err(StoreError::SchemaViolation(format!(
                        "whole array/object replacement disallowed for `{key}`; \
                         mutate the nested value through its own properties"
                    )));
                }
                let slot = self.build_anchored_slot(value)?;
                match &mut *self.inner.body.write() {
                    Body::Object(slots) => {
                        slots.insert(key.to_string(), slot);
                    }
                    Body::Array(_) => unreachable!("object write dispatched to array body"),
                }
                Ok(())
            }
            None => {
                if !self.inner.policy.is_permissive() {
                    return Err(StoreError::SchemaViolation(format!(
                        "cannot add new property `{key}` under strict policy"
                    )));
                }
                let slot = self.build_anchored_slot(value)?;
                match &mut *self.inner.body.write() {
                    Body::Object(slots) => {
                        slots.insert(key.to_string(), slot);
                    }
                    Body::Array(_) => unreachable!("object write dispatched to array body"),
                }
                Ok(())
            }
        }
    }

    fn write_array(&self, key: &str, value: Value) -> Result<(), StoreError> {
        if key == "length" {
            let len = value
                .as_i64()
                .filter(|len| *len >= 0)
                .ok_or_else(|| {
                    StoreError::SchemaViolation(
                        "array length must be a non-negative integer".to_string(),
                    )
                })?;
            return self.set_len(len as usize);
        }

        let Some(index) = parse_index(key) else {
            return Err(StoreError::SchemaViolation(format!(
                "array properties are index-based; cannot write `{key}`"
            )));
        };

        let existing = {
            let body = self.inner.body.read();
            match &*body {
                Body::Array(array) => array.items.get(index).cloned().flatten(),
                Body::Object(_) => unreachable!("array write dispatched to object body"),
            }
        };

        match existing {
            Some(Slot::Stored(cell)) | Some(Slot::Raw(cell)) => {
                reject_computed_payload(&value)?;
                cell.set(value);
                Ok(())
            }
            Some(Slot::Derived(_)) => Err(StoreError::SchemaViolation(format!(
                "cannot assign to computed element {index}"
            ))),
            Some(Slot::Child(_)) => {
                if !self.inner.policy.is_permissive() {
                    return Err(StoreError::SchemaViolation(format!(
                        "whole array/object replacement disallowed for index {index}; \
                         mutate the nested value through its own properties"
                    )));
                }
                let slot = self.build_anchored_slot(value)?;
                self.place_array_slot(index, slot);
                Ok(())
            }
            None => {
                // Index assignment to a hole or past the end grows the array
                // in place; allowed under both policies.
                let slot = self.build_anchored_slot(value)?;
                self.place_array_slot(index, slot);
                Ok(())
            }
        }
    }

    /// Install `slot` at `index`, growing with holes as needed, then bump
    /// the version cell: the cell mechanism cannot see slot identity change.
    fn place_array_slot(&self, index: usize, slot: Slot) {
        {
            let mut body = self.inner.body.write();
            let Body::Array(array) = &mut *body else {
                unreachable!("array slot placement on object body");
            };
            if index >= array.items.len() {
                array.items.resize_with(index + 1, || None);
            }
            array.items[index] = Some(slot);
        }
        self.bump_version();
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a property.
    ///
    /// Absent keys and cell-view keys are no-op successes. Numeric array
    /// indices are always deletable: the element becomes a hole, length is
    /// unchanged, and the version cell increments by exactly 1. Declared
    /// object properties and computed definitions are deletable only under
    /// permissive policy.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        if cell_view_target(key).is_some() {
            // Deleting the hatch view never deletes the underlying property.
            return Ok(());
        }
        match self.kind() {
            NodeKind::Object => self.delete_object(key),
            NodeKind::Array => self.delete_array(key),
        }
    }

    fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        let present = {
            let body = self.inner.body.read();
            match &*body {
                Body::Object(slots) => slots.contains_key(key),
                Body::Array(_) => unreachable!("object delete dispatched to array body"),
            }
        };
        if !present {
            return Ok(());
        }
        if !self.inner.policy.is_permissive() {
            return Err(StoreError::SchemaViolation(format!(
                "cannot delete declared property `{key}` under strict policy"
            )));
        }
        debug!(key, "property removed");
        match &mut *self.inner.body.write() {
            Body::Object(slots) => {
                slots.shift_remove(key);
            }
            Body::Array(_) => unreachable!("object delete dispatched to array body"),
        }
        Ok(())
    }

    fn delete_array(&self, key: &str) -> Result<(), StoreError> {
        if key == "length" {
            return Err(StoreError::SchemaViolation(
                "cannot delete array length".to_string(),
            ));
        }
        let Some(index) = parse_index(key) else {
            // Arrays have no named properties; absent-key deletes are no-ops.
            return Ok(());
        };
        let removed = {
            let mut body = self.inner.body.write();
            let Body::Array(array) = &mut *body else {
                unreachable!("array delete dispatched to object body");
            };
            match array.items.get_mut(index) {
                Some(slot @ Some(_)) => {
                    *slot = None;
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.bump_version();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Array mutation primitives
    // ------------------------------------------------------------------

    /// Append an element. Version cell: +1.
    pub fn push(&self, value: Value) -> Result<(), StoreError> {
        self.require_array("push")?;
        let slot = self.build_anchored_slot(value)?;
        {
            let mut body = self.inner.body.write();
            let Body::Array(array) = &mut *body else {
                unreachable!("push on object body");
            };
            array.items.push(Some(slot));
        }
        self.bump_version();
        Ok(())
    }

    /// Remove the last element and return its plain value (`None` on an
    /// empty array, `Null` for a hole). Version cell: +1 unless empty.
    pub fn pop(&self) -> Result<Option<Value>, StoreError> {
        self.require_array("pop")?;
        let popped = {
            let mut body = self.inner.body.write();
            let Body::Array(array) = &mut *body else {
                unreachable!("pop on object body");
            };
            array.items.pop()
        };
        match popped {
            None => Ok(None),
            Some(slot) => {
                self.bump_version();
                Ok(Some(slot_plain_value(slot)))
            }
        }
    }

    /// Replace `delete_count` elements starting at `start` (both clamped to
    /// the current length) with `items`, returning the removed plain values.
    /// Version cell: +1 when anything was removed or inserted.
    pub fn splice(
        &self,
        start: usize,
        delete_count: usize,
        items: Vec<Value>,
    ) -> Result<Vec<Value>, StoreError> {
        self.require_array("splice")?;
        // Build every new slot before touching storage so a failing item
        // leaves the array untouched.
        let mut slots = Vec::with_capacity(items.len());
        for value in items {
            slots.push(Some(self.build_anchored_slot(value)?));
        }
        let inserted = !slots.is_empty();
        let removed: Vec<Option<Slot>> = {
            let mut body = self.inner.body.write();
            let Body::Array(array) = &mut *body else {
                unreachable!("splice on object body");
            };
            let start = start.min(array.items.len());
            let end = start.saturating_add(delete_count).min(array.items.len());
            array.items.splice(start..end, slots).collect()
        };
        if inserted || !removed.is_empty() {
            self.bump_version();
        }
        Ok(removed.into_iter().map(slot_plain_value).collect())
    }

    /// Assign the array length: truncate, or extend with holes. Version
    /// cell: +1 when the length changes.
    pub fn set_len(&self, len: usize) -> Result<(), StoreError> {
        self.require_array("set_len")?;
        let changed = {
            let mut body = self.inner.body.write();
            let Body::Array(array) = &mut *body else {
                unreachable!("set_len on object body");
            };
            if len == array.items.len() {
                false
            } else {
                if len < array.items.len() {
                    array.items.truncate(len);
                } else {
                    array.items.resize_with(len, || None);
                }
                true
            }
        };
        if changed {
            self.bump_version();
        }
        Ok(())
    }

    fn require_array(&self, op: &str) -> Result<(), StoreError> {
        match self.kind() {
            NodeKind::Array => Ok(()),
            NodeKind::Object => Err(StoreError::SchemaViolation(format!(
                "{op} requires an array node"
            ))),
        }
    }

    fn bump_version(&self) {
        let version = {
            match &*self.inner.body.read() {
                Body::Array(array) => array.version.clone(),
                Body::Object(_) => return,
            }
        };
        // Outside the body lock: the write runs effect subscribers.
        version.set(version.peek() + 1);
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// Structural snapshot: stored properties recursively, raw opaques
    /// as-is, computed properties omitted. Array holes snapshot as `Null`.
    /// Reads are tracked, so snapshotting inside an effect subscribes it to
    /// every stored leaf.
    pub fn snapshot(&self) -> Value {
        match &*self.inner.body.read() {
            Body::Object(slots) => {
                let mut map = IndexMap::with_capacity(slots.len());
                for (key, slot) in slots {
                    if let Some(value) = slot_snapshot(slot) {
                        map.insert(key.clone(), value);
                    }
                }
                Value::Object(map)
            }
            Body::Array(array) => {
                let items = array
                    .items
                    .iter()
                    .map(|slot| match slot {
                        None => Value::Null,
                        Some(slot) => slot_snapshot(slot).unwrap_or(Value::Null),
                    })
                    .collect();
                Value::Array(items)
            }
        }
    }
}

/// Computed definitions are declarations, not data; they never pass through
/// an existing cell.
fn reject_computed_payload(value: &Value) -> Result<(), StoreError> {
    match value {
        Value::Computed(_) => Err(StoreError::SchemaViolation(
            "computed definitions may only be introduced as new properties".to_string(),
        )),
        _ => Ok(()),
    }
}

fn build_slot(value: Value, policy: Policy) -> Result<Slot, StoreError> {
    match value {
        Value::Opaque(_) => Ok(Slot::Raw(Cell::new(value))),
        Value::Object(map) => Ok(Slot::Child(Node::from_object(map, policy)?)),
        Value::Array(items) => Ok(Slot::Child(Node::from_array(items, policy)?)),
        Value::Computed(def) => Ok(Slot::Derived(DerivedSlot::new(def))),
        primitive => Ok(Slot::Stored(Cell::new(primitive))),
    }
}

/// Plain value of a slot for pop/splice return values; derived slots have no
/// structural value.
fn slot_plain_value(slot: Option<Slot>) -> Value {
    match slot {
        None => Value::Null,
        Some(Slot::Stored(cell)) | Some(Slot::Raw(cell)) => cell.peek(),
        Some(Slot::Child(node)) => node.snapshot(),
        Some(Slot::Derived(_)) => Value::Null,
    }
}

fn slot_snapshot(slot: &Slot) -> Option<Value> {
    match slot {
        Slot::Stored(cell) | Slot::Raw(cell) => Some(cell.get()),
        Slot::Child(node) => Some(node.snapshot()),
        Slot::Derived(_) => None,
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner.body.read() {
            Body::Object(slots) => f
                .debug_struct("Node")
                .field("kind", &NodeKind::Object)
                .field("keys", &slots.keys().collect::<Vec<_>>())
                .finish(),
            Body::Array(array) => f
                .debug_struct("Node")
                .field("kind", &NodeKind::Array)
                .field("len", &array.items.len())
                .field("version", &array.version.peek())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::value::shallow;
    use crate::store::{reify, reify_with, Options};

    fn strict(tree: Value) -> Node {
        reify(tree).expect("valid tree").state().clone()
    }

    fn permissive(tree: Value) -> Node {
        reify_with(tree, Options { permissive: true })
            .expect("valid tree")
            .state()
            .clone()
    }

    fn read_value(node: &Node, key: &str) -> Value {
        node.read(key)
            .expect("read succeeds")
            .into_value()
            .expect("value read")
    }

    #[test]
    fn primitive_round_trip() {
        let node = strict(Value::object([("count", Value::from(1))]));
        node.write("count", Value::from(42)).unwrap();
        assert_eq!(read_value(&node, "count"), Value::Int(42));
    }

    #[test]
    fn absent_reads_are_permissive_even_under_strict_policy() {
        let node = strict(Value::object([("a", Value::from(1))]));
        assert!(node.read("missing").unwrap().is_absent());
    }

    #[test]
    fn strict_rejects_new_properties() {
        let node = strict(Value::object([("a", Value::from(1))]));
        let err = node.write("b", Value::from(2)).unwrap_err();
        assert!(matches!(err, StoreError::SchemaViolation(_)));
        assert!(node.read("b").unwrap().is_absent());
    }

    #[test]
    fn permissive_adds_new_properties() {
        let node = permissive(Value::object([("a", Value::from(1))]));
        node.write("b", Value::from(2)).unwrap();
        assert_eq!(read_value(&node, "b"), Value::Int(2));
        node.write("nested", Value::object([("x", Value::from(1))]))
            .unwrap();
        let nested = node.read("nested").unwrap().into_node().unwrap();
        assert_eq!(read_value(&nested, "x"), Value::Int(1));
    }

    #[test]
    fn subtree_replacement_fails_under_strict_policy() {
        let node = strict(Value::object([(
            "nested",
            Value::object([("x", Value::from(1))]),
        )]));
        let err = node
            .write("nested", Value::object([("y", Value::from(2))]))
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaViolation(_)));

        // Original subtree unchanged.
        let nested = node.read("nested").unwrap().into_node().unwrap();
        assert_eq!(read_value(&nested, "x"), Value::Int(1));
        assert!(nested.read("y").unwrap().is_absent());
    }

    #[test]
    fn subtree_replacement_allowed_under_permissive_policy() {
        let node = permissive(Value::object([(
            "nested",
            Value::object([("x", Value::from(1))]),
        )]));
        node.write("nested", Value::object([("y", Value::from(2))]))
            .unwrap();
        let nested = node.read("nested").unwrap().into_node().unwrap();
        assert!(nested.read("x").unwrap().is_absent());
        assert_eq!(read_value(&nested, "y"), Value::Int(2));
    }

    #[test]
    fn shallow_slot_allows_whole_replacement() {
        let node = strict(Value::object([(
            "blob",
            shallow(Value::object([("x", Value::from(1))])),
        )]));
        // Whole-value replacement is allowed because the slot is shallow.
        node.write("blob", shallow(Value::object([("y", Value::from(2))])))
            .unwrap();
        let blob = read_value(&node, "blob");
        assert!(blob.as_opaque().is_some());
    }

    #[test]
    fn strict_delete_of_declared_property_fails() {
        let node = strict(Value::object([("a", Value::from(1))]));
        assert!(matches!(
            node.delete("a").unwrap_err(),
            StoreError::SchemaViolation(_)
        ));
        assert!(node.has("a"));
    }

    #[test]
    fn deleting_absent_key_is_a_noop_success() {
        let node = strict(Value::object([("a", Value::from(1))]));
        node.delete("missing").unwrap();
        let permissive_node = permissive(Value::object([("a", Value::from(1))]));
        permissive_node.delete("missing").unwrap();
    }

    #[test]
    fn permissive_delete_removes_property() {
        let node = permissive(Value::object([("a", Value::from(1))]));
        node.delete("a").unwrap();
        assert!(!node.has("a"));
        assert!(node.read("a").unwrap().is_absent());
    }

    #[test]
    fn has_covers_slots_and_computed_definitions() {
        let node = strict(Value::object([
            ("stored", Value::from(1)),
            ("derived", Value::computed(|_, _| Ok(Value::from(2)))),
        ]));
        assert!(node.has("stored"));
        assert!(node.has("derived"));
        assert!(!node.has("$stored"));
        assert!(!node.has("missing"));
    }

    #[test]
    fn cell_view_read_write_delete_contract() {
        let node = strict(Value::object([("count", Value::from(3))]));

        let view = node.read("$count").unwrap().into_cell().unwrap();
        assert_eq!(view.value().unwrap(), Value::Int(3));
        assert_eq!(view.peek().unwrap(), Value::Int(3));

        // Mutating through the cell's value accessor is the sanctioned path.
        view.set(Value::from(9)).unwrap();
        assert_eq!(read_value(&node, "count"), Value::Int(9));

        // Writing the hatch key itself always fails.
        assert!(matches!(
            node.write("$count", Value::from(1)).unwrap_err(),
            StoreError::SchemaViolation(_)
        ));

        // Deleting the hatch view is a no-op success and keeps the property.
        node.delete("$count").unwrap();
        assert_eq!(read_value(&node, "count"), Value::Int(9));
    }

    #[test]
    fn cell_view_of_computed_is_read_only() {
        let node = strict(Value::object([
            ("base", Value::from(2)),
            (
                "double",
                Value::computed(|this, _| {
                    let base = this.read("base")?.into_value().and_then(|v| v.as_i64());
                    Ok(Value::from(base.unwrap_or(0) * 2))
                }),
            ),
        ]));

        let view = node.read("$double").unwrap().into_cell().unwrap();
        assert_eq!(view.value().unwrap(), Value::Int(4));
        assert!(matches!(
            view.set(Value::from(5)).unwrap_err(),
            StoreError::SchemaViolation(_)
        ));
    }

    #[test]
    fn computed_reads_cache_and_invalidate() {
        let node = strict(Value::object([
            ("count", Value::from(2)),
            (
                "double",
                Value::computed(|this, _| {
                    let count = this
                        .read("count")?
                        .into_value()
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    Ok(Value::from(count * 2))
                }),
            ),
        ]));

        assert_eq!(read_value(&node, "double"), Value::Int(4));
        node.write("count", Value::from(3)).unwrap();
        assert_eq!(read_value(&node, "double"), Value::Int(6));
    }

    #[test]
    fn failing_computed_repeats_error_until_dependency_changes() {
        let node = strict(Value::object([
            ("count", Value::from(-1)),
            (
                "checked",
                Value::computed(|this, _| {
                    let count = this
                        .read("count")?
                        .into_value()
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    if count < 0 {
                        Err(DerivationError::new("count must be non-negative"))
                    } else {
                        Ok(Value::from(count))
                    }
                }),
            ),
        ]));

        let first = node.read("checked").unwrap_err();
        let second = node.read("checked").unwrap_err();
        assert_eq!(first, second);

        node.write("count", Value::from(5)).unwrap();
        assert_eq!(read_value(&node, "checked"), Value::Int(5));
    }

    #[test]
    fn assigning_to_computed_property_fails() {
        let node = permissive(Value::object([(
            "derived",
            Value::computed(|_, _| Ok(Value::from(1))),
        )]));
        assert!(matches!(
            node.write("derived", Value::from(2)).unwrap_err(),
            StoreError::SchemaViolation(_)
        ));
    }

    #[test]
    fn permissive_can_remove_and_redeclare_computed() {
        let node = permissive(Value::object([(
            "derived",
            Value::computed(|_, _| Ok(Value::from(1))),
        )]));
        node.delete("derived").unwrap();
        assert!(!node.has("derived"));
        node.write("derived", Value::computed(|_, _| Ok(Value::from(2))))
            .unwrap();
        assert_eq!(read_value(&node, "derived"), Value::Int(2));
    }

    #[test]
    fn dollar_prefixed_names_rejected_at_construction() {
        let err = reify(Value::object([("$count", Value::from(1))])).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    // --------------------------------------------------------------
    // Arrays
    // --------------------------------------------------------------

    fn array_node(node: &Node, key: &str) -> Node {
        node.read(key).unwrap().into_node().unwrap()
    }

    #[test]
    fn array_reads_and_index_assignment() {
        let node = strict(Value::object([(
            "items",
            Value::array([Value::from(1), Value::from(2)]),
        )]));
        let items = array_node(&node, "items");

        assert_eq!(items.kind(), NodeKind::Array);
        assert_eq!(read_value(&items, "0"), Value::Int(1));
        assert_eq!(read_value(&items, "length"), Value::Int(2));
        assert!(items.read("5").unwrap().is_absent());

        items.write("1", Value::from(20)).unwrap();
        assert_eq!(read_value(&items, "1"), Value::Int(20));
    }

    #[test]
    fn index_assignment_past_end_grows_with_holes() {
        let node = strict(Value::object([("items", Value::array([Value::from(1)]))]));
        let items = array_node(&node, "items");
        let before = items.shape_version().unwrap();

        items.write("3", Value::from(9)).unwrap();
        assert_eq!(items.len(), Some(4));
        assert!(items.read("1").unwrap().is_absent());
        assert_eq!(read_value(&items, "3"), Value::Int(9));
        assert_eq!(items.shape_version().unwrap(), before + 1);
    }

    #[test]
    fn index_delete_leaves_sparse_hole_and_bumps_version_once() {
        let node = strict(Value::object([(
            "items",
            Value::array([Value::from(1), Value::from(2), Value::from(3)]),
        )]));
        let items = array_node(&node, "items");
        let before = items.shape_version().unwrap();

        items.delete("1").unwrap();
        assert_eq!(read_value(&items, "length"), Value::Int(3));
        assert!(items.read("1").unwrap().is_absent());
        assert_eq!(items.shape_version().unwrap(), before + 1);

        // Deleting the now-absent element is a no-op: no further bump.
        items.delete("1").unwrap();
        assert_eq!(items.shape_version().unwrap(), before + 1);
    }

    #[test]
    fn push_pop_contract() {
        let node = strict(Value::object([("items", Value::array([Value::from(1)]))]));
        let items = array_node(&node, "items");
        let before = items.shape_version().unwrap();

        items.push(Value::from(2)).unwrap();
        assert_eq!(items.len(), Some(2));
        assert_eq!(items.shape_version().unwrap(), before + 1);

        assert_eq!(items.pop().unwrap(), Some(Value::Int(2)));
        assert_eq!(items.len(), Some(1));
        assert_eq!(items.shape_version().unwrap(), before + 2);

        assert_eq!(items.pop().unwrap(), Some(Value::Int(1)));
        assert_eq!(items.pop().unwrap(), None);
        // Popping an empty array is a no-op for the version cell.
        assert_eq!(items.shape_version().unwrap(), before + 3);
    }

    #[test]
    fn splice_replaces_range_and_bumps_once() {
        let node = strict(Value::object([(
            "items",
            Value::array([Value::from(1), Value::from(2), Value::from(3)]),
        )]));
        let items = array_node(&node, "items");
        let before = items.shape_version().unwrap();

        let removed = items
            .splice(1, 1, vec![Value::from(20), Value::from(21)])
            .unwrap();
        assert_eq!(removed, vec![Value::Int(2)]);
        assert_eq!(items.len(), Some(4));
        assert_eq!(read_value(&items, "1"), Value::Int(20));
        assert_eq!(read_value(&items, "2"), Value::Int(21));
        assert_eq!(read_value(&items, "3"), Value::Int(3));
        assert_eq!(items.shape_version().unwrap(), before + 1);

        // Empty splice: no change, no bump.
        items.splice(0, 0, Vec::new()).unwrap();
        assert_eq!(items.shape_version().unwrap(), before + 1);
    }

    #[test]
    fn length_assignment_truncates_and_extends() {
        let node = strict(Value::object([(
            "items",
            Value::array([Value::from(1), Value::from(2), Value::from(3)]),
        )]));
        let items = array_node(&node, "items");

        items.write("length", Value::from(1)).unwrap();
        assert_eq!(items.len(), Some(1));
        assert!(items.read("1").unwrap().is_absent());

        items.write("length", Value::from(3)).unwrap();
        assert_eq!(items.len(), Some(3));
        assert!(items.read("2").unwrap().is_absent());

        assert!(matches!(
            items.write("length", Value::from(-1)).unwrap_err(),
            StoreError::SchemaViolation(_)
        ));
    }

    #[test]
    fn array_element_subtree_replacement_follows_policy() {
        let node = strict(Value::object([(
            "rows",
            Value::array([Value::object([("x", Value::from(1))])]),
        )]));
        let rows = array_node(&node, "rows");
        assert!(matches!(
            rows.write("0", Value::object([("y", Value::from(2))]))
                .unwrap_err(),
            StoreError::SchemaViolation(_)
        ));

        let node = permissive(Value::object([(
            "rows",
            Value::array([Value::object([("x", Value::from(1))])]),
        )]));
        let rows = array_node(&node, "rows");
        rows.write("0", Value::object([("y", Value::from(2))]))
            .unwrap();
        let row = rows.read("0").unwrap().into_node().unwrap();
        assert_eq!(read_value(&row, "y"), Value::Int(2));
    }

    #[test]
    fn array_ops_require_an_array_node() {
        let node = strict(Value::object([("a", Value::from(1))]));
        assert!(matches!(
            node.push(Value::from(1)).unwrap_err(),
            StoreError::SchemaViolation(_)
        ));
        assert!(matches!(node.pop().unwrap_err(), StoreError::SchemaViolation(_)));
        assert!(matches!(
            node.splice(0, 0, Vec::new()).unwrap_err(),
            StoreError::SchemaViolation(_)
        ));
        assert!(matches!(
            node.set_len(0).unwrap_err(),
            StoreError::SchemaViolation(_)
        ));
    }

    #[test]
    fn snapshot_omits_computed_and_nulls_holes() {
        let node = strict(Value::object([
            ("count", Value::from(1)),
            ("derived", Value::computed(|_, _| Ok(Value::from(99)))),
            (
                "items",
                Value::array([Value::from(1), Value::from(2), Value::from(3)]),
            ),
        ]));
        array_node(&node, "items").delete("1").unwrap();

        let snapshot = node.snapshot();
        let Value::Object(map) = snapshot else {
            panic!("snapshot of an object node is an object");
        };
        assert!(map.contains_key("count"));
        assert!(!map.contains_key("derived"));
        assert_eq!(
            map["items"],
            Value::array([Value::Int(1), Value::Null, Value::Int(3)])
        );
    }
}
