//! Structural serialization.
//!
//! Serializing a node (or a whole store) walks the tree the same way
//! [`Node::snapshot`] does: stored properties recursively, raw opaque
//! payloads as-is, computed properties omitted. Cell-view keys never appear
//! because they are a read convention, not slots.

use serde::ser::{Serialize, Serializer};

use super::node::Node;
use super::Store;

impl Serialize for Node {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.snapshot().serialize(serializer)
    }
}

impl Serialize for Store {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.state().serialize(serializer)
    }
}
