//! Mutation policy.
//!
//! The policy is fixed when the store is constructed and applies to every
//! node in the tree. Strict enforcement freezes the schema: the set of
//! stored-property keys and computed-definition names cannot grow or shrink,
//! and no non-shallow subtree may be replaced wholesale. Array contents stay
//! mutable under both policies, because element operations act on existing
//! slots rather than retargeting the array's own node.

/// Schema-enforcement level for a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Schema fixed at construction (default).
    Strict,

    /// Arbitrary key addition/removal and whole-subtree reassignment.
    Permissive,
}

impl Policy {
    pub fn is_permissive(self) -> bool {
        matches!(self, Policy::Permissive)
    }
}

/// Construction options for [`reify_with`](super::reify_with).
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Lift strict schema enforcement for the store's lifetime.
    pub permissive: bool,
}

impl From<Options> for Policy {
    fn from(options: Options) -> Self {
        if options.permissive {
            Policy::Permissive
        } else {
            Policy::Strict
        }
    }
}
