//! Path constraints as a persistent list.
//!
//! A fork clones the handle, not the constraints: siblings share the
//! parent's nodes and each pushes onto its own head, so an addition in one
//! is never observable in the other.

use std::fmt;
use std::sync::Arc;

use itertools::Itertools;

use crate::expr::SymExpr;

#[derive(Debug)]
struct Node {
    constraint: SymExpr,
    parent: Option<Arc<Node>>,
}

#[derive(Debug, Clone, Default)]
pub struct ConstraintStore {
    head: Option<Arc<Node>>,
    len: usize,
}

impl ConstraintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, constraint: SymExpr) {
        assert!(constraint.is_bool(), "constraint {} is not boolean", constraint);

        let parent = self.head.take();
        self.head = Some(Arc::new(Node { constraint, parent }));
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn last(&self) -> Option<&SymExpr> {
        self.head.as_ref().map(|node| &node.constraint)
    }

    /// Constraints in the order they were added.
    pub fn iter(&self) -> impl Iterator<Item = &SymExpr> + '_ {
        let mut nodes = Vec::with_capacity(self.len);
        let mut cursor = self.head.as_deref();
        while let Some(node) = cursor {
            nodes.push(&node.constraint);
            cursor = node.parent.as_deref();
        }
        nodes.into_iter().rev()
    }

    pub fn to_vec(&self) -> Vec<SymExpr> {
        self.iter().cloned().collect()
    }

    /// True if every constraint of `self` begins `other`, in order.
    pub fn is_prefix_of(&self, other: &ConstraintStore) -> bool {
        if self.len > other.len {
            return false;
        }

        let mut cursor = other.head.as_ref();
        for _ in 0..(other.len - self.len) {
            cursor = cursor.and_then(|node| node.parent.as_ref());
        }

        match (self.head.as_ref(), cursor) {
            (None, None) => true,
            (Some(l), Some(r)) if Arc::ptr_eq(l, r) => true,
            (Some(_), Some(_)) => self.iter().zip(other.iter()).all(|(l, r)| l == r),
            _ => false,
        }
    }
}

impl fmt::Display for ConstraintStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "true")
        } else {
            write!(f, "{}", self.iter().join(" ∧ "))
        }
    }
}

impl Drop for ConstraintStore {
    fn drop(&mut self) {
        // unlink uniquely owned nodes one at a time
        let mut cursor = self.head.take();
        while let Some(node) = cursor {
            match Arc::try_unwrap(node) {
                Ok(mut node) => cursor = node.parent.take(),
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::SymVar;

    fn cond(name: &str) -> SymExpr {
        SymExpr::var(SymVar::new(name, 1))
    }

    #[test]
    fn forks_do_not_observe_each_other() {
        let mut parent = ConstraintStore::new();
        parent.push(cond("a"));

        let mut t = parent.clone();
        let mut f = parent.clone();
        t.push(cond("b"));
        f.push(SymExpr::bool_not(cond("b")));

        assert_eq!(parent.len(), 1);
        assert_eq!(t.to_vec(), vec![cond("a"), cond("b")]);
        assert_eq!(f.last(), Some(&SymExpr::bool_not(cond("b"))));

        assert!(parent.is_prefix_of(&t));
        assert!(parent.is_prefix_of(&f));
        assert!(!t.is_prefix_of(&f));
        assert!(!t.is_prefix_of(&parent));
    }

    #[test]
    fn long_lineages_drop() {
        let mut store = ConstraintStore::new();
        for _ in 0..200_000 {
            store.push(SymExpr::bool(true));
        }
        assert_eq!(store.len(), 200_000);
        drop(store);
    }

    #[test]
    fn display_joins() {
        let mut store = ConstraintStore::new();
        assert_eq!(store.to_string(), "true");
        store.push(cond("a"));
        store.push(cond("b"));
        assert_eq!(store.to_string(), "a ∧ b");
    }
}
