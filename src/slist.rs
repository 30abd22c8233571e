//! Interrupt-safe intrusive singly linked list.
//!
//! Nodes are owned by the caller (usually `static`s) and linked by shared
//! reference. A list is addressed through its first node, normally a sentinel
//! that is never deleted itself.
//!
//! Deletion marks the victim with a `deleting` tombstone before unlinking it.
//! Traversals skip tombstoned nodes, and a tombstoned node refuses to act as
//! the anchor of an append or a delete until its own unlink is done.
//!
//! ```
//! use aint_safe::Node;
//!
//! static HEAD: Node<'static, u32> = Node::new(0);
//! static A: Node<'static, u32> = Node::new(1);
//! static B: Node<'static, u32> = Node::new(2);
//!
//! HEAD.append(&A).unwrap();
//! A.append(&B).unwrap();
//! HEAD.delete_after(&A).unwrap();
//!
//! let values: Vec<u32> = HEAD.iter().map(|node| **node).collect();
//! assert_eq!(values, [2]);
//! ```

use core::fmt;
use core::iter::FusedIterator;
use core::ops::Deref;
use core::ptr;
use portable_atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::error::{fatal, Misuse};

pub struct Node<'a, T> {
    deleting: AtomicBool,
    next: AtomicPtr<Node<'a, T>>,
    value: T,
}

impl<'a, T> Node<'a, T> {
    /// Create an unlinked node.
    pub const fn new(value: T) -> Self {
        Self {
            deleting: AtomicBool::new(false),
            next: AtomicPtr::new(ptr::null_mut()),
            value,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// `true` while this node is being unlinked.
    pub fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::SeqCst)
    }

    /// The first node after this one that is not being deleted.
    pub fn next(&self) -> Option<&'a Node<'a, T>> {
        // SAFETY: only `&'a` nodes are ever linked.
        unsafe { self.next_stable_until(ptr::null()).as_ref() }
    }

    /// Iterate over the live nodes after this one.
    pub fn iter(&self) -> Iter<'a, T> {
        Iter { next: self.next() }
    }

    /// Link `new` directly after this node.
    ///
    /// Returns `None` without linking if this node is being deleted.
    pub fn append(&'a self, new: &'a Node<'a, T>) -> Option<&'a Node<'a, T>> {
        if self.is_deleting() {
            return None;
        }
        new.deleting.store(false, Ordering::SeqCst);

        let mut next = self.next.load(Ordering::SeqCst);
        loop {
            // If this node is unlinked before the exchange, its link is
            // cleared and the retry appends to the detached node, as if the
            // delete had happened first.
            new.next.store(next, Ordering::SeqCst);
            match self.next.compare_exchange(next, new.as_ptr(), Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Some(new),
                Err(current) => next = current,
            }
        }
    }

    /// Unlink `to_delete`, which must be reachable from this node.
    ///
    /// Returns `None` without unlinking if this node is being deleted.
    /// Once this returns, `to_delete` is detached and may be appended again.
    ///
    /// # Panics
    ///
    /// Panics if `to_delete` cannot be reached from this node through live
    /// nodes, or if a node was appended to `to_delete` while it was being
    /// unlinked.
    pub fn delete_after(&'a self, to_delete: &'a Node<'a, T>) -> Option<&'a Node<'a, T>> {
        if self.is_deleting() {
            return None;
        }
        if ptr::eq(self, to_delete) {
            fatal(Misuse::DeleteTargetMissing);
        }

        to_delete.deleting.store(true, Ordering::SeqCst);
        let target = to_delete.as_ptr();
        let mut prev: &Node<'a, T> = self;
        loop {
            if prev.next.load(Ordering::SeqCst) == target {
                let after = to_delete.next.load(Ordering::SeqCst);
                if prev
                    .next
                    .compare_exchange(target, after, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    // Something was inserted between `prev` and the target.
                    continue;
                }
                if to_delete
                    .next
                    .compare_exchange(after, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    fatal(Misuse::AppendToDeleting);
                }
                to_delete.deleting.store(false, Ordering::SeqCst);
                return Some(to_delete);
            }

            // SAFETY: only `&'a` nodes are ever linked.
            match unsafe { prev.next_stable_until(target).as_ref() } {
                Some(node) if !ptr::eq(node, to_delete) => prev = node,
                _ => fatal(Misuse::DeleteTargetMissing),
            }
        }
    }

    /// Follow `next` past tombstoned nodes, stopping early at `limit`.
    fn next_stable_until(&self, limit: *const Node<'a, T>) -> *mut Node<'a, T> {
        let mut next = self.next.load(Ordering::SeqCst);
        // SAFETY: only `&'a` nodes are ever linked.
        while let Some(node) = unsafe { next.as_ref() } {
            if ptr::eq(node, limit) || !node.is_deleting() {
                break;
            }
            next = node.next.load(Ordering::SeqCst);
        }
        next
    }

    fn as_ptr(&self) -> *mut Node<'a, T> {
        self as *const Node<'a, T> as *mut Node<'a, T>
    }
}

impl<'a, T> Deref for Node<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<'a, T: Default> Default for Node<'a, T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<'a, T: fmt::Debug> fmt::Debug for Node<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("value", &self.value)
            .field("deleting", &self.is_deleting())
            .field("linked", &!self.next.load(Ordering::Relaxed).is_null())
            .finish()
    }
}

/// Iterator over live nodes, see [`Node::iter`].
pub struct Iter<'a, T> {
    next: Option<&'a Node<'a, T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a Node<'a, T>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        self.next = node.next();
        Some(node)
    }
}

impl<'a, T> FusedIterator for Iter<'a, T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    fn values<'a, T: Copy + 'a>(head: &Node<'a, T>) -> Vec<T> {
        head.iter().map(|node| **node).collect()
    }

    #[test]
    fn test_append_links_after_anchor() {
        let head = Node::new(0);
        let a = Node::new(1);
        let b = Node::new(2);
        let c = Node::new(3);

        assert!(head.append(&a).is_some());
        assert!(a.append(&c).is_some());
        // Appending to `a` again inserts right after it.
        assert!(a.append(&b).is_some());
        assert_eq!(values(&head), [1, 2, 3]);
        assert_eq!(head.next().map(|n| *n.value()), Some(1));
    }

    #[test]
    fn test_delete_after_removes_only_target() {
        let head = Node::new(0);
        let a = Node::new(1);
        let b = Node::new(2);
        let c = Node::new(3);
        head.append(&a);
        a.append(&b);
        b.append(&c);

        let removed = head.delete_after(&b).unwrap();
        assert!(ptr::eq(removed, &b));
        assert!(!b.is_deleting());
        assert!(b.next().is_none());
        assert_eq!(values(&head), [1, 3]);

        // A detached node can be linked again.
        c.append(&b);
        assert_eq!(values(&head), [1, 3, 2]);
    }

    #[test]
    fn test_traversal_skips_tombstones() {
        let head = Node::new(0);
        let a = Node::new(1);
        let b = Node::new(2);
        head.append(&a);
        a.append(&b);

        a.deleting.store(true, Ordering::SeqCst);
        assert_eq!(values(&head), [2]);
        a.deleting.store(false, Ordering::SeqCst);
        assert_eq!(values(&head), [1, 2]);
    }

    #[test]
    fn test_deleting_anchor_rejects_changes() {
        let head = Node::new(0);
        let a = Node::new(1);
        let b = Node::new(2);
        head.append(&a);

        a.deleting.store(true, Ordering::SeqCst);
        assert!(a.append(&b).is_none());
        assert!(a.delete_after(&b).is_none());
        assert!(b.next.load(Ordering::SeqCst).is_null());
    }

    #[test]
    #[should_panic(expected = "not reachable from the anchor")]
    fn test_delete_of_unlinked_node_is_fatal() {
        let head = Node::new(0);
        let a = Node::new(1);
        let stray = Node::new(2);
        head.append(&a);
        head.delete_after(&stray);
    }
}
