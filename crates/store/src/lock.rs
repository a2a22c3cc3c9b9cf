//! Subtree locks for concurrent write transactions.
//!
//! A write transaction declares a transaction root. Opening it locks that root
//! and every ancestor up to the document root:
//!
//! ```text
//!            0  (count 2, ancestor of a and b)
//!          /   \
//!        a       b      a, b: declared roots of two writers
//!       / \       \
//!     ...  ...    ...   writes confined below their root
//! ```
//!
//! Ancestor locks are counters marking a node as "in use"; they never conflict
//! with each other. Conflicts are checked only against declared roots: the
//! requested root must not be locked at all, and none of its ancestors may be
//! the declared root of another writer.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    node::NodeKey,
};

#[derive(Debug, Default)]
struct LockTable {
    counts: HashMap<NodeKey, usize>,
    roots: HashSet<NodeKey>,
}

impl LockTable {
    fn check_unlock(&self, keys: impl IntoIterator<Item = NodeKey>) -> Result<()> {
        let mut needed: HashMap<NodeKey, usize> = HashMap::new();
        for key in keys {
            let wanted = needed.entry(key).or_default();
            *wanted += 1;
            if self.counts.get(&key).copied().unwrap_or(0) < *wanted {
                return Err(Error::LockUnderflow { key });
            }
        }
        Ok(())
    }

    fn unlock_checked(&mut self, key: NodeKey) {
        if let Some(count) = self.counts.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(&key);
            }
        }
    }
}

/// Per-session registry of node locks and declared transaction roots.
#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
}

impl LockManager {
    /// Creates an empty lock manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the lock count of `key`.
    pub fn lock(&self, key: NodeKey) {
        *self.table.lock().counts.entry(key).or_default() += 1;
    }

    /// Decrements the lock count of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockUnderflow`] if `key` is not locked.
    pub fn unlock(&self, key: NodeKey) -> Result<()> {
        let mut table = self.table.lock();
        table.check_unlock([key])?;
        table.unlock_checked(key);
        Ok(())
    }

    /// Current lock count of `key`.
    pub fn lock_count(&self, key: NodeKey) -> usize {
        self.table.lock().counts.get(&key).copied().unwrap_or(0)
    }

    /// Whether `key` is locked by any transaction.
    pub fn is_locked(&self, key: NodeKey) -> bool {
        self.lock_count(key) > 0
    }

    /// Whether `key` is the declared root of an open write transaction.
    pub fn is_transaction_root(&self, key: NodeKey) -> bool {
        self.table.lock().roots.contains(&key)
    }

    /// Declares `root` as a transaction root and locks it with its ancestors.
    ///
    /// `ancestors` runs from the parent of `root` up to the document root.
    /// Nothing is locked if a check fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransactionRootLocked`] if `root` is already locked, or
    /// [`Error::AncestorIsTransactionRoot`] if an ancestor is declared by another
    /// writer.
    pub fn acquire_subtree(&self, root: NodeKey, ancestors: &[NodeKey]) -> Result<()> {
        let mut table = self.table.lock();
        if table.counts.contains_key(&root) {
            return Err(Error::TransactionRootLocked { key: root });
        }
        if let Some(&ancestor) = ancestors.iter().find(|key| table.roots.contains(key)) {
            return Err(Error::AncestorIsTransactionRoot { key: root, ancestor });
        }

        for &key in std::iter::once(&root).chain(ancestors) {
            *table.counts.entry(key).or_default() += 1;
        }
        table.roots.insert(root);
        Ok(())
    }

    /// Undoes [`acquire_subtree`](Self::acquire_subtree).
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockUnderflow`] naming the first key without a matching
    /// lock; nothing is released in that case.
    pub fn release_subtree(&self, root: NodeKey, ancestors: &[NodeKey]) -> Result<()> {
        let mut table = self.table.lock();
        let keys = std::iter::once(root).chain(ancestors.iter().copied());
        table.check_unlock(keys.clone())?;
        for key in keys {
            table.unlock_checked(key);
        }
        table.roots.remove(&root);
        Ok(())
    }
}
