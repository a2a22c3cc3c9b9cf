use std::sync::Arc;

use tracing::{debug, warn};

use super::{Cursor, Navigate};
use crate::{
    error::{Error, Result},
    node::{
        DOCUMENT_ROOT_KEY, NULL_NAME_KEY, NULL_NODE_KEY, NameKey, NameKeys, NodeKey, NodeKind,
        NodeRecord, NodeVariant,
    },
    session::{SessionShared, TransactionGuard, TransactionId},
    state::WriteState,
};

/// A write transaction confined to the subtree of its transaction root.
///
/// The exclusive writer of a session is rooted at the document root. Scoped
/// writers are rooted at an element and may run concurrently with other scoped
/// writers on disjoint subtrees.
///
/// # Invariants
///
/// - Every mutation target lies in the subtree of the transaction root.
/// - Siblings of the transaction root are never edited and the root itself is
///   never removed.
/// - Validation happens before any page is prepared, so a rejected call leaves
///   the working revision untouched.
///
/// `commit` publishes a revision and keeps the transaction open on a fresh
/// working revision. Dropping the transaction with uncommitted modifications
/// discards them and logs a warning.
pub struct WriteTransaction {
    shared: Arc<SessionShared>,
    state: WriteState,
    cursor: Cursor,
    root: NodeKey,
    modifications: u64,
    guard: TransactionGuard,
}

impl WriteTransaction {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        state: WriteState,
        root: NodeKey,
        guard: TransactionGuard,
    ) -> Result<Self> {
        let node = state.node(root)?.ok_or(Error::UnknownTransactionRoot { key: root })?;
        Ok(Self { shared, state, cursor: Cursor::new(node), root, modifications: 0, guard })
    }

    /// Transaction id.
    pub fn id(&self) -> TransactionId {
        self.guard.id()
    }

    /// The transaction root.
    pub fn root(&self) -> NodeKey {
        self.root
    }

    /// Number the next commit will publish.
    pub fn revision(&self) -> u64 {
        self.state.revision()
    }

    /// Modifications since the last commit, abort or revert.
    pub fn modification_count(&self) -> u64 {
        self.modifications
    }

    /// Live nodes in the working revision.
    pub fn node_count(&self) -> Result<u64> {
        Ok(self.state.revision_root()?.node_count)
    }

    /// Highest node key allocated in the working revision.
    pub fn max_node_key(&self) -> Result<NodeKey> {
        Ok(self.state.revision_root()?.max_node_key)
    }

    // =========================================================================
    // Inserts
    // =========================================================================

    /// Inserts an element as first child of the current node and moves to it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInsertPosition`] if the current node cannot have
    /// children, or [`Error::OutOfScope`] outside the transaction's subtree.
    pub fn insert_element_as_first_child(&mut self, name: &str) -> Result<NodeKey> {
        let parent = self.first_child_position()?;
        let variant = self.element(name)?;
        let record = NodeRecord::new(self.shared.allocate_node_key(), parent.key, variant);
        self.link_as_first_child(parent, record)
    }

    /// Inserts an element as right sibling of the current node and moves to it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransactionRootSiblingEdit`] on the transaction root,
    /// [`Error::InvalidInsertPosition`] on a node without siblings, or
    /// [`Error::OutOfScope`] outside the transaction's subtree.
    pub fn insert_element_as_right_sibling(&mut self, name: &str) -> Result<NodeKey> {
        let left = self.right_sibling_position()?;
        let variant = self.element(name)?;
        let record = NodeRecord::new(self.shared.allocate_node_key(), left.parent, variant);
        self.link_as_right_sibling(left, record)
    }

    /// Inserts a text node as first child of the current node and moves to it.
    ///
    /// # Errors
    ///
    /// Same as [`insert_element_as_first_child`](Self::insert_element_as_first_child).
    pub fn insert_text_as_first_child(&mut self, value: &[u8]) -> Result<NodeKey> {
        let parent = self.first_child_position()?;
        let variant = NodeVariant::Text { type_key: NULL_NAME_KEY, value: value.to_vec() };
        let record = NodeRecord::new(self.shared.allocate_node_key(), parent.key, variant);
        self.link_as_first_child(parent, record)
    }

    /// Inserts a text node as right sibling of the current node and moves to it.
    ///
    /// # Errors
    ///
    /// Same as [`insert_element_as_right_sibling`](Self::insert_element_as_right_sibling).
    pub fn insert_text_as_right_sibling(&mut self, value: &[u8]) -> Result<NodeKey> {
        let left = self.right_sibling_position()?;
        let variant = NodeVariant::Text { type_key: NULL_NAME_KEY, value: value.to_vec() };
        let record = NodeRecord::new(self.shared.allocate_node_key(), left.parent, variant);
        self.link_as_right_sibling(left, record)
    }

    /// Adds an attribute to the current element and moves to it.
    ///
    /// An attribute with the same name has its value replaced instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInsertPosition`] if the current node is not an
    /// element, or [`Error::OutOfScope`] outside the transaction's subtree.
    pub fn insert_attribute(&mut self, name: &str, value: &[u8]) -> Result<NodeKey> {
        let mut element = self.current()?;
        if element.kind() != NodeKind::Element {
            return Err(invalid(&element, "insert an attribute"));
        }
        self.ensure_in_scope(element.key)?;

        let name = self.state.intern_name(name)?;
        for &key in element.attributes() {
            let mut attribute = self.require(key)?;
            if attribute.name_key() != name {
                continue;
            }
            if let NodeVariant::Attribute { value: old, .. } = &mut attribute.variant {
                *old = value.to_vec();
            }
            self.state.update_node(attribute.clone())?;
            return Ok(self.moved(attribute));
        }

        let key = self.shared.allocate_node_key();
        let names = NameKeys { name, ..NameKeys::NONE };
        let attribute = NodeRecord::new(
            key,
            element.key,
            NodeVariant::Attribute { name: names, value: value.to_vec() },
        );
        if let NodeVariant::Element { attributes, .. } = &mut element.variant {
            attributes.push(key);
        }
        self.state.update_node(element)?;
        self.state.insert_node(attribute.clone())?;
        Ok(self.moved(attribute))
    }

    /// Declares a namespace on the current element and moves to it.
    ///
    /// A declaration with the same prefix has its URI replaced instead.
    ///
    /// # Errors
    ///
    /// Same as [`insert_attribute`](Self::insert_attribute).
    pub fn insert_namespace(&mut self, prefix: &str, uri: &str) -> Result<NodeKey> {
        let mut element = self.current()?;
        if element.kind() != NodeKind::Element {
            return Err(invalid(&element, "insert a namespace"));
        }
        self.ensure_in_scope(element.key)?;

        let prefix = self.state.intern_name(prefix)?;
        let uri = self.state.intern_name(uri)?;
        for &key in element.namespaces() {
            let mut namespace = self.require(key)?;
            if namespace.name_key() != prefix {
                continue;
            }
            namespace.variant = NodeVariant::Namespace { prefix, uri };
            self.state.update_node(namespace.clone())?;
            return Ok(self.moved(namespace));
        }

        let key = self.shared.allocate_node_key();
        let namespace = NodeRecord::new(key, element.key, NodeVariant::Namespace { prefix, uri });
        if let NodeVariant::Element { namespaces, .. } = &mut element.variant {
            namespaces.push(key);
        }
        self.state.update_node(element)?;
        self.state.insert_node(namespace.clone())?;
        Ok(self.moved(namespace))
    }

    // =========================================================================
    // Removal and updates
    // =========================================================================

    /// Removes the current node with its subtree.
    ///
    /// The cursor moves to the right sibling, else the left sibling, else the
    /// parent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RemoveDocumentRoot`], [`Error::RemoveTransactionRoot`] or
    /// [`Error::OutOfScope`].
    pub fn remove(&mut self) -> Result<()> {
        let node = self.current()?;
        if node.key == DOCUMENT_ROOT_KEY {
            return Err(Error::RemoveDocumentRoot);
        }
        if node.key == self.root {
            return Err(Error::RemoveTransactionRoot { key: node.key });
        }
        self.ensure_in_scope(node.key)?;

        let mut parent = self.require(node.parent)?;
        if matches!(node.kind(), NodeKind::Attribute | NodeKind::Namespace) {
            if let NodeVariant::Element { attributes, namespaces, .. } = &mut parent.variant {
                attributes.retain(|&key| key != node.key);
                namespaces.retain(|&key| key != node.key);
            }
            self.state.update_node(parent.clone())?;
            self.state.delete_node(node.key)?;
            self.moved(parent);
            return Ok(());
        }

        if node.left_sibling == NULL_NODE_KEY {
            parent.first_child = node.right_sibling;
        } else {
            let mut left = self.require(node.left_sibling)?;
            left.right_sibling = node.right_sibling;
            self.state.update_node(left)?;
        }
        if node.right_sibling != NULL_NODE_KEY {
            let mut right = self.require(node.right_sibling)?;
            right.left_sibling = node.left_sibling;
            self.state.update_node(right)?;
        }
        parent.child_count = parent.child_count.saturating_sub(1);
        self.state.update_node(parent)?;

        for key in self.subtree_keys(&node)? {
            self.state.delete_node(key)?;
        }

        let next = [node.right_sibling, node.left_sibling, node.parent]
            .into_iter()
            .find(|&key| key != NULL_NODE_KEY)
            .unwrap_or(node.parent);
        let next = self.require(next)?;
        self.moved(next);
        Ok(())
    }

    /// Renames the current element or attribute, or changes a namespace prefix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInsertPosition`] for unnamed kinds, or
    /// [`Error::OutOfScope`] outside the transaction's subtree.
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        let mut node = self.current()?;
        if !matches!(node.kind(), NodeKind::Element | NodeKind::Attribute | NodeKind::Namespace) {
            return Err(invalid(&node, "set the name"));
        }
        self.ensure_in_scope(node.key)?;

        let key = self.state.intern_name(name)?;
        match &mut node.variant {
            NodeVariant::Element { name, .. } | NodeVariant::Attribute { name, .. } => {
                name.name = key;
            },
            NodeVariant::Namespace { prefix, .. } => *prefix = key,
            NodeVariant::Document | NodeVariant::Text { .. } => {},
        }
        self.state.update_node(node.clone())?;
        self.moved(node);
        Ok(())
    }

    /// Sets the namespace URI of the current element, attribute or namespace.
    ///
    /// # Errors
    ///
    /// Same as [`set_name`](Self::set_name).
    pub fn set_uri(&mut self, uri: &str) -> Result<()> {
        let mut node = self.current()?;
        if !matches!(node.kind(), NodeKind::Element | NodeKind::Attribute | NodeKind::Namespace) {
            return Err(invalid(&node, "set the URI"));
        }
        self.ensure_in_scope(node.key)?;

        let key = self.state.intern_name(uri)?;
        match &mut node.variant {
            NodeVariant::Element { name, .. } | NodeVariant::Attribute { name, .. } => {
                name.uri = key;
            },
            NodeVariant::Namespace { uri, .. } => *uri = key,
            NodeVariant::Document | NodeVariant::Text { .. } => {},
        }
        self.state.update_node(node.clone())?;
        self.moved(node);
        Ok(())
    }

    /// Replaces the value of the current text or attribute node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInsertPosition`] for kinds without a value, or
    /// [`Error::OutOfScope`] outside the transaction's subtree.
    pub fn set_value(&mut self, value: &[u8]) -> Result<()> {
        let mut node = self.current()?;
        if !matches!(node.kind(), NodeKind::Attribute | NodeKind::Text) {
            return Err(invalid(&node, "set the value"));
        }
        self.ensure_in_scope(node.key)?;

        if let NodeVariant::Attribute { value: old, .. } | NodeVariant::Text { value: old, .. } =
            &mut node.variant
        {
            *old = value.to_vec();
        }
        self.state.update_node(node.clone())?;
        self.moved(node);
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Publishes the working revision and continues on a fresh one.
    ///
    /// Returns the committed revision number.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] after the session was closed, or an
    /// I/O-kind error if writing fails; the transaction must then be closed.
    pub fn commit(&mut self) -> Result<u64> {
        self.guard.ensure_open()?;
        let uber = self.shared.commit(&mut self.state)?;
        let revision = uber.revision_count - 1;
        self.state = WriteState::open(self.shared.store(), uber, revision)?;
        debug!(
            transaction_id = %self.guard.id(),
            revision,
            modifications = self.modifications,
            "Write transaction committed"
        );
        self.modifications = 0;
        self.refresh_cursor()?;
        Ok(revision)
    }

    /// Discards everything since the last commit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] after the session was closed.
    pub fn abort(&mut self) -> Result<()> {
        self.guard.ensure_open()?;
        let latest = self.shared.last_committed();
        let revision = latest.latest_revision().ok_or(Error::RevisionNotFound { revision: 0 })?;
        self.state = WriteState::open(self.shared.store(), latest, revision)?;
        self.modifications = 0;
        self.refresh_cursor()
    }

    /// Discards uncommitted work and restarts from the content of `revision`.
    ///
    /// The next commit publishes a new revision equal to `revision`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfScope`] on a scoped writer, or
    /// [`Error::RevisionNotFound`] for an uncommitted revision.
    pub fn revert_to(&mut self, revision: u64) -> Result<()> {
        self.guard.ensure_open()?;
        if self.root != DOCUMENT_ROOT_KEY {
            return Err(Error::OutOfScope { key: DOCUMENT_ROOT_KEY, root: self.root });
        }
        let mut state = WriteState::open(self.shared.store(), self.shared.last_committed(), revision)?;
        state.mark_reverted();
        self.state = state;
        self.modifications = 1;
        self.refresh_cursor()
    }

    /// Closes the transaction, discarding uncommitted modifications.
    pub fn close(mut self) {
        self.modifications = 0;
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn current(&self) -> Result<NodeRecord> {
        self.guard.ensure_open()?;
        self.require(self.cursor.node().key)
    }

    fn require(&self, key: NodeKey) -> Result<NodeRecord> {
        self.state.node(key)?.ok_or_else(|| Error::Corrupted {
            reason: format!("node {key} is linked but missing"),
        })
    }

    /// Walks up from `key` until the transaction root is reached.
    fn ensure_in_scope(&self, key: NodeKey) -> Result<()> {
        if self.root == DOCUMENT_ROOT_KEY {
            return Ok(());
        }
        let mut at = key;
        loop {
            if at == self.root {
                return Ok(());
            }
            match self.state.node(at)? {
                Some(node) if node.parent != NULL_NODE_KEY => at = node.parent,
                _ => return Err(Error::OutOfScope { key, root: self.root }),
            }
        }
    }

    fn first_child_position(&self) -> Result<NodeRecord> {
        let parent = self.current()?;
        if !parent.is_structural_container() {
            return Err(invalid(&parent, "insert a first child"));
        }
        self.ensure_in_scope(parent.key)?;
        Ok(parent)
    }

    fn right_sibling_position(&self) -> Result<NodeRecord> {
        let left = self.current()?;
        if left.key == self.root {
            return Err(Error::TransactionRootSiblingEdit { key: left.key });
        }
        if !matches!(left.kind(), NodeKind::Element | NodeKind::Text) {
            return Err(invalid(&left, "insert a right sibling"));
        }
        self.ensure_in_scope(left.key)?;
        Ok(left)
    }

    fn element(&mut self, name: &str) -> Result<NodeVariant> {
        let name = self.state.intern_name(name)?;
        Ok(NodeVariant::Element {
            name: NameKeys { name, ..NameKeys::NONE },
            attributes: Vec::new(),
            namespaces: Vec::new(),
        })
    }

    fn link_as_first_child(
        &mut self,
        mut parent: NodeRecord,
        mut record: NodeRecord,
    ) -> Result<NodeKey> {
        record.right_sibling = parent.first_child;
        if parent.first_child != NULL_NODE_KEY {
            let mut right = self.require(parent.first_child)?;
            right.left_sibling = record.key;
            self.state.update_node(right)?;
        }
        parent.first_child = record.key;
        parent.child_count += 1;
        self.state.update_node(parent)?;
        self.state.insert_node(record.clone())?;
        Ok(self.moved(record))
    }

    fn link_as_right_sibling(
        &mut self,
        mut left: NodeRecord,
        mut record: NodeRecord,
    ) -> Result<NodeKey> {
        let mut parent = self.require(left.parent)?;
        record.left_sibling = left.key;
        record.right_sibling = left.right_sibling;
        if left.right_sibling != NULL_NODE_KEY {
            let mut right = self.require(left.right_sibling)?;
            right.left_sibling = record.key;
            self.state.update_node(right)?;
        }
        left.right_sibling = record.key;
        self.state.update_node(left)?;
        parent.child_count += 1;
        self.state.update_node(parent)?;
        self.state.insert_node(record.clone())?;
        Ok(self.moved(record))
    }

    /// Keys of `node`, its attributes, namespaces and all descendants.
    fn subtree_keys(&self, node: &NodeRecord) -> Result<Vec<NodeKey>> {
        let mut keys = Vec::new();
        let mut stack = vec![node.clone()];
        while let Some(record) = stack.pop() {
            keys.push(record.key);
            keys.extend_from_slice(record.attributes());
            keys.extend_from_slice(record.namespaces());
            let mut child = record.first_child;
            while child != NULL_NODE_KEY {
                let next = self.require(child)?;
                child = next.right_sibling;
                stack.push(next);
            }
        }
        Ok(keys)
    }

    fn moved(&mut self, record: NodeRecord) -> NodeKey {
        self.modifications += 1;
        let key = record.key;
        self.cursor.set(record);
        key
    }

    /// Reloads the cursor node after the working revision was replaced.
    fn refresh_cursor(&mut self) -> Result<()> {
        for key in [self.cursor.node().key, self.root, DOCUMENT_ROOT_KEY] {
            if let Some(node) = self.state.node(key)? {
                self.cursor.set(node);
                return Ok(());
            }
        }
        Err(Error::Corrupted { reason: "working revision has no document root".to_string() })
    }
}

fn invalid(node: &NodeRecord, operation: &'static str) -> Error {
    Error::InvalidInsertPosition { key: node.key, kind: node.kind(), operation }
}

impl Navigate for WriteTransaction {
    fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    fn cursor_mut(&mut self) -> &mut Cursor {
        &mut self.cursor
    }

    fn load_node(&self, key: NodeKey) -> Result<Option<NodeRecord>> {
        self.guard.ensure_open()?;
        self.state.node(key)
    }

    fn load_name(&self, key: NameKey) -> Result<Option<String>> {
        self.guard.ensure_open()?;
        self.state.name(key)
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if self.modifications > 0 {
            warn!(
                transaction_id = %self.guard.id(),
                modifications = self.modifications,
                "Write transaction dropped with uncommitted modifications"
            );
        }
    }
}

impl std::fmt::Debug for WriteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("id", &self.guard.id())
            .field("root", &self.root)
            .field("revision", &self.state.revision())
            .field("modifications", &self.modifications)
            .finish()
    }
}
