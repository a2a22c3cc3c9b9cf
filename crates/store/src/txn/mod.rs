//! Transaction API: cursor navigation, read and write transactions.
//!
//! Both transaction kinds keep a [`Cursor`] on one node and implement
//! [`Navigate`]. Moving to a key that does not resolve returns `false` and
//! leaves the cursor where it was; only broken contracts and I/O are errors.

mod read;
mod write;

pub use read::ReadTransaction;
pub use write::WriteTransaction;

use crate::{
    error::{Error, Result},
    node::{
        DOCUMENT_ROOT_KEY, ItemList, NULL_NAME_KEY, NULL_NODE_KEY, NameKey, NodeKey, NodeKind,
        NodeRecord,
    },
};

/// Position of a transaction in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    node: NodeRecord,
}

impl Cursor {
    /// Places a cursor on `node`.
    pub fn new(node: NodeRecord) -> Self {
        Self { node }
    }

    /// The current node.
    pub fn node(&self) -> &NodeRecord {
        &self.node
    }

    /// Moves to `node`.
    pub fn set(&mut self, node: NodeRecord) {
        self.node = node;
    }
}

/// Cursor navigation over one revision.
pub trait Navigate {
    /// The cursor.
    fn cursor(&self) -> &Cursor;

    /// The cursor, mutably.
    fn cursor_mut(&mut self) -> &mut Cursor;

    /// Loads a persistent node as seen by this transaction.
    fn load_node(&self, key: NodeKey) -> Result<Option<NodeRecord>>;

    /// Resolves an interned name as seen by this transaction.
    fn load_name(&self, key: NameKey) -> Result<Option<String>>;

    /// Transient records addressed by negative keys.
    fn item_list(&self) -> Option<&ItemList> {
        None
    }

    /// The current node.
    fn node(&self) -> &NodeRecord {
        self.cursor().node()
    }

    /// Key of the current node.
    fn node_key(&self) -> NodeKey {
        self.node().key
    }

    /// Kind of the current node.
    fn kind(&self) -> NodeKind {
        self.node().kind()
    }

    /// Moves to `key`. Returns `false` if no such node exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoItemList`] for a negative key when no item list is
    /// attached, or an I/O-kind error if a page cannot be loaded.
    fn move_to(&mut self, key: NodeKey) -> Result<bool> {
        if key == NULL_NODE_KEY {
            return Ok(false);
        }
        let record = if key < 0 {
            let items = self.item_list().ok_or(Error::NoItemList { key })?;
            items.get(key).cloned()
        } else {
            self.load_node(key)?
        };
        match record {
            Some(record) => {
                self.cursor_mut().set(record);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    /// Moves to the document root.
    fn move_to_document_root(&mut self) -> Result<bool> {
        self.move_to(DOCUMENT_ROOT_KEY)
    }

    /// Moves to the parent.
    fn move_to_parent(&mut self) -> Result<bool> {
        let key = self.node().parent;
        self.move_to(key)
    }

    /// Moves to the first child.
    fn move_to_first_child(&mut self) -> Result<bool> {
        let key = self.node().first_child;
        self.move_to(key)
    }

    /// Moves to the left sibling.
    fn move_to_left_sibling(&mut self) -> Result<bool> {
        let key = self.node().left_sibling;
        self.move_to(key)
    }

    /// Moves to the right sibling.
    fn move_to_right_sibling(&mut self) -> Result<bool> {
        let key = self.node().right_sibling;
        self.move_to(key)
    }

    /// Moves to the `index`-th attribute of the current element.
    fn move_to_attribute(&mut self, index: usize) -> Result<bool> {
        match self.node().attributes().get(index).copied() {
            Some(key) => self.move_to(key),
            None => Ok(false),
        }
    }

    /// Moves to the `index`-th namespace of the current element.
    fn move_to_namespace(&mut self, index: usize) -> Result<bool> {
        match self.node().namespaces().get(index).copied() {
            Some(key) => self.move_to(key),
            None => Ok(false),
        }
    }

    /// Name of the current node (prefix for namespaces).
    fn name(&self) -> Result<Option<String>> {
        self.resolve_name(self.node().name_key())
    }

    /// Namespace URI of the current node.
    fn uri(&self) -> Result<Option<String>> {
        self.resolve_name(self.node().uri_key())
    }

    /// Type name of the current node.
    fn type_name(&self) -> Result<Option<String>> {
        self.resolve_name(self.node().type_key())
    }

    /// Raw value of the current text or attribute node.
    fn value(&self) -> Option<&[u8]> {
        self.node().value()
    }

    /// Resolves `key`, treating [`NULL_NAME_KEY`] as no name.
    fn resolve_name(&self, key: NameKey) -> Result<Option<String>> {
        if key == NULL_NAME_KEY {
            return Ok(None);
        }
        self.load_name(key)
    }
}
