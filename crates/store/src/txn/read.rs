use super::{Cursor, Navigate};
use crate::{
    error::{Error, Result},
    node::{DOCUMENT_ROOT_KEY, ItemList, NameKey, NodeKey, NodeRecord},
    page::PageLocation,
    session::{TransactionGuard, TransactionId},
    state::ReadState,
};

/// A read-only transaction bound to one committed revision.
///
/// Later commits never change what it sees. Dropping it releases its read
/// permit and deregisters it from the session.
pub struct ReadTransaction {
    state: ReadState,
    cursor: Cursor,
    items: Option<ItemList>,
    guard: TransactionGuard,
}

impl ReadTransaction {
    pub(crate) fn new(state: ReadState, guard: TransactionGuard) -> Result<Self> {
        let root = state.node(DOCUMENT_ROOT_KEY)?.ok_or_else(|| Error::Corrupted {
            reason: format!("revision {} has no document root", state.revision_root().revision),
        })?;
        Ok(Self { state, cursor: Cursor::new(root), items: None, guard })
    }

    /// Transaction id.
    pub fn id(&self) -> TransactionId {
        self.guard.id()
    }

    /// The bound revision.
    pub fn revision(&self) -> u64 {
        self.state.revision_root().revision
    }

    /// Commit timestamp of the bound revision, in milliseconds since the epoch.
    pub fn timestamp(&self) -> u64 {
        self.state.revision_root().timestamp
    }

    /// Number of live nodes in the bound revision.
    pub fn node_count(&self) -> u64 {
        self.state.revision_root().node_count
    }

    /// Highest node key allocated up to the bound revision.
    pub fn max_node_key(&self) -> NodeKey {
        self.state.revision_root().max_node_key
    }

    /// Attaches transient records reachable through negative keys.
    pub fn set_item_list(&mut self, items: ItemList) {
        self.items = Some(items);
    }

    /// Detaches the item list.
    pub fn take_item_list(&mut self) -> Option<ItemList> {
        self.items.take()
    }

    /// Committed coordinates of a node page in the bound revision.
    pub fn node_page_location(&self, page_key: u64) -> Result<Option<PageLocation>> {
        self.guard.ensure_open()?;
        self.state.node_page_location(page_key)
    }

    /// Closes the transaction.
    pub fn close(self) {}
}

impl Navigate for ReadTransaction {
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

    fn item_list(&self) -> Option<&ItemList> {
        self.items.as_ref()
    }
}

impl std::fmt::Debug for ReadTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTransaction")
            .field("id", &self.guard.id())
            .field("revision", &self.revision())
            .field("node", &self.cursor.node().key)
            .finish()
    }
}
