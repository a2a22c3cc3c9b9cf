use std::sync::Arc;

use super::{PageStore, dereference, leaf_reference, load_revision_root};
use crate::{
    addressing::{node_page_key, node_page_offset},
    error::Result,
    node::{NameKey, NodeKey, NodeRecord},
    page::{PageLocation, RevisionRootPage, UberPage},
};

/// Read-only view of one committed revision.
///
/// Holds the uber page it was opened against, so later commits never change
/// what it sees.
pub struct ReadState {
    store: Arc<PageStore>,
    uber: Arc<UberPage>,
    revision_root: RevisionRootPage,
}

impl ReadState {
    /// Opens `revision` as reachable from `uber`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RevisionNotFound`](crate::Error::RevisionNotFound) for
    /// an uncommitted revision, or an I/O-kind error if a page cannot be loaded.
    pub fn open(store: Arc<PageStore>, uber: Arc<UberPage>, revision: u64) -> Result<Self> {
        let revision_root = load_revision_root(&store, &uber, revision)?;
        Ok(Self { store, uber, revision_root })
    }

    /// The uber page this view was opened against.
    pub fn uber(&self) -> &Arc<UberPage> {
        &self.uber
    }

    /// The revision root of the bound revision.
    pub fn revision_root(&self) -> &RevisionRootPage {
        &self.revision_root
    }

    /// Looks up a persistent node. Removed or never-allocated keys yield `None`.
    pub fn node(&self, key: NodeKey) -> Result<Option<NodeRecord>> {
        let Ok(raw) = u64::try_from(key) else {
            return Ok(None);
        };
        let exponent = self.store.config().node_page_exponent;
        let levels = self.store.config().node_levels();
        let page_key = node_page_key(raw, exponent);
        if page_key >= levels.capacity() {
            return Ok(None);
        }

        let reference =
            leaf_reference(&self.store, None, self.revision_root.node_index, &levels, page_key)?;
        match dereference(&self.store, None, reference)? {
            Some(page) => Ok(page.as_node()?.get(node_page_offset(raw, exponent)).cloned()),
            None => Ok(None),
        }
    }

    /// Resolves an interned name.
    pub fn name(&self, key: NameKey) -> Result<Option<String>> {
        match dereference(&self.store, None, self.revision_root.name_page)? {
            Some(page) => Ok(page.as_name()?.get(key).map(str::to_string)),
            None => Ok(None),
        }
    }

    /// Committed coordinates of a node page, if that page exists in this revision.
    pub fn node_page_location(&self, page_key: u64) -> Result<Option<PageLocation>> {
        let levels = self.store.config().node_levels();
        Ok(leaf_reference(&self.store, None, self.revision_root.node_index, &levels, page_key)?
            .location())
    }
}
