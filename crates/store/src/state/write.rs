use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use tracing::debug;

use super::{PageLog, PageStore, dereference, leaf_reference, load_revision_root};
use crate::{
    addressing::{IndirectLevels, node_page_key, node_page_offset},
    error::{Error, Result},
    node::{NameKey, NodeKey, NodeRecord},
    page::{
        IndirectPage, LogKey, NamePage, NodePage, Page, PageLocation, PageReference,
        RevisionRootPage, UberPage,
    },
};

/// A slot holding a page reference, addressed without borrowing the page.
#[derive(Debug, Clone, Copy)]
enum RefSlot {
    /// `UberPage::revision_index` of the working uber page.
    RevisionIndexRoot,
    /// `RevisionRootPage::node_index` of the working revision root.
    NodeIndexRoot,
    /// `RevisionRootPage::name_page` of the working revision root.
    NamePage,
    /// A slot of a logged indirect page.
    Indirect { page: LogKey, offset: usize },
}

/// Result of writing a revision to storage, before it is published.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// The new uber page.
    pub uber: UberPage,
    /// Where the new uber page was written.
    pub location: PageLocation,
    /// Pages appended, uber page included.
    pub pages_written: u64,
    /// Bytes appended.
    pub bytes_written: u64,
}

/// Mutable working revision of a write transaction.
///
/// Every page on the path from the uber page to a modified node page is cloned
/// into the private [`PageLog`] before modification ("prepared"); siblings off
/// that path keep their committed references. Commit appends the logged pages
/// children-first and returns the new uber page for the session to publish.
///
/// A state tracks which node keys and names it touched, so that it can be
/// replayed onto a newer revision when another writer committed first.
pub struct WriteState {
    store: Arc<PageStore>,
    base: Arc<UberPage>,
    uber: UberPage,
    log: PageLog,
    revision_root: LogKey,
    source_revision: Option<u64>,
    reverted: bool,
    node_pages: HashMap<u64, LogKey>,
    names: Option<LogKey>,
    touched: BTreeSet<NodeKey>,
    new_names: BTreeMap<NameKey, String>,
    node_count_delta: i64,
}

impl WriteState {
    /// Starts a working revision on top of `base`, with the content of `source_revision`.
    ///
    /// The working revision number is `base.revision_count`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RevisionNotFound`] if `source_revision` does not exist.
    pub fn open(store: Arc<PageStore>, base: Arc<UberPage>, source_revision: u64) -> Result<Self> {
        let mut revision_root = load_revision_root(&store, &base, source_revision)?;
        if let Some(latest) = base.latest_revision().filter(|&latest| latest != source_revision) {
            // Keys stay monotonic across a revert.
            let latest_root = load_revision_root(&store, &base, latest)?;
            revision_root.max_node_key = revision_root.max_node_key.max(latest_root.max_node_key);
        }
        Self::with_revision_root(store, base, revision_root, Some(source_revision))
    }

    /// Starts revision 0 of an empty store, holding only the document root.
    ///
    /// # Errors
    ///
    /// Returns an error if the document root page cannot be prepared.
    pub fn bootstrap(store: Arc<PageStore>) -> Result<Self> {
        let mut state = Self::with_revision_root(
            store,
            Arc::new(UberPage::new()),
            RevisionRootPage::bootstrap(),
            None,
        )?;
        state.update_node(NodeRecord::document_root())?;
        Ok(state)
    }

    fn with_revision_root(
        store: Arc<PageStore>,
        base: Arc<UberPage>,
        mut revision_root: RevisionRootPage,
        source_revision: Option<u64>,
    ) -> Result<Self> {
        let revision = base.revision_count;
        revision_root.revision = revision;
        revision_root.timestamp = 0;

        let mut log = PageLog::new();
        let root_key = log.insert(Page::RevisionRoot(revision_root));
        let uber = (*base).clone();

        let mut state = Self {
            store,
            base,
            uber,
            log,
            revision_root: root_key,
            source_revision,
            reverted: false,
            node_pages: HashMap::new(),
            names: None,
            touched: BTreeSet::new(),
            new_names: BTreeMap::new(),
            node_count_delta: 0,
        };
        let levels = state.store.config().revision_levels();
        let slot = state.prepare_leaf_slot(RefSlot::RevisionIndexRoot, &levels, revision)?;
        state.set_reference(slot, PageReference::Logged(root_key))?;
        Ok(state)
    }

    /// Marks this state as reverting to its source revision, so a rebase keeps it.
    pub(crate) fn mark_reverted(&mut self) {
        self.reverted = true;
    }

    /// Revision count of the uber page this state started from.
    pub fn base_revision_count(&self) -> u64 {
        self.base.revision_count
    }

    /// Number of the revision this state will commit as.
    pub fn revision(&self) -> u64 {
        self.uber.revision_count
    }

    /// Number of dirty pages held in the log.
    pub fn dirty_page_count(&self) -> usize {
        self.log.len()
    }

    /// Whether anything would be written by a commit beyond a copy of the source.
    pub fn is_modified(&self) -> bool {
        self.reverted || !self.touched.is_empty() || !self.new_names.is_empty()
    }

    /// The working revision root.
    pub fn revision_root(&self) -> Result<&RevisionRootPage> {
        self.log.get(self.revision_root)?.as_revision_root()
    }

    fn revision_root_mut(&mut self) -> Result<&mut RevisionRootPage> {
        self.log.get_mut(self.revision_root)?.as_revision_root_mut()
    }

    // =========================================================================
    // Path preparation
    // =========================================================================

    fn reference(&self, slot: RefSlot) -> Result<PageReference> {
        match slot {
            RefSlot::RevisionIndexRoot => Ok(self.uber.revision_index),
            RefSlot::NodeIndexRoot => Ok(self.revision_root()?.node_index),
            RefSlot::NamePage => Ok(self.revision_root()?.name_page),
            RefSlot::Indirect { page, offset } => Ok(self.log.get(page)?.as_indirect()?.get(offset)),
        }
    }

    fn set_reference(&mut self, slot: RefSlot, reference: PageReference) -> Result<()> {
        match slot {
            RefSlot::RevisionIndexRoot => self.uber.revision_index = reference,
            RefSlot::NodeIndexRoot => self.revision_root_mut()?.node_index = reference,
            RefSlot::NamePage => self.revision_root_mut()?.name_page = reference,
            RefSlot::Indirect { page, offset } => {
                self.log.get_mut(page)?.as_indirect_mut()?.set(offset, reference)?;
            },
        }
        Ok(())
    }

    /// Ensures the page behind `slot` is in the log, cloning a committed page or
    /// creating a virgin one, and returns its log key.
    fn prepare_page(&mut self, slot: RefSlot, virgin: impl FnOnce() -> Page) -> Result<LogKey> {
        let page = match self.reference(slot)? {
            PageReference::Logged(key) => return Ok(key),
            PageReference::Persisted(location) => (*self.store.load(&location)?).clone(),
            PageReference::Empty => virgin(),
        };
        let key = self.log.insert(page);
        self.set_reference(slot, PageReference::Logged(key))?;
        Ok(key)
    }

    /// Prepares every indirect page on the path to `key` and returns the leaf slot.
    fn prepare_leaf_slot(
        &mut self,
        root: RefSlot,
        levels: &IndirectLevels,
        key: u64,
    ) -> Result<RefSlot> {
        let fanout = levels.fanout();
        let mut slot = root;
        for offset in levels.offsets(key)? {
            let page = self.prepare_page(slot, || Page::Indirect(IndirectPage::new(fanout)))?;
            slot = RefSlot::Indirect { page, offset };
        }
        Ok(slot)
    }

    fn prepare_node_page(&mut self, page_key: u64) -> Result<LogKey> {
        if let Some(&key) = self.node_pages.get(&page_key) {
            return Ok(key);
        }
        let levels = self.store.config().node_levels();
        let capacity = self.store.config().node_page_capacity();
        let slot = self.prepare_leaf_slot(RefSlot::NodeIndexRoot, &levels, page_key)?;
        let key = self.prepare_page(slot, || Page::Node(NodePage::new(page_key, capacity)))?;
        self.node_pages.insert(page_key, key);
        Ok(key)
    }

    fn prepare_names(&mut self) -> Result<&mut NamePage> {
        let key = match self.names {
            Some(key) => key,
            None => {
                let key = self.prepare_page(RefSlot::NamePage, || Page::Name(NamePage::new()))?;
                self.names = Some(key);
                key
            },
        };
        self.log.get_mut(key)?.as_name_mut()
    }

    // =========================================================================
    // Nodes and names
    // =========================================================================

    /// Looks up a node as seen by this working revision.
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
        let offset = node_page_offset(raw, exponent);

        if let Some(&log_key) = self.node_pages.get(&page_key) {
            return Ok(self.log.get(log_key)?.as_node()?.get(offset).cloned());
        }
        let root = self.revision_root()?.node_index;
        let reference = leaf_reference(&self.store, Some(&self.log), root, &levels, page_key)?;
        match dereference(&self.store, Some(&self.log), reference)? {
            Some(page) => Ok(page.as_node()?.get(offset).cloned()),
            None => Ok(None),
        }
    }

    fn set_slot(&mut self, key: NodeKey, record: Option<NodeRecord>) -> Result<()> {
        let exponent = self.store.config().node_page_exponent;
        let capacity = self.store.config().node_levels().capacity() << exponent;
        let raw = u64::try_from(key).map_err(|_| Error::KeyOutOfRange { key: key as u64, capacity })?;
        let page = self.prepare_node_page(node_page_key(raw, exponent))?;
        self.log.get_mut(page)?.as_node_mut()?.set(node_page_offset(raw, exponent), record)?;
        self.touched.insert(key);
        Ok(())
    }

    /// Stores a newly allocated node.
    pub fn insert_node(&mut self, record: NodeRecord) -> Result<()> {
        let key = record.key;
        self.set_slot(key, Some(record))?;
        let root = self.revision_root_mut()?;
        root.node_count += 1;
        root.max_node_key = root.max_node_key.max(key);
        self.node_count_delta += 1;
        Ok(())
    }

    /// Overwrites an existing node.
    pub fn update_node(&mut self, record: NodeRecord) -> Result<()> {
        self.set_slot(record.key, Some(record))
    }

    /// Clears a node's slot.
    pub fn delete_node(&mut self, key: NodeKey) -> Result<()> {
        self.set_slot(key, None)?;
        let root = self.revision_root_mut()?;
        root.node_count = root.node_count.saturating_sub(1);
        self.node_count_delta -= 1;
        Ok(())
    }

    /// Interns a name in this revision's name table.
    pub fn intern_name(&mut self, name: &str) -> Result<NameKey> {
        let (key, added) = self.prepare_names()?.intern(name);
        if added {
            self.new_names.insert(key, name.to_string());
        }
        Ok(key)
    }

    /// Resolves an interned name.
    pub fn name(&self, key: NameKey) -> Result<Option<String>> {
        let reference = self.revision_root()?.name_page;
        match dereference(&self.store, Some(&self.log), reference)? {
            Some(page) => Ok(page.as_name()?.get(key).map(str::to_string)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Rebase and commit
    // =========================================================================

    /// Replays this state's modifications onto a working revision built on `latest`.
    ///
    /// Used when another writer committed after this state was opened. Only
    /// touched node slots, newly interned names and the node-count delta are
    /// carried over; everything else comes from `latest`.
    ///
    /// # Errors
    ///
    /// Returns an error if a page of either revision cannot be loaded.
    pub fn rebase(&self, latest: Arc<UberPage>) -> Result<Self> {
        let source = if self.reverted { self.source_revision } else { latest.latest_revision() };
        let source = source.ok_or(Error::RevisionNotFound { revision: 0 })?;
        let mut fresh = Self::open(Arc::clone(&self.store), latest, source)?;
        fresh.reverted = self.reverted;

        // Replayed records use the key each new name lands under.
        let mut moved_names = HashMap::new();
        for (&key, name) in &self.new_names {
            let placed = fresh.prepare_names()?.insert_with_key(key, name);
            if placed != key {
                debug!(name_key = key, placed, "Name key moved while rebasing");
                moved_names.insert(key, placed);
            }
            fresh.new_names.insert(placed, name.clone());
        }
        for &key in &self.touched {
            let mut record = self.node(key)?;
            if let Some(record) = record.as_mut() {
                record.remap_names(&moved_names);
            }
            fresh.set_slot(key, record)?;
        }

        let ours = self.revision_root()?.max_node_key;
        let delta = self.node_count_delta;
        let root = fresh.revision_root_mut()?;
        root.node_count = u64::try_from(root.node_count as i64 + delta).unwrap_or(0);
        root.max_node_key = root.max_node_key.max(ours);
        fresh.node_count_delta = delta;
        Ok(fresh)
    }

    /// Writes every logged page children-first, then the new uber page.
    ///
    /// The returned uber page is not yet visible: the caller publishes
    /// [`CommitOutcome::location`] in the file header. The log is consumed; the
    /// state must not be used afterwards.
    ///
    /// # Errors
    ///
    /// Returns an I/O-kind error if encoding or appending a page fails.
    pub fn commit(&mut self, timestamp: u64) -> Result<CommitOutcome> {
        self.revision_root_mut()?.timestamp = timestamp;

        let mut outcome = CommitOutcome {
            uber: UberPage::new(),
            location: PageLocation { offset: 0, length: 0, checksum: 0 },
            pages_written: 0,
            bytes_written: 0,
        };
        self.uber.revision_index = self.commit_reference(self.uber.revision_index, &mut outcome)?;
        self.uber.revision_count += 1;

        let location = self.store.append(&Page::Uber(self.uber.clone()))?;
        outcome.pages_written += 1;
        outcome.bytes_written += u64::from(location.length);
        outcome.uber = self.uber.clone();
        outcome.location = location;
        Ok(outcome)
    }

    fn commit_reference(
        &mut self,
        reference: PageReference,
        outcome: &mut CommitOutcome,
    ) -> Result<PageReference> {
        let PageReference::Logged(key) = reference else {
            return Ok(reference);
        };
        let mut page = self.log.take(key)?;
        for child in page.child_references_mut() {
            *child = self.commit_reference(*child, outcome)?;
        }

        let location = self.store.append(&page)?;
        outcome.pages_written += 1;
        outcome.bytes_written += u64::from(location.length);
        self.store.cache().insert(location.offset, Arc::new(page));
        Ok(PageReference::Persisted(location))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        backend::InMemoryBackend,
        codec::PageCodec,
        config::StoreConfig,
        node::{DOCUMENT_ROOT_KEY, NameKeys, NodeVariant},
        state::ReadState,
    };

    fn store() -> Arc<PageStore> {
        let config = StoreConfig::builder()
            .node_page_exponent(2)
            .indirect_fanout_exponent(2)
            .revision_index_height(3)
            .node_index_height(3)
            .build()
            .unwrap();
        Arc::new(PageStore::new(
            Box::new(InMemoryBackend::new()),
            PageCodec::from_config(&config),
            config,
        ))
    }

    fn committed(state: &mut WriteState) -> Arc<UberPage> {
        Arc::new(state.commit(1).unwrap().uber)
    }

    fn text(key: NodeKey) -> NodeRecord {
        NodeRecord::new(key, DOCUMENT_ROOT_KEY, NodeVariant::Text { type_key: -1, value: vec![1] })
    }

    #[test]
    fn test_bootstrap_commits_document_root() {
        let store = store();
        let mut state = WriteState::bootstrap(Arc::clone(&store)).unwrap();
        assert_eq!(state.revision(), 0);
        let uber = committed(&mut state);
        assert_eq!(uber.revision_count, 1);

        let read = ReadState::open(store, uber, 0).unwrap();
        assert_eq!(read.node(DOCUMENT_ROOT_KEY).unwrap(), Some(NodeRecord::document_root()));
        assert_eq!(read.revision_root().node_count, 1);
        assert_eq!(read.node(1).unwrap(), None);
    }

    #[test]
    fn test_prepare_clones_only_the_touched_path() {
        let store = store();
        let mut state = WriteState::bootstrap(Arc::clone(&store)).unwrap();
        for key in 1..12 {
            state.insert_node(text(key)).unwrap();
        }
        let uber = committed(&mut state);

        let mut state = WriteState::open(Arc::clone(&store), uber, 0).unwrap();
        // Revision root plus its revision-index path (3 levels).
        assert_eq!(state.dirty_page_count(), 4);
        state.update_node(text(5)).unwrap();
        // Node-index path (3 levels) plus one node page.
        assert_eq!(state.dirty_page_count(), 8);
        state.update_node(text(6)).unwrap();
        assert_eq!(state.dirty_page_count(), 8);
    }

    #[test]
    fn test_uncommitted_state_reads_its_own_writes() {
        let store = store();
        let mut state = WriteState::bootstrap(Arc::clone(&store)).unwrap();
        let uber = committed(&mut state);

        let mut state = WriteState::open(store, uber, 0).unwrap();
        state.insert_node(text(9)).unwrap();
        assert_eq!(state.node(9).unwrap(), Some(text(9)));
        assert_eq!(state.revision_root().unwrap().node_count, 2);
        assert_eq!(state.revision_root().unwrap().max_node_key, 9);

        state.delete_node(9).unwrap();
        assert_eq!(state.node(9).unwrap(), None);
        assert_eq!(state.revision_root().unwrap().node_count, 1);
    }

    #[test]
    fn test_names_are_interned_per_revision() {
        let store = store();
        let mut state = WriteState::bootstrap(Arc::clone(&store)).unwrap();
        let key = state.intern_name("para").unwrap();
        assert_eq!(state.intern_name("para").unwrap(), key);
        let uber = committed(&mut state);

        let read = ReadState::open(store, uber, 0).unwrap();
        assert_eq!(read.name(key).unwrap().as_deref(), Some("para"));
    }

    #[test]
    fn test_rebase_replays_touched_nodes_onto_latest() {
        let store = store();
        let mut state = WriteState::bootstrap(Arc::clone(&store)).unwrap();
        let base = committed(&mut state);

        let mut first = WriteState::open(Arc::clone(&store), Arc::clone(&base), 0).unwrap();
        let mut second = WriteState::open(Arc::clone(&store), base, 0).unwrap();
        first.insert_node(text(1)).unwrap();
        second.insert_node(text(2)).unwrap();
        let name = second.intern_name("late").unwrap();

        let latest = committed(&mut first);
        let mut rebased = second.rebase(Arc::clone(&latest)).unwrap();
        assert_eq!(rebased.revision(), 2);
        let uber = committed(&mut rebased);

        let read = ReadState::open(store, uber, 2).unwrap();
        assert!(read.node(1).unwrap().is_some());
        assert!(read.node(2).unwrap().is_some());
        assert_eq!(read.revision_root().node_count, 3);
        assert_eq!(read.revision_root().max_node_key, 2);
        assert_eq!(read.name(name).unwrap().as_deref(), Some("late"));
    }

    #[test]
    fn test_rebase_moves_colliding_names_with_their_records() {
        let store = store();
        let mut state = WriteState::bootstrap(Arc::clone(&store)).unwrap();
        let base = committed(&mut state);

        // Both names hash to the same initial key.
        let mut first = WriteState::open(Arc::clone(&store), Arc::clone(&base), 0).unwrap();
        let mut second = WriteState::open(Arc::clone(&store), base, 0).unwrap();
        let taken = first.intern_name("n91119").unwrap();
        let ours = second.intern_name("n112395").unwrap();
        assert_eq!(taken, ours);
        second
            .insert_node(NodeRecord::new(
                2,
                DOCUMENT_ROOT_KEY,
                NodeVariant::Text { type_key: ours, value: Vec::new() },
            ))
            .unwrap();

        let latest = committed(&mut first);
        let mut rebased = second.rebase(latest).unwrap();
        let placed = rebased.node(2).unwrap().unwrap().type_key();
        assert_ne!(placed, ours);
        assert_eq!(rebased.name(placed).unwrap().as_deref(), Some("n112395"));
        let uber = committed(&mut rebased);

        let read = ReadState::open(store, uber, 2).unwrap();
        assert_eq!(read.name(taken).unwrap().as_deref(), Some("n91119"));
        let record = read.node(2).unwrap().unwrap();
        assert_eq!(read.name(record.type_key()).unwrap().as_deref(), Some("n112395"));
    }

    #[test]
    fn test_open_unknown_revision() {
        let store = store();
        let mut state = WriteState::bootstrap(Arc::clone(&store)).unwrap();
        let uber = committed(&mut state);
        assert!(matches!(
            WriteState::open(store, uber, 4),
            Err(Error::RevisionNotFound { revision: 4 })
        ));
    }

    #[test]
    fn test_element_names_keep_keys() {
        let store = store();
        let mut state = WriteState::bootstrap(Arc::clone(&store)).unwrap();
        let name = state.intern_name("section").unwrap();
        let element = NodeRecord::new(
            3,
            DOCUMENT_ROOT_KEY,
            NodeVariant::Element {
                name: NameKeys { name, uri: -1, type_key: -1 },
                attributes: Vec::new(),
                namespaces: Vec::new(),
            },
        );
        state.insert_node(element.clone()).unwrap();
        let uber = committed(&mut state);
        let read = ReadState::open(store, uber, 0).unwrap();
        assert_eq!(read.node(3).unwrap(), Some(element));
    }
}
