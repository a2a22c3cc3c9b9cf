//! Transaction state over the page graph.
//!
//! [`ReadState`] resolves pages of one committed revision through the shared
//! cache. [`WriteState`] layers a private [`PageLog`] on top: every page it
//! touches is cloned into the log first, so committed pages are never mutated.

mod log;
mod read;
mod write;

use std::{ops::Deref, sync::Arc};

pub use log::PageLog;
pub use read::ReadState;
pub use write::{CommitOutcome, WriteState};

use crate::{
    addressing::IndirectLevels,
    backend::StorageBackend,
    codec::PageCodec,
    config::StoreConfig,
    error::{Error, Result},
    page::{Page, PageCache, PageLocation, PageReference, RevisionRootPage, UberPage},
};

/// Page I/O shared by every transaction of a session.
pub struct PageStore {
    backend: Box<dyn StorageBackend>,
    codec: PageCodec,
    cache: PageCache,
    config: StoreConfig,
}

impl PageStore {
    /// Bundles a backend with its codec and a fresh cache sized from `config`.
    pub fn new(backend: Box<dyn StorageBackend>, codec: PageCodec, config: StoreConfig) -> Self {
        let cache = PageCache::new(config.cache_capacity);
        Self { backend, codec, cache, config }
    }

    /// The backing storage.
    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    /// The page codec.
    pub fn codec(&self) -> &PageCodec {
        &self.codec
    }

    /// The shared page cache.
    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    /// Store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Loads a committed page, from the cache when possible.
    ///
    /// # Errors
    ///
    /// Returns an I/O-kind error if the blob cannot be read or decoded.
    pub fn load(&self, location: &PageLocation) -> Result<Arc<Page>> {
        if let Some(page) = self.cache.get(location.offset) {
            return Ok(page);
        }
        let page = Arc::new(self.load_uncached(location)?);
        self.cache.insert(location.offset, Arc::clone(&page));
        Ok(page)
    }

    /// Reads and decodes a committed page, bypassing the cache.
    ///
    /// # Errors
    ///
    /// Returns an I/O-kind error if the blob cannot be read or decoded.
    pub fn load_uncached(&self, location: &PageLocation) -> Result<Page> {
        let blob = self.backend.read_at(location.offset, location.length)?;
        let page = self.codec.decode(&blob, location)?;
        self.check_shape(&page, location)?;
        Ok(page)
    }

    /// Rejects node and indirect pages sized for another geometry.
    fn check_shape(&self, page: &Page, location: &PageLocation) -> Result<()> {
        let (found, expected) = match page {
            Page::Node(node) => (node.capacity(), self.config.node_page_capacity()),
            Page::Indirect(indirect) => (indirect.fanout(), self.config.node_levels().fanout()),
            _ => return Ok(()),
        };
        if found != expected {
            return Err(Error::Corrupted {
                reason: format!(
                    "{:?} page at {} has {found} slots, expected {expected}",
                    page.kind(),
                    location.offset
                ),
            });
        }
        Ok(())
    }

    /// Encodes and appends a page, returning its coordinates.
    ///
    /// # Errors
    ///
    /// Returns an I/O-kind error if encoding or the append fails, or
    /// [`Error::UncommittedReference`] if a child is still logged.
    pub fn append(&self, page: &Page) -> Result<PageLocation> {
        let encoded = self.codec.encode(page)?;
        let length = u32::try_from(encoded.bytes.len()).map_err(|_| Error::Corrupted {
            reason: format!("encoded page of {} bytes exceeds u32", encoded.bytes.len()),
        })?;
        let offset = self.backend.append(&encoded.bytes)?;
        Ok(PageLocation { offset, length, checksum: encoded.checksum })
    }
}

/// A page borrowed from a transaction log or shared from the cache.
pub enum PageHandle<'a> {
    /// Dirty page owned by a write transaction.
    Logged(&'a Page),
    /// Committed page.
    Shared(Arc<Page>),
}

impl Deref for PageHandle<'_> {
    type Target = Page;

    fn deref(&self) -> &Page {
        match self {
            Self::Logged(page) => page,
            Self::Shared(page) => page,
        }
    }
}

/// Resolves a reference to its page. Empty references resolve to `None`.
pub(crate) fn dereference<'a>(
    store: &PageStore,
    log: Option<&'a PageLog>,
    reference: PageReference,
) -> Result<Option<PageHandle<'a>>> {
    match reference {
        PageReference::Empty => Ok(None),
        PageReference::Persisted(location) => Ok(Some(PageHandle::Shared(store.load(&location)?))),
        PageReference::Logged(key) => {
            let log = log.ok_or(Error::MissingLogEntry { key })?;
            Ok(Some(PageHandle::Logged(log.get(key)?)))
        },
    }
}

/// Walks an indirect tree from `root` and returns the leaf reference for `key`.
///
/// Missing interior pages yield [`PageReference::Empty`].
pub(crate) fn leaf_reference(
    store: &PageStore,
    log: Option<&PageLog>,
    root: PageReference,
    levels: &IndirectLevels,
    key: u64,
) -> Result<PageReference> {
    let mut reference = root;
    for offset in levels.offsets(key)? {
        match dereference(store, log, reference)? {
            Some(page) => reference = page.as_indirect()?.get(offset),
            None => return Ok(PageReference::Empty),
        }
    }
    Ok(reference)
}

/// Loads the committed revision root of `revision` reachable from `uber`.
///
/// # Errors
///
/// Returns [`Error::RevisionNotFound`] if `revision` was never committed.
pub(crate) fn load_revision_root(
    store: &PageStore,
    uber: &UberPage,
    revision: u64,
) -> Result<RevisionRootPage> {
    if revision >= uber.revision_count {
        return Err(Error::RevisionNotFound { revision });
    }
    let levels = store.config().revision_levels();
    let reference = leaf_reference(store, None, uber.revision_index, &levels, revision)?;
    let page = dereference(store, None, reference)?.ok_or(Error::RevisionNotFound { revision })?;
    Ok(page.as_revision_root()?.clone())
}
