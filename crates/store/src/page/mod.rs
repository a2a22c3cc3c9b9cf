//! Page types of the copy-on-write page graph.
//!
//! ```text
//! UberPage ──revision_index──▶ IndirectPage ─▶ … ─▶ RevisionRootPage
//!                                                    ├─ name_page ──▶ NamePage
//!                                                    └─ node_index ─▶ IndirectPage ─▶ … ─▶ NodePage
//! ```
//!
//! Every page serializes to a payload that starts with its [`PageKind`] tag.
//! Child pages are addressed only through [`PageReference`]s, so a committed
//! page graph is immutable and freely shared between revisions.

mod cache;
mod indirect;
mod name;
mod node_page;
mod reference;
mod revision_root;
mod uber;

pub use cache::{CacheStats, PageCache};
pub use indirect::IndirectPage;
pub use name::NamePage;
pub use node_page::NodePage;
pub use reference::{LogKey, PageLocation, PageReference};
pub use revision_root::RevisionRootPage;
pub use uber::UberPage;

use crate::{
    encoding::expect_end,
    error::{Error, Result},
};

/// Page type tag, the first byte of every serialized payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageKind {
    /// [`UberPage`].
    Uber = 1,
    /// [`RevisionRootPage`].
    RevisionRoot = 2,
    /// [`IndirectPage`].
    Indirect = 3,
    /// [`NodePage`].
    Node = 4,
    /// [`NamePage`].
    Name = 5,
}

impl TryFrom<u8> for PageKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Uber),
            2 => Ok(Self::RevisionRoot),
            3 => Ok(Self::Indirect),
            4 => Ok(Self::Node),
            5 => Ok(Self::Name),
            _ => Err(Error::Corrupted { reason: format!("Invalid page kind: {value}") }),
        }
    }
}

/// A page of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Page {
    /// Store root.
    Uber(UberPage),
    /// Revision root.
    RevisionRoot(RevisionRootPage),
    /// Indirect tree interior page.
    Indirect(IndirectPage),
    /// Node index leaf.
    Node(NodePage),
    /// Name table.
    Name(NamePage),
}

macro_rules! page_accessors {
    ($as_ref:ident, $as_mut:ident, $variant:ident, $ty:ty) => {
        /// Borrows the page as this kind.
        ///
        /// # Errors
        ///
        /// Returns [`Error::PageKindMismatch`] for any other kind.
        pub fn $as_ref(&self) -> Result<&$ty> {
            match self {
                Self::$variant(page) => Ok(page),
                other => {
                    Err(Error::PageKindMismatch { expected: PageKind::$variant, found: other.kind() })
                },
            }
        }

        /// Mutably borrows the page as this kind.
        ///
        /// # Errors
        ///
        /// Returns [`Error::PageKindMismatch`] for any other kind.
        pub fn $as_mut(&mut self) -> Result<&mut $ty> {
            match self {
                Self::$variant(page) => Ok(page),
                other => {
                    Err(Error::PageKindMismatch { expected: PageKind::$variant, found: other.kind() })
                },
            }
        }
    };
}

impl Page {
    page_accessors!(as_uber, as_uber_mut, Uber, UberPage);
    page_accessors!(as_revision_root, as_revision_root_mut, RevisionRoot, RevisionRootPage);
    page_accessors!(as_indirect, as_indirect_mut, Indirect, IndirectPage);
    page_accessors!(as_node, as_node_mut, Node, NodePage);
    page_accessors!(as_name, as_name_mut, Name, NamePage);

    /// Returns the kind tag.
    pub fn kind(&self) -> PageKind {
        match self {
            Self::Uber(_) => PageKind::Uber,
            Self::RevisionRoot(_) => PageKind::RevisionRoot,
            Self::Indirect(_) => PageKind::Indirect,
            Self::Node(_) => PageKind::Node,
            Self::Name(_) => PageKind::Name,
        }
    }

    /// References to child pages, in serialization order.
    pub fn child_references(&self) -> Vec<PageReference> {
        match self {
            Self::Uber(page) => vec![page.revision_index],
            Self::RevisionRoot(page) => vec![page.name_page, page.node_index],
            Self::Indirect(page) => page.references().to_vec(),
            Self::Node(_) | Self::Name(_) => Vec::new(),
        }
    }

    pub(crate) fn child_references_mut(&mut self) -> Vec<&mut PageReference> {
        match self {
            Self::Uber(page) => vec![&mut page.revision_index],
            Self::RevisionRoot(page) => vec![&mut page.name_page, &mut page.node_index],
            Self::Indirect(page) => page.references_mut().collect(),
            Self::Node(_) | Self::Name(_) => Vec::new(),
        }
    }

    /// Serializes the page to its uncompressed payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UncommittedReference`] if a child reference is still logged.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = vec![self.kind() as u8];
        match self {
            Self::Uber(page) => page.encode(&mut buf)?,
            Self::RevisionRoot(page) => page.encode(&mut buf)?,
            Self::Indirect(page) => page.encode(&mut buf)?,
            Self::Node(page) => page.encode(&mut buf),
            Self::Name(page) => page.encode(&mut buf),
        }
        Ok(buf)
    }

    /// Deserializes an uncompressed payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] on an unknown tag, truncated input or trailing bytes.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let (&tag, mut reader) = bytes
            .split_first()
            .ok_or_else(|| Error::Corrupted { reason: "empty page payload".to_string() })?;
        let page = match PageKind::try_from(tag)? {
            PageKind::Uber => Self::Uber(UberPage::decode(&mut reader)?),
            PageKind::RevisionRoot => Self::RevisionRoot(RevisionRootPage::decode(&mut reader)?),
            PageKind::Indirect => Self::Indirect(IndirectPage::decode(&mut reader)?),
            PageKind::Node => Self::Node(NodePage::decode(&mut reader)?),
            PageKind::Name => Self::Name(NamePage::decode(&mut reader)?),
        };
        expect_end(reader, "page payload")?;
        Ok(page)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::node::{NameKeys, NodeRecord, NodeVariant};

    fn location(offset: u64) -> PageReference {
        PageReference::Persisted(PageLocation { offset, length: 10, checksum: 7 })
    }

    #[test]
    fn test_every_kind_survives_serialization() {
        let mut indirect = IndirectPage::new(8);
        indirect.set(3, location(128)).unwrap();
        indirect.set(7, location(256)).unwrap();

        let mut node_page = NodePage::new(2, 4);
        node_page
            .set(
                1,
                Some(NodeRecord::new(
                    9,
                    0,
                    NodeVariant::Element {
                        name: NameKeys::NONE,
                        attributes: Vec::new(),
                        namespaces: Vec::new(),
                    },
                )),
            )
            .unwrap();

        let mut names = NamePage::new();
        names.intern("para");

        let pages = vec![
            Page::Uber(UberPage { revision_count: 3, revision_index: location(900) }),
            Page::RevisionRoot(RevisionRootPage {
                revision: 2,
                timestamp: 1_700_000_000_000,
                node_count: 12,
                max_node_key: 40,
                name_page: location(300),
                node_index: PageReference::Empty,
            }),
            Page::Indirect(indirect),
            Page::Node(node_page),
            Page::Name(names),
        ];

        for page in pages {
            let bytes = page.serialize().unwrap();
            assert_eq!(bytes[0], page.kind() as u8);
            assert_eq!(Page::deserialize(&bytes).unwrap(), page);
        }
    }

    #[test]
    fn test_logged_child_blocks_serialization() {
        let mut indirect = IndirectPage::new(4);
        indirect.set(0, PageReference::Logged(1)).unwrap();
        let err = Page::Indirect(indirect).serialize().unwrap_err();
        assert!(matches!(err, Error::UncommittedReference));
    }

    #[test]
    fn test_deserialize_rejects_trailing_bytes() {
        let mut bytes = Page::Name(NamePage::new()).serialize().unwrap();
        bytes.push(0);
        assert!(matches!(Page::deserialize(&bytes).unwrap_err(), Error::Corrupted { .. }));
        assert!(matches!(Page::deserialize(&[]).unwrap_err(), Error::Corrupted { .. }));
    }

    #[test]
    fn test_kind_mismatch() {
        let page = Page::Name(NamePage::new());
        let err = page.as_node().unwrap_err();
        assert!(matches!(
            err,
            Error::PageKindMismatch { expected: PageKind::Node, found: PageKind::Name }
        ));
    }

    #[test]
    fn test_child_references_cover_tree_edges() {
        let root = Page::RevisionRoot(RevisionRootPage::bootstrap());
        assert_eq!(root.child_references().len(), 2);
        assert!(Page::Node(NodePage::new(0, 4)).child_references().is_empty());
    }
}
