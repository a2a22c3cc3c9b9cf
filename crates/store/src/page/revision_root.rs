use byteorder::{LittleEndian, ReadBytesExt};

use super::PageReference;
use crate::{
    encoding::truncated,
    error::Result,
    node::{DOCUMENT_ROOT_KEY, NodeKey},
};

/// Per-revision metadata, name table and node index root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionRootPage {
    /// Revision number.
    pub revision: u64,
    /// Commit time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Number of live nodes, document root included.
    pub node_count: u64,
    /// Largest node key ever allocated up to this revision.
    pub max_node_key: NodeKey,
    /// Reference to this revision's [`NamePage`](super::NamePage).
    pub name_page: PageReference,
    /// Root of the indirect tree keyed by node-page key.
    pub node_index: PageReference,
}

impl RevisionRootPage {
    /// Revision root of a fresh store, before the document root is written.
    pub fn bootstrap() -> Self {
        Self {
            revision: 0,
            timestamp: 0,
            node_count: 1,
            max_node_key: DOCUMENT_ROOT_KEY,
            name_page: PageReference::Empty,
            node_index: PageReference::Empty,
        }
    }

    pub(crate) fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&self.revision.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.node_count.to_le_bytes());
        buf.extend_from_slice(&self.max_node_key.to_le_bytes());
        self.name_page.encode(buf)?;
        self.node_index.encode(buf)
    }

    pub(crate) fn decode(reader: &mut &[u8]) -> Result<Self> {
        const WHAT: &str = "revision root page";
        Ok(Self {
            revision: reader.read_u64::<LittleEndian>().map_err(truncated(WHAT))?,
            timestamp: reader.read_u64::<LittleEndian>().map_err(truncated(WHAT))?,
            node_count: reader.read_u64::<LittleEndian>().map_err(truncated(WHAT))?,
            max_node_key: reader.read_i64::<LittleEndian>().map_err(truncated(WHAT))?,
            name_page: PageReference::decode(reader)?,
            node_index: PageReference::decode(reader)?,
        })
    }
}
