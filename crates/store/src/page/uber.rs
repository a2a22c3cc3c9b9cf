use byteorder::{LittleEndian, ReadBytesExt};

use super::PageReference;
use crate::{encoding::truncated, error::Result};

/// Root of the whole store: revision count plus the revision index root.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UberPage {
    /// Number of committed revisions. Revision numbers run `0..revision_count`.
    pub revision_count: u64,
    /// Root of the indirect tree keyed by revision number.
    pub revision_index: PageReference,
}

impl UberPage {
    /// The bootstrap uber page, before any revision exists.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of the newest committed revision, if any.
    pub fn latest_revision(&self) -> Option<u64> {
        self.revision_count.checked_sub(1)
    }

    pub(crate) fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&self.revision_count.to_le_bytes());
        self.revision_index.encode(buf)
    }

    pub(crate) fn decode(reader: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            revision_count: reader.read_u64::<LittleEndian>().map_err(truncated("uber page"))?,
            revision_index: PageReference::decode(reader)?,
        })
    }
}
