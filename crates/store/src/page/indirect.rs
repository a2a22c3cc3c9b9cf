use byteorder::{LittleEndian, ReadBytesExt};

use super::PageReference;
use crate::{
    config::MAX_EXPONENT,
    encoding::truncated,
    error::{Error, Result},
};

/// Fixed-fanout interior node of an indirect page tree.
///
/// Serialized sparsely: only populated slots are written, each prefixed by its
/// slot index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectPage {
    references: Vec<PageReference>,
}

impl IndirectPage {
    /// Creates a virgin page with `fanout` empty slots.
    pub fn new(fanout: usize) -> Self {
        Self { references: vec![PageReference::Empty; fanout] }
    }

    /// Number of slots.
    pub fn fanout(&self) -> usize {
        self.references.len()
    }

    /// Reference at `offset`; out-of-range offsets read as empty.
    pub fn get(&self, offset: usize) -> PageReference {
        self.references.get(offset).copied().unwrap_or_default()
    }

    /// Replaces the reference at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyOutOfRange`] if `offset` is not a valid slot.
    pub fn set(&mut self, offset: usize, reference: PageReference) -> Result<()> {
        let capacity = self.references.len() as u64;
        let slot = self
            .references
            .get_mut(offset)
            .ok_or(Error::KeyOutOfRange { key: offset as u64, capacity })?;
        *slot = reference;
        Ok(())
    }

    /// All slots in order.
    pub fn references(&self) -> &[PageReference] {
        &self.references
    }

    pub(crate) fn references_mut(&mut self) -> impl Iterator<Item = &mut PageReference> {
        self.references.iter_mut()
    }

    /// Populated slots as `(offset, reference)` pairs.
    pub fn populated(&self) -> impl Iterator<Item = (usize, &PageReference)> {
        self.references.iter().enumerate().filter(|(_, r)| !r.is_empty())
    }

    pub(crate) fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&(self.references.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.populated().count() as u32).to_le_bytes());
        for (offset, reference) in self.populated() {
            buf.extend_from_slice(&(offset as u32).to_le_bytes());
            reference.encode(buf)?;
        }
        Ok(())
    }

    pub(crate) fn decode(reader: &mut &[u8]) -> Result<Self> {
        const WHAT: &str = "indirect page";
        let fanout = reader.read_u32::<LittleEndian>().map_err(truncated(WHAT))? as usize;
        let populated = reader.read_u32::<LittleEndian>().map_err(truncated(WHAT))? as usize;
        if fanout > 1 << MAX_EXPONENT {
            return Err(Error::Corrupted {
                reason: format!("indirect page claims fanout {fanout}"),
            });
        }
        if populated > fanout {
            return Err(Error::Corrupted {
                reason: format!("indirect page has {populated} entries for fanout {fanout}"),
            });
        }

        let mut page = Self::new(fanout);
        for _ in 0..populated {
            let offset = reader.read_u32::<LittleEndian>().map_err(truncated(WHAT))? as usize;
            let reference = PageReference::decode(reader)?;
            page.set(offset, reference).map_err(|_| Error::Corrupted {
                reason: format!("indirect slot {offset} beyond fanout {fanout}"),
            })?;
        }
        Ok(page)
    }
}
