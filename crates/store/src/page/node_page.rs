use byteorder::{LittleEndian, ReadBytesExt};

use crate::{
    config::MAX_EXPONENT,
    encoding::truncated,
    error::{Error, Result},
    node::NodeRecord,
};

/// Leaf of the node index: a fixed-capacity array of node slots.
///
/// An empty slot is either never allocated or a removed node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePage {
    page_key: u64,
    slots: Vec<Option<NodeRecord>>,
}

impl NodePage {
    /// Creates a virgin page with `capacity` empty slots.
    pub fn new(page_key: u64, capacity: usize) -> Self {
        Self { page_key, slots: vec![None; capacity] }
    }

    /// Node-page key (`node_key >> E`).
    pub fn page_key(&self) -> u64 {
        self.page_key
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Record at `offset`, if present.
    pub fn get(&self, offset: usize) -> Option<&NodeRecord> {
        self.slots.get(offset).and_then(Option::as_ref)
    }

    /// Stores or clears the record at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyOutOfRange`] if `offset` is not a valid slot.
    pub fn set(&mut self, offset: usize, record: Option<NodeRecord>) -> Result<()> {
        let capacity = self.slots.len() as u64;
        let slot =
            self.slots.get_mut(offset).ok_or(Error::KeyOutOfRange { key: offset as u64, capacity })?;
        *slot = record;
        Ok(())
    }

    /// Populated slots as `(offset, record)` pairs.
    pub fn populated(&self) -> impl Iterator<Item = (usize, &NodeRecord)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| slot.as_ref().map(|r| (i, r)))
    }

    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.page_key.to_le_bytes());
        buf.extend_from_slice(&(self.slots.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.populated().count() as u32).to_le_bytes());
        for (offset, record) in self.populated() {
            buf.extend_from_slice(&(offset as u32).to_le_bytes());
            record.encode(buf);
        }
    }

    pub(crate) fn decode(reader: &mut &[u8]) -> Result<Self> {
        const WHAT: &str = "node page";
        let page_key = reader.read_u64::<LittleEndian>().map_err(truncated(WHAT))?;
        let capacity = reader.read_u32::<LittleEndian>().map_err(truncated(WHAT))? as usize;
        let populated = reader.read_u32::<LittleEndian>().map_err(truncated(WHAT))? as usize;
        if capacity > 1 << MAX_EXPONENT {
            return Err(Error::Corrupted {
                reason: format!("node page {page_key} claims {capacity} slots"),
            });
        }
        if populated > capacity {
            return Err(Error::Corrupted {
                reason: format!("node page {page_key} has {populated} records for {capacity} slots"),
            });
        }

        let mut page = Self::new(page_key, capacity);
        for _ in 0..populated {
            let offset = reader.read_u32::<LittleEndian>().map_err(truncated(WHAT))? as usize;
            let record = NodeRecord::decode(reader)?;
            page.set(offset, Some(record)).map_err(|_| Error::Corrupted {
                reason: format!("node slot {offset} beyond capacity {capacity}"),
            })?;
        }
        Ok(page)
    }
}
