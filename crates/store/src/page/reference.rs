//! Page references: the edges of the page graph.

use byteorder::{LittleEndian, ReadBytesExt};

use crate::{
    encoding::truncated,
    error::{Error, Result},
};

/// Index of a page inside a write transaction's [`PageLog`](crate::state::PageLog).
pub type LogKey = u64;

/// Durable coordinates of a page blob in the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageLocation {
    /// Byte offset of the blob from the start of the file.
    pub offset: u64,
    /// Length of the blob in bytes.
    pub length: u32,
    /// CRC32 of the compressed payload (0 when the store is not checksummed).
    pub checksum: u32,
}

impl PageLocation {
    /// Serialized size of a location.
    pub const SIZE: usize = 16;

    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.checksum.to_le_bytes());
    }

    pub(crate) fn decode(reader: &mut &[u8]) -> Result<Self> {
        const WHAT: &str = "page location";
        Ok(Self {
            offset: reader.read_u64::<LittleEndian>().map_err(truncated(WHAT))?,
            length: reader.read_u32::<LittleEndian>().map_err(truncated(WHAT))?,
            checksum: reader.read_u32::<LittleEndian>().map_err(truncated(WHAT))?,
        })
    }
}

/// Reference from a parent page to a child page.
///
/// A reference is exactly one of: unset, a dirty page owned by the current
/// write transaction's log, or the coordinates of a committed page. Logged
/// references exist only in memory; committing turns each one into
/// [`PageReference::Persisted`] before its parent is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageReference {
    /// No page at this slot.
    #[default]
    Empty,
    /// Uncommitted page held in the transaction log.
    Logged(LogKey),
    /// Committed page on durable storage.
    Persisted(PageLocation),
}

const TAG_EMPTY: u8 = 0;
const TAG_PERSISTED: u8 = 1;

impl PageReference {
    /// Returns `true` for [`PageReference::Empty`].
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Returns the durable coordinates, if committed.
    pub fn location(&self) -> Option<PageLocation> {
        match self {
            Self::Persisted(location) => Some(*location),
            _ => None,
        }
    }

    /// Serializes the reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UncommittedReference`] for a logged reference.
    pub(crate) fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Empty => buf.push(TAG_EMPTY),
            Self::Persisted(location) => {
                buf.push(TAG_PERSISTED);
                location.encode(buf);
            },
            Self::Logged(_) => return Err(Error::UncommittedReference),
        }
        Ok(())
    }

    pub(crate) fn decode(reader: &mut &[u8]) -> Result<Self> {
        match reader.read_u8().map_err(truncated("page reference"))? {
            TAG_EMPTY => Ok(Self::Empty),
            TAG_PERSISTED => Ok(Self::Persisted(PageLocation::decode(reader)?)),
            tag => Err(Error::Corrupted { reason: format!("Invalid page reference tag: {tag}") }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_persisted_reference_encoding() {
        let reference = PageReference::Persisted(PageLocation {
            offset: 4096,
            length: 321,
            checksum: 0xCAFE_F00D,
        });
        let mut buf = Vec::new();
        reference.encode(&mut buf).unwrap();
        PageReference::Empty.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 1 + PageLocation::SIZE + 1);

        let mut reader = buf.as_slice();
        assert_eq!(PageReference::decode(&mut reader).unwrap(), reference);
        assert_eq!(PageReference::decode(&mut reader).unwrap(), PageReference::Empty);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_logged_reference_cannot_be_serialized() {
        let err = PageReference::Logged(3).encode(&mut Vec::new()).unwrap_err();
        assert!(matches!(err, Error::UncommittedReference));
    }

    #[test]
    fn test_unknown_tag_is_corruption() {
        let err = PageReference::decode(&mut &[9u8][..]).unwrap_err();
        assert!(matches!(err, Error::Corrupted { .. }));
    }
}
