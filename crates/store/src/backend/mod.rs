//! Storage backend abstraction.
//!
//! The backend trait abstracts the append-only backing file, allowing both
//! file-based (production) and in-memory (testing) implementations.
//!
//! # File layout
//!
//! ```text
//! 0                128                                             EOF
//! ├── FileHeader ──┼── page blob ── page blob ── … ── page blob ──┤
//! ```
//!
//! Page blobs carry no in-band header; their coordinates live in the parent
//! page's [`PageReference`](crate::page::PageReference). The header holds the
//! storage properties and the single mutable pointer of the store: the
//! location of the current [`UberPage`](crate::page::UberPage).
//!
//! # Crash Safety: Dual-Slot Commit
//!
//! That pointer is kept in TWO commit slots selected by a "god byte":
//! - Commits write to the INACTIVE slot, then atomically flip the god byte
//! - Recovery reads both slots and uses the valid one
//!
//! A crash at any point leaves at least one slot pointing at a fully written
//! uber page, so the store opens at either the previous or the new revision.

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::InMemoryBackend;

use byteorder::{ByteOrder, LittleEndian};
use tracing::warn;

use crate::{
    config::StoreConfig,
    error::{Error, Result},
    page::PageLocation,
};

/// File header size in bytes. Page blobs start at this offset.
pub const HEADER_SIZE: usize = 128;

/// Magic number of revtree store files.
pub const MAGIC: &[u8; 8] = b"REVTREE\0";

/// Current major format version. Files with another major version are rejected.
pub const FORMAT_MAJOR: u16 = 1;

/// Current minor format version.
pub const FORMAT_MINOR: u16 = 0;

/// Storage backend trait for abstracting file I/O.
pub trait StorageBackend: Send + Sync {
    /// Reads the [`HEADER_SIZE`]-byte file header.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the read fails.
    fn read_header(&self) -> Result<Vec<u8>>;

    /// Overwrites the file header.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write fails.
    /// Returns `Error::Corrupted` if the header size is incorrect.
    fn write_header(&self, header: &[u8]) -> Result<()>;

    /// Appends a blob after the current end of file, returning its offset.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write fails.
    fn append(&self, data: &[u8]) -> Result<u64>;

    /// Reads `length` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the read fails or runs past the end of file.
    fn read_at(&self, offset: u64, length: u32) -> Result<Vec<u8>>;

    /// Flushes all writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the sync fails.
    fn sync(&self) -> Result<()>;

    /// Returns the current file size in bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the metadata query fails.
    fn file_size(&self) -> Result<u64>;
}

/// Storage properties fixed at file creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageProperties {
    /// Page blobs end with a CRC32 of their compressed payload.
    pub checksummed: bool,
    /// Page blobs are encrypted.
    pub encrypted: bool,
}

impl StorageProperties {
    const CHECKSUMMED: u8 = 0x01;
    const ENCRYPTED: u8 = 0x02;

    fn to_flags(self) -> u8 {
        let mut flags = 0;
        if self.checksummed {
            flags |= Self::CHECKSUMMED;
        }
        if self.encrypted {
            flags |= Self::ENCRYPTED;
        }
        flags
    }

    fn from_flags(flags: u8) -> Self {
        Self {
            checksummed: flags & Self::CHECKSUMMED != 0,
            encrypted: flags & Self::ENCRYPTED != 0,
        }
    }
}

/// Shape of the indirect and node-page trees, fixed at file creation.
///
/// Every page of the file is laid out for this geometry, so a store is always
/// opened with the geometry it was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    /// Node slots per node page, as a power of two.
    pub node_page_exponent: u8,
    /// References per indirect page, as a power of two.
    pub indirect_fanout_exponent: u8,
    /// Indirect levels of the revision index.
    pub revision_index_height: u8,
    /// Indirect levels of the node index.
    pub node_index_height: u8,
}

impl PageGeometry {
    const SIZE: usize = 4;

    /// Geometry configured in `config`.
    pub fn of(config: &StoreConfig) -> Self {
        Self {
            node_page_exponent: config.node_page_exponent,
            indirect_fanout_exponent: config.indirect_fanout_exponent,
            revision_index_height: config.revision_index_height,
            node_index_height: config.node_index_height,
        }
    }

    /// Overwrites the geometry fields of `config`.
    pub fn apply(self, config: &mut StoreConfig) {
        config.node_page_exponent = self.node_page_exponent;
        config.indirect_fanout_exponent = self.indirect_fanout_exponent;
        config.revision_index_height = self.revision_index_height;
        config.node_index_height = self.node_index_height;
    }

    fn to_bytes(self) -> [u8; Self::SIZE] {
        [
            self.node_page_exponent,
            self.indirect_fanout_exponent,
            self.revision_index_height,
            self.node_index_height,
        ]
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            node_page_exponent: buf[0],
            indirect_fanout_exponent: buf[1],
            revision_index_height: buf[2],
            node_index_height: buf[3],
        }
    }
}

/// A single commit slot: where the uber page of one revision lives.
///
/// Two of these are stored in the header. The "god byte" indicates which is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSlot {
    /// Offset of the uber page blob.
    pub uber_offset: u64,
    /// Length of the uber page blob.
    pub uber_length: u32,
    /// CRC32 of the uber page payload.
    pub uber_checksum: u32,
    /// Revision count recorded by that uber page.
    pub revision_count: u64,
    /// Commit time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Checksum of this slot's fields (XXH3-64).
    pub checksum: u64,
}

impl CommitSlot {
    /// Size of a commit slot on disk.
    pub const SIZE: usize = 40;

    /// Size of checksum-protected region.
    const CHECKSUMMED_SIZE: usize = 32;

    /// Creates a slot pointing at the uber page stored at `location`.
    pub fn new(location: PageLocation, revision_count: u64, timestamp: u64) -> Self {
        let mut slot = Self {
            uber_offset: location.offset,
            uber_length: location.length,
            uber_checksum: location.checksum,
            revision_count,
            timestamp,
            checksum: 0,
        };
        slot.checksum = slot.compute_checksum();
        slot
    }

    /// Location of the uber page.
    pub fn uber_location(&self) -> PageLocation {
        PageLocation {
            offset: self.uber_offset,
            length: self.uber_length,
            checksum: self.uber_checksum,
        }
    }

    fn fields(&self) -> [u8; Self::CHECKSUMMED_SIZE] {
        let mut buf = [0u8; Self::CHECKSUMMED_SIZE];
        buf[0..8].copy_from_slice(&self.uber_offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.uber_length.to_le_bytes());
        buf[12..16].copy_from_slice(&self.uber_checksum.to_le_bytes());
        buf[16..24].copy_from_slice(&self.revision_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    fn compute_checksum(&self) -> u64 {
        xxhash_rust::xxh3::xxh3_64(&self.fields())
    }

    /// Serializes the slot to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..Self::CHECKSUMMED_SIZE].copy_from_slice(&self.fields());
        buf[Self::CHECKSUMMED_SIZE..].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Deserializes from exactly [`CommitSlot::SIZE`] bytes.
    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        let u64_at = |at: usize| LittleEndian::read_u64(&buf[at..at + 8]);
        let u32_at = |at: usize| LittleEndian::read_u32(&buf[at..at + 4]);
        Self {
            uber_offset: u64_at(0),
            uber_length: u32_at(8),
            uber_checksum: u32_at(12),
            revision_count: u64_at(16),
            timestamp: u64_at(24),
            checksum: u64_at(32),
        }
    }

    /// Verifies the checksum of this slot. A never-written slot fails.
    pub fn verify_checksum(&self) -> bool {
        self.uber_length > 0 && self.checksum == self.compute_checksum()
    }
}

/// File header: storage properties plus the dual-slot first reference.
///
/// # Layout (128 bytes)
///
/// ```text
/// Offset  Size  Field
/// 0       8     Magic "REVTREE\0"
/// 8       2     Major version
/// 10      2     Minor version
/// 12      1     Storage flags (bit 0 checksummed, bit 1 encrypted)
/// 13      2     Reserved
/// 15      1     God byte (bit 0 = primary slot index)
/// 16      40    Commit slot 0
/// 56      40    Commit slot 1
/// 96      4     Page geometry (node page exp, fanout exp, revision height, node height)
/// 100     28    Reserved
/// ```
///
/// # Publishing a commit
///
/// 1. Write the new slot into the secondary position; the primary is untouched.
/// 2. Sync, so the secondary carries a valid checksum on disk.
/// 3. Flip the god byte. This single-byte change is the commit point.
/// 4. Sync again.
///
/// On open the primary slot is tried first; if its checksum fails the other
/// slot is used. If both fail the store is unrecoverable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Major format version.
    pub major: u16,
    /// Minor format version.
    pub minor: u16,
    /// Storage properties.
    pub properties: StorageProperties,
    /// Tree geometry of every page in the file.
    pub geometry: PageGeometry,
    /// God byte: bit 0 = primary slot.
    pub god_byte: u8,
    /// Both commit slots.
    pub slots: [CommitSlot; 2],
}

impl FileHeader {
    /// Offset of the god byte in the header.
    pub const GOD_BYTE_OFFSET: usize = 15;

    /// Bit mask for primary slot index in god byte.
    pub const GOD_BYTE_SLOT_MASK: u8 = 0x01;

    const SLOT_OFFSETS: [usize; 2] = [16, 16 + CommitSlot::SIZE];

    /// Offset of the page geometry in the header.
    pub const GEOMETRY_OFFSET: usize = 16 + 2 * CommitSlot::SIZE;

    /// Creates the header of a new file with both slots unset.
    pub fn new(properties: StorageProperties, geometry: PageGeometry) -> Self {
        Self {
            major: FORMAT_MAJOR,
            minor: FORMAT_MINOR,
            properties,
            geometry,
            god_byte: 0,
            slots: [CommitSlot::default(); 2],
        }
    }

    /// Returns the index of the primary (active) slot.
    pub fn primary_slot_index(&self) -> usize {
        (self.god_byte & Self::GOD_BYTE_SLOT_MASK) as usize
    }

    /// Returns the index of the secondary (inactive) slot.
    pub fn secondary_slot_index(&self) -> usize {
        1 - self.primary_slot_index()
    }

    /// Flips the primary slot.
    pub fn flip_primary_slot(&mut self) {
        self.god_byte ^= Self::GOD_BYTE_SLOT_MASK;
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..10].copy_from_slice(&self.major.to_le_bytes());
        buf[10..12].copy_from_slice(&self.minor.to_le_bytes());
        buf[12] = self.properties.to_flags();
        buf[Self::GOD_BYTE_OFFSET] = self.god_byte;
        for (slot, at) in self.slots.iter().zip(Self::SLOT_OFFSETS) {
            buf[at..at + CommitSlot::SIZE].copy_from_slice(&slot.to_bytes());
        }
        let at = Self::GEOMETRY_OFFSET;
        buf[at..at + PageGeometry::SIZE].copy_from_slice(&self.geometry.to_bytes());
        buf
    }

    /// Deserializes from bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if the buffer is too short.
    /// Returns `Error::InvalidMagic` if the magic number does not match.
    /// Returns `Error::UnsupportedVersion` if the major version differs.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Corrupted { reason: "Header too short".to_string() });
        }
        if &buf[0..8] != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let major = LittleEndian::read_u16(&buf[8..10]);
        let minor = LittleEndian::read_u16(&buf[10..12]);
        if major != FORMAT_MAJOR {
            return Err(Error::UnsupportedVersion { major, minor });
        }

        let slot_at = |at: usize| {
            let mut bytes = [0u8; CommitSlot::SIZE];
            bytes.copy_from_slice(&buf[at..at + CommitSlot::SIZE]);
            CommitSlot::from_bytes(&bytes)
        };
        Ok(Self {
            major,
            minor,
            properties: StorageProperties::from_flags(buf[12]),
            geometry: PageGeometry::from_bytes(&buf[Self::GEOMETRY_OFFSET..]),
            god_byte: buf[Self::GOD_BYTE_OFFSET],
            slots: [slot_at(Self::SLOT_OFFSETS[0]), slot_at(Self::SLOT_OFFSETS[1])],
        })
    }

    /// Validates the header and returns the slot to recover from.
    ///
    /// If the indicated primary slot has an invalid checksum, tries the secondary.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if both commit slots have invalid checksums.
    pub fn choose_slot(&self) -> Result<CommitSlot> {
        let primary = self.slots[self.primary_slot_index()];
        if primary.verify_checksum() {
            return Ok(primary);
        }

        let secondary = self.slots[self.secondary_slot_index()];
        if secondary.verify_checksum() {
            warn!(
                primary = self.primary_slot_index(),
                revision_count = secondary.revision_count,
                "Primary commit slot invalid, recovering from secondary slot"
            );
            return Ok(secondary);
        }

        Err(Error::Corrupted { reason: "Both commit slots have invalid checksums".to_string() })
    }

    /// Publishes `slot` as the new first reference, following the dual-slot protocol.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if a header write or sync fails. The in-memory header
    /// is only flipped once the new slot has been written.
    pub fn publish(
        &mut self,
        backend: &dyn StorageBackend,
        slot: CommitSlot,
        sync: bool,
    ) -> Result<()> {
        let secondary = self.secondary_slot_index();
        let mut next = self.clone();
        next.slots[secondary] = slot;
        backend.write_header(&next.to_bytes())?;
        if sync {
            backend.sync()?;
        }

        next.flip_primary_slot();
        backend.write_header(&next.to_bytes())?;
        if sync {
            backend.sync()?;
        }
        *self = next;
        Ok(())
    }
}
