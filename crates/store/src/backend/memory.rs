//! In-memory storage backend for testing.

use std::io;

use parking_lot::RwLock;

use super::{HEADER_SIZE, StorageBackend};
use crate::error::{Error, Result};

/// In-memory storage backend for testing.
///
/// All data is stored in memory and lost when the backend is dropped.
/// The whole "file" is one byte vector, header included, so offsets behave
/// exactly like those of [`FileBackend`](super::FileBackend).
pub struct InMemoryBackend {
    data: RwLock<Vec<u8>>,
}

impl InMemoryBackend {
    /// Creates an empty backend with a zeroed header area.
    pub fn new() -> Self {
        Self { data: RwLock::new(vec![0u8; HEADER_SIZE]) }
    }

    /// Overwrites bytes at `offset`, simulating on-disk corruption.
    pub fn corrupt(&self, offset: u64, bytes: &[u8]) {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = (start + bytes.len()).min(data.len());
        if start < end {
            data[start..end].copy_from_slice(&bytes[..end - start]);
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_header(&self) -> Result<Vec<u8>> {
        Ok(self.data.read()[..HEADER_SIZE].to_vec())
    }

    fn write_header(&self, header: &[u8]) -> Result<()> {
        if header.len() != HEADER_SIZE {
            return Err(Error::Corrupted {
                reason: format!("Invalid header size: {} (expected {})", header.len(), HEADER_SIZE),
            });
        }
        self.data.write()[..HEADER_SIZE].copy_from_slice(header);
        Ok(())
    }

    fn append(&self, data: &[u8]) -> Result<u64> {
        let mut file = self.data.write();
        let offset = file.len() as u64;
        file.extend_from_slice(data);
        Ok(offset)
    }

    fn read_at(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        let data = self.data.read();
        let start = offset as usize;
        let end = start + length as usize;
        if end > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read of {length} bytes at {offset} past end {}", data.len()),
            )
            .into());
        }
        Ok(data[start..end].to_vec())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }
}
