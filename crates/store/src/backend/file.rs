//! File-based storage backend using position-based I/O (`pread`/`pwrite`).
//!
//! On Unix, reads are completely lock-free via [`std::os::unix::fs::FileExt`]:
//! `read_exact_at()` takes `&self` and never touches the file cursor, allowing
//! concurrent reads from multiple threads with zero synchronization.
//!
//! Appends and header writes are serialized via a [`parking_lot::Mutex`] that
//! also tracks the end of file, so two appends can never claim the same range.

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;

use super::{HEADER_SIZE, StorageBackend};
use crate::error::{Error, Result};

/// File-based storage backend.
///
/// Durability requires the caller to invoke [`sync`](StorageBackend::sync)
/// after writes. Crash safety is provided by the dual-slot protocol in
/// [`FileHeader`](super::FileHeader), not by this backend alone.
pub struct FileBackend {
    /// The underlying file handle.
    file: File,
    /// Serializes writes; holds the current end of file.
    end: Mutex<u64>,
    path: PathBuf,
}

impl FileBackend {
    /// Opens an existing store file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened.
    /// Returns [`Error::Corrupted`] if it is shorter than a header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len < HEADER_SIZE as u64 {
            return Err(Error::Corrupted {
                reason: format!("file is {len} bytes, shorter than the {HEADER_SIZE}-byte header"),
            });
        }
        Ok(Self { file, end: Mutex::new(len), path: path.as_ref().to_path_buf() })
    }

    /// Creates a new store file with a zeroed header area, truncating any existing file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be created or written.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        write_all_at_offset(&file, &[0u8; HEADER_SIZE], 0)?;
        file.sync_all()?;
        Ok(Self {
            file,
            end: Mutex::new(HEADER_SIZE as u64),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Path this backend was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_header(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; HEADER_SIZE];
        read_exact_at_offset(&self.file, &mut buf, 0)?;
        Ok(buf)
    }

    fn write_header(&self, header: &[u8]) -> Result<()> {
        if header.len() != HEADER_SIZE {
            return Err(Error::Corrupted {
                reason: format!("Invalid header size: {} (expected {})", header.len(), HEADER_SIZE),
            });
        }

        let _guard = self.end.lock();
        write_all_at_offset(&self.file, header, 0)?;
        Ok(())
    }

    fn append(&self, data: &[u8]) -> Result<u64> {
        let mut end = self.end.lock();
        let offset = *end;
        write_all_at_offset(&self.file, data, offset)?;
        *end += data.len() as u64;
        Ok(offset)
    }

    fn read_at(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length as usize];
        read_exact_at_offset(&self.file, &mut buf, offset)?;
        Ok(buf)
    }

    fn sync(&self) -> Result<()> {
        // sync_data() takes &self, no lock needed.
        self.file.sync_data()?;
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(*self.end.lock())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific position-based I/O helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact_at(buf, offset)?;
    Ok(())
}

/// Windows fallback: `seek_read` updates the file cursor, so this is NOT
/// lock-free.
#[cfg(windows)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unexpected end of file during seek_read",
            )
            .into());
        }
        pos += n;
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(data, offset)?;
    Ok(())
}

#[cfg(windows)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}
