//! Little-endian field helpers shared by the page serializers.

use std::io;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::Error;

/// Maps a short read to [`Error::Corrupted`], naming the structure being decoded.
pub(crate) fn truncated(what: &'static str) -> impl Fn(io::Error) -> Error {
    move |e| Error::Corrupted { reason: format!("truncated {what}: {e}") }
}

/// Reads a `u32` length prefix followed by that many bytes.
pub(crate) fn read_bytes(reader: &mut &[u8], what: &'static str) -> Result<Vec<u8>, Error> {
    let len = reader.read_u32::<LittleEndian>().map_err(truncated(what))? as usize;
    if reader.len() < len {
        return Err(Error::Corrupted {
            reason: format!("{what} declares {len} bytes, {} remain", reader.len()),
        });
    }
    let (bytes, rest) = reader.split_at(len);
    *reader = rest;
    Ok(bytes.to_vec())
}

/// Appends a `u32` length prefix followed by `bytes`.
pub(crate) fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

/// Fails if bytes remain after a structure was fully decoded.
pub(crate) fn expect_end(reader: &[u8], what: &'static str) -> Result<(), Error> {
    if !reader.is_empty() {
        return Err(Error::Corrupted {
            reason: format!("{} trailing bytes after {what}", reader.len()),
        });
    }
    Ok(())
}
