use std::collections::BTreeMap;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::{
    encoding::{read_bytes, truncated, write_bytes},
    error::{Error, Result},
    node::{NULL_NAME_KEY, NameKey},
};

/// String interning table of one revision.
///
/// Keys are the xxh3 hash of the string truncated to 32 bits. Collisions probe
/// linearly to the next free key; [`NULL_NAME_KEY`] is never assigned.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NamePage {
    names: BTreeMap<NameKey, String>,
}

impl NamePage {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Name for `key`.
    pub fn get(&self, key: NameKey) -> Option<&str> {
        self.names.get(&key).map(String::as_str)
    }

    /// Key of an already interned `name`.
    pub fn find(&self, name: &str) -> Option<NameKey> {
        let mut key = initial_key(name);
        loop {
            match self.names.get(&key) {
                Some(existing) if existing == name => return Some(key),
                Some(_) => key = next_key(key),
                None => return None,
            }
        }
    }

    /// Interns `name`, returning its key and whether it was newly added.
    pub fn intern(&mut self, name: &str) -> (NameKey, bool) {
        let mut key = initial_key(name);
        loop {
            match self.names.get(&key) {
                Some(existing) if existing == name => return (key, false),
                Some(_) => key = next_key(key),
                None => {
                    self.names.insert(key, name.to_string());
                    return (key, true);
                },
            }
        }
    }

    /// Re-interns a name carried over from another table, as when replaying
    /// names onto a newer revision.
    ///
    /// Keeps `key` when this table already maps it to `name`; otherwise the
    /// name is interned here and may land under a different key. Returns the
    /// key the name ends up under, which callers must use from then on.
    pub fn insert_with_key(&mut self, key: NameKey, name: &str) -> NameKey {
        if self.get(key) == Some(name) {
            return key;
        }
        self.intern(name).0
    }

    /// Number of interned names.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.names.len() as u32).to_le_bytes());
        for (key, name) in &self.names {
            buf.extend_from_slice(&key.to_le_bytes());
            write_bytes(buf, name.as_bytes());
        }
    }

    pub(crate) fn decode(reader: &mut &[u8]) -> Result<Self> {
        let count = reader.read_u32::<LittleEndian>().map_err(truncated("name page"))?;
        let mut names = BTreeMap::new();
        for _ in 0..count {
            let key = reader.read_i32::<LittleEndian>().map_err(truncated("name page"))?;
            let bytes = read_bytes(reader, "name")?;
            let name = String::from_utf8(bytes).map_err(|e| Error::Corrupted {
                reason: format!("name {key} is not UTF-8: {e}"),
            })?;
            names.insert(key, name);
        }
        Ok(Self { names })
    }
}

fn initial_key(name: &str) -> NameKey {
    let key = xxhash_rust::xxh3::xxh3_64(name.as_bytes()) as u32 as NameKey;
    if key == NULL_NAME_KEY { next_key(key) } else { key }
}

fn next_key(key: NameKey) -> NameKey {
    let next = key.wrapping_add(1);
    if next == NULL_NAME_KEY { next.wrapping_add(1) } else { next }
}
