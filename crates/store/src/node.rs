//! Node records: the unit of tree content stored in node pages.

use std::collections::HashMap;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::{
    encoding::{read_bytes, truncated, write_bytes},
    error::{Error, Result},
};

/// Node identifier. Persistent nodes have keys `>= 0`; negative keys address
/// transient records in an [`ItemList`].
pub type NodeKey = i64;

/// Reserved key meaning "no node" in parent and sibling links.
pub const NULL_NODE_KEY: NodeKey = -1;

/// Key of the document root, present in every revision.
pub const DOCUMENT_ROOT_KEY: NodeKey = 0;

/// Interned-string identifier (32-bit hash of the string).
pub type NameKey = i32;

/// Reserved name key meaning "no name".
pub const NULL_NAME_KEY: NameKey = -1;

/// Node kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeKind {
    /// The single document root.
    Document = 1,
    /// Element node.
    Element = 2,
    /// Attribute of an element.
    Attribute = 3,
    /// Namespace declaration of an element.
    Namespace = 4,
    /// Text content.
    Text = 5,
}

impl TryFrom<u8> for NodeKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Document),
            2 => Ok(Self::Element),
            3 => Ok(Self::Attribute),
            4 => Ok(Self::Namespace),
            5 => Ok(Self::Text),
            _ => Err(Error::Corrupted { reason: format!("Invalid node kind: {value}") }),
        }
    }
}

/// Interned name, namespace URI and type of a named node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameKeys {
    /// Local (or qualified) name.
    pub name: NameKey,
    /// Namespace URI.
    pub uri: NameKey,
    /// Type name.
    pub type_key: NameKey,
}

impl NameKeys {
    /// Name keys with all three parts unset.
    pub const NONE: Self = Self { name: NULL_NAME_KEY, uri: NULL_NAME_KEY, type_key: NULL_NAME_KEY };
}

/// Kind-specific payload of a [`NodeRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeVariant {
    /// Document root.
    Document,
    /// Element with its attribute and namespace children.
    Element {
        /// Interned names.
        name: NameKeys,
        /// Attribute node keys in insertion order.
        attributes: Vec<NodeKey>,
        /// Namespace node keys in insertion order.
        namespaces: Vec<NodeKey>,
    },
    /// Attribute with raw value.
    Attribute {
        /// Interned names.
        name: NameKeys,
        /// Raw value bytes.
        value: Vec<u8>,
    },
    /// Namespace declaration.
    Namespace {
        /// Interned prefix.
        prefix: NameKey,
        /// Interned URI.
        uri: NameKey,
    },
    /// Text node with raw value.
    Text {
        /// Interned type name.
        type_key: NameKey,
        /// Raw value bytes.
        value: Vec<u8>,
    },
}

/// A node of the tree.
///
/// Structural links are keys, never references: a node record is owned by
/// exactly one node-page slot and is cloned with its page on modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    /// This node's key.
    pub key: NodeKey,
    /// Parent key or [`NULL_NODE_KEY`].
    pub parent: NodeKey,
    /// First child key or [`NULL_NODE_KEY`].
    pub first_child: NodeKey,
    /// Left sibling key or [`NULL_NODE_KEY`].
    pub left_sibling: NodeKey,
    /// Right sibling key or [`NULL_NODE_KEY`].
    pub right_sibling: NodeKey,
    /// Number of children (attributes and namespaces excluded).
    pub child_count: u64,
    /// Kind-specific payload.
    pub variant: NodeVariant,
}

impl NodeRecord {
    /// Creates an unlinked node.
    pub fn new(key: NodeKey, parent: NodeKey, variant: NodeVariant) -> Self {
        Self {
            key,
            parent,
            first_child: NULL_NODE_KEY,
            left_sibling: NULL_NODE_KEY,
            right_sibling: NULL_NODE_KEY,
            child_count: 0,
            variant,
        }
    }

    /// The document root record of a fresh store.
    pub fn document_root() -> Self {
        Self::new(DOCUMENT_ROOT_KEY, NULL_NODE_KEY, NodeVariant::Document)
    }

    /// Returns this node's kind.
    pub fn kind(&self) -> NodeKind {
        match self.variant {
            NodeVariant::Document => NodeKind::Document,
            NodeVariant::Element { .. } => NodeKind::Element,
            NodeVariant::Attribute { .. } => NodeKind::Attribute,
            NodeVariant::Namespace { .. } => NodeKind::Namespace,
            NodeVariant::Text { .. } => NodeKind::Text,
        }
    }

    /// Interned name (the prefix for namespaces).
    pub fn name_key(&self) -> NameKey {
        match &self.variant {
            NodeVariant::Element { name, .. } | NodeVariant::Attribute { name, .. } => name.name,
            NodeVariant::Namespace { prefix, .. } => *prefix,
            NodeVariant::Document | NodeVariant::Text { .. } => NULL_NAME_KEY,
        }
    }

    /// Interned namespace URI.
    pub fn uri_key(&self) -> NameKey {
        match &self.variant {
            NodeVariant::Element { name, .. } | NodeVariant::Attribute { name, .. } => name.uri,
            NodeVariant::Namespace { uri, .. } => *uri,
            NodeVariant::Document | NodeVariant::Text { .. } => NULL_NAME_KEY,
        }
    }

    /// Interned type name.
    pub fn type_key(&self) -> NameKey {
        match &self.variant {
            NodeVariant::Element { name, .. } | NodeVariant::Attribute { name, .. } => {
                name.type_key
            },
            NodeVariant::Text { type_key, .. } => *type_key,
            NodeVariant::Document | NodeVariant::Namespace { .. } => NULL_NAME_KEY,
        }
    }

    /// Raw value of text and attribute nodes.
    pub fn value(&self) -> Option<&[u8]> {
        match &self.variant {
            NodeVariant::Attribute { value, .. } | NodeVariant::Text { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Attribute keys of an element (empty for other kinds).
    pub fn attributes(&self) -> &[NodeKey] {
        match &self.variant {
            NodeVariant::Element { attributes, .. } => attributes,
            _ => &[],
        }
    }

    /// Namespace keys of an element (empty for other kinds).
    pub fn namespaces(&self) -> &[NodeKey] {
        match &self.variant {
            NodeVariant::Element { namespaces, .. } => namespaces,
            _ => &[],
        }
    }

    /// Whether this node may have children.
    pub fn is_structural_container(&self) -> bool {
        matches!(self.variant, NodeVariant::Document | NodeVariant::Element { .. })
    }

    /// Rewrites every interned key of this record through `map`.
    ///
    /// Keys absent from `map` are kept.
    pub(crate) fn remap_names(&mut self, map: &HashMap<NameKey, NameKey>) {
        let remap = |key: &mut NameKey| {
            if let Some(&placed) = map.get(key) {
                *key = placed;
            }
        };
        match &mut self.variant {
            NodeVariant::Element { name, .. } | NodeVariant::Attribute { name, .. } => {
                remap(&mut name.name);
                remap(&mut name.uri);
                remap(&mut name.type_key);
            },
            NodeVariant::Namespace { prefix, uri } => {
                remap(prefix);
                remap(uri);
            },
            NodeVariant::Text { type_key, .. } => remap(type_key),
            NodeVariant::Document => {},
        }
    }

    /// Serializes the record.
    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.kind() as u8);
        for link in [self.key, self.parent, self.first_child, self.left_sibling, self.right_sibling]
        {
            buf.extend_from_slice(&link.to_le_bytes());
        }
        buf.extend_from_slice(&self.child_count.to_le_bytes());

        match &self.variant {
            NodeVariant::Document => {},
            NodeVariant::Element { name, attributes, namespaces } => {
                encode_names(buf, name);
                encode_keys(buf, attributes);
                encode_keys(buf, namespaces);
            },
            NodeVariant::Attribute { name, value } => {
                encode_names(buf, name);
                write_bytes(buf, value);
            },
            NodeVariant::Namespace { prefix, uri } => {
                buf.extend_from_slice(&prefix.to_le_bytes());
                buf.extend_from_slice(&uri.to_le_bytes());
            },
            NodeVariant::Text { type_key, value } => {
                buf.extend_from_slice(&type_key.to_le_bytes());
                write_bytes(buf, value);
            },
        }
    }

    /// Deserializes a record, advancing `reader`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] on truncated input or an unknown kind tag.
    pub(crate) fn decode(reader: &mut &[u8]) -> Result<Self> {
        const WHAT: &str = "node record";
        let kind = NodeKind::try_from(reader.read_u8().map_err(truncated(WHAT))?)?;
        let mut links = [0i64; 5];
        for link in &mut links {
            *link = reader.read_i64::<LittleEndian>().map_err(truncated(WHAT))?;
        }
        let child_count = reader.read_u64::<LittleEndian>().map_err(truncated(WHAT))?;

        let variant = match kind {
            NodeKind::Document => NodeVariant::Document,
            NodeKind::Element => NodeVariant::Element {
                name: decode_names(reader)?,
                attributes: decode_keys(reader)?,
                namespaces: decode_keys(reader)?,
            },
            NodeKind::Attribute => NodeVariant::Attribute {
                name: decode_names(reader)?,
                value: read_bytes(reader, "attribute value")?,
            },
            NodeKind::Namespace => NodeVariant::Namespace {
                prefix: reader.read_i32::<LittleEndian>().map_err(truncated(WHAT))?,
                uri: reader.read_i32::<LittleEndian>().map_err(truncated(WHAT))?,
            },
            NodeKind::Text => NodeVariant::Text {
                type_key: reader.read_i32::<LittleEndian>().map_err(truncated(WHAT))?,
                value: read_bytes(reader, "text value")?,
            },
        };

        let [key, parent, first_child, left_sibling, right_sibling] = links;
        Ok(Self { key, parent, first_child, left_sibling, right_sibling, child_count, variant })
    }
}

fn encode_names(buf: &mut Vec<u8>, names: &NameKeys) {
    buf.extend_from_slice(&names.name.to_le_bytes());
    buf.extend_from_slice(&names.uri.to_le_bytes());
    buf.extend_from_slice(&names.type_key.to_le_bytes());
}

fn decode_names(reader: &mut &[u8]) -> Result<NameKeys> {
    let read = |r: &mut &[u8]| r.read_i32::<LittleEndian>().map_err(truncated("name keys"));
    Ok(NameKeys { name: read(reader)?, uri: read(reader)?, type_key: read(reader)? })
}

fn encode_keys(buf: &mut Vec<u8>, keys: &[NodeKey]) {
    buf.extend_from_slice(&(keys.len() as u32).to_le_bytes());
    for key in keys {
        buf.extend_from_slice(&key.to_le_bytes());
    }
}

fn decode_keys(reader: &mut &[u8]) -> Result<Vec<NodeKey>> {
    let count = reader.read_u32::<LittleEndian>().map_err(truncated("key list"))? as usize;
    if reader.len() < count * 8 {
        return Err(Error::Corrupted { reason: format!("key list declares {count} keys") });
    }
    (0..count)
        .map(|_| reader.read_i64::<LittleEndian>().map_err(truncated("key list")))
        .collect()
}

/// Transient records addressed by negative keys.
///
/// Collaborators such as a query engine attach one to a read transaction to
/// navigate intermediate results alongside persistent nodes.
#[derive(Debug, Clone, Default)]
pub struct ItemList {
    items: Vec<NodeRecord>,
}

impl ItemList {
    /// Creates an empty item list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record and returns its assigned negative key (`-2`, `-3`, ...).
    pub fn add(&mut self, mut record: NodeRecord) -> NodeKey {
        let key = -(self.items.len() as NodeKey) - 2;
        record.key = key;
        self.items.push(record);
        key
    }

    /// Looks up a record by negative key.
    pub fn get(&self, key: NodeKey) -> Option<&NodeRecord> {
        if key > -2 {
            return None;
        }
        usize::try_from(-key - 2).ok().and_then(|index| self.items.get(index))
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
