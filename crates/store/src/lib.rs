//! revtree-store: a revision-versioned, paged copy-on-write tree store.
//!
//! Every commit produces a new immutable revision of an ordered tree of
//! document, element, attribute, namespace and text nodes. Revisions share all
//! pages they did not change; a commit appends only the modified path from the
//! touched node pages up to a new uber page.
//!
//! - **Snapshot reads**: a read transaction is bound to one revision for its lifetime
//! - **One exclusive writer**, or several writers scoped to disjoint subtrees
//! - **Append-only file**: page blobs are never overwritten
//! - **Dual-slot header**: the single mutable pointer survives torn commits
//! - **Per-page codec**: zstd, optional CRC32, optional XChaCha20-Poly1305
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        StoreManager / Session               │
//! │  (admission, registry, commit publication)  │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │             Transaction Layer               │
//! │ (ReadTransaction, WriteTransaction, Cursor) │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │               State Layer                   │
//! │  (ReadState, WriteState + PageLog, locks)   │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │               Page Layer                    │
//! │  (uber, indirect, revision root, names,     │
//! │   node pages, cache, codec)                 │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │            Storage Backend                  │
//! │      (FileBackend / InMemoryBackend)        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use revtree_store::{Navigate, Session, StoreConfig};
//!
//! let session = Session::in_memory(StoreConfig::default())?;
//!
//! let mut wtx = session.begin_write_transaction()?;
//! wtx.insert_element_as_first_child("book")?;
//! wtx.insert_attribute("lang", b"en")?;
//! let revision = wtx.commit()?;
//! wtx.close();
//!
//! let mut rtx = session.begin_read_transaction_at(revision)?;
//! assert!(rtx.move_to_first_child()?);
//! assert_eq!(rtx.name()?.as_deref(), Some("book"));
//! # Ok::<(), revtree_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![cfg_attr(test, allow(clippy::field_reassign_with_default))]

pub mod addressing;
pub mod auto_commit;
pub mod backend;
pub mod codec;
pub mod config;
mod encoding;
pub mod error;
pub mod integrity;
pub mod lock;
pub mod manager;
pub mod node;
pub mod page;
pub mod session;
pub mod state;
pub mod txn;

pub use auto_commit::{AutoCommitHandle, AutoCommitJob};
pub use backend::{FileBackend, HEADER_SIZE, InMemoryBackend, MAGIC, PageGeometry, StorageBackend};
pub use config::{AutoCommitConfig, ConfigError, ENCRYPTION_KEY_SIZE, StoreConfig};
pub use error::{Error, ErrorKind, Result};
pub use integrity::{RevisionVerifier, VerifyError, VerifyReport};
pub use lock::LockManager;
pub use manager::StoreManager;
pub use node::{
    DOCUMENT_ROOT_KEY, ItemList, NULL_NAME_KEY, NULL_NODE_KEY, NameKey, NameKeys, NodeKey,
    NodeKind, NodeRecord, NodeVariant,
};
pub use page::{CacheStats, PageLocation};
pub use session::{
    Session, SessionStats, TransactionId, TransactionInfo, TransactionMode,
};
pub use txn::{Cursor, Navigate, ReadTransaction, WriteTransaction};
