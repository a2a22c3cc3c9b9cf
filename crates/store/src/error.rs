//! Error types for the revtree storage engine.
//!
//! Every variant belongs to exactly one [`ErrorKind`]:
//!
//! - **Usage**: the caller broke an API contract (second writer, illegal edit on a
//!   transaction root, unlock without lock). Rejected before any state changes.
//! - **Io**: the environment failed (file read/write, checksum, decompression,
//!   decryption). The transaction that hit it should be closed; retrying belongs to
//!   the caller.
//! - **State**: the engine was asked to resolve something that does not exist in
//!   the addressed revision (unknown revision, key outside the index capacity).

use std::io;

use snafu::Snafu;

use crate::{config::ConfigError, node::NodeKey};

/// Result type alias for revtree operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Programming-contract violation. Not retryable.
    Usage,
    /// Environment failure while reading or writing pages. Retryable by caller policy.
    Io,
    /// Addressed revision or key cannot be resolved. Not retryable.
    State,
}

/// Errors that can occur during revtree operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// I/O error from the underlying storage backend.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Page checksum verification failed.
    #[snafu(display("Checksum mismatch at offset {offset}: expected {expected:#010x}, found {actual:#010x}"))]
    ChecksumMismatch {
        /// File offset of the page blob.
        offset: u64,
        /// Checksum recorded by the referencing page.
        expected: u32,
        /// Checksum computed over the stored bytes.
        actual: u32,
    },

    /// Page payload could not be compressed.
    #[snafu(display("Compression failed: {source}"))]
    Compress {
        /// The underlying zstd error.
        source: io::Error,
    },

    /// Page payload could not be decompressed.
    #[snafu(display("Decompression failed: {source}"))]
    Decompress {
        /// The underlying zstd error.
        source: io::Error,
    },

    /// Page payload could not be encrypted.
    #[snafu(display("Page encryption failed"))]
    Encrypt,

    /// Page payload could not be decrypted (wrong key or tampered bytes).
    #[snafu(display("Page decryption failed"))]
    Decrypt,

    /// Store file is corrupted or has invalid format.
    #[snafu(display("Corrupted store: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// Invalid magic number in file header.
    #[snafu(display("Invalid store magic number"))]
    InvalidMagic,

    /// Unsupported file format version.
    #[snafu(display("Unsupported format version: {major}.{minor}"))]
    UnsupportedVersion {
        /// Major version found in the header.
        major: u16,
        /// Minor version found in the header.
        minor: u16,
    },

    /// A write transaction is already open on this session.
    #[snafu(display("Write transaction already in progress"))]
    WriteTransactionInProgress,

    /// All read transaction permits are in use.
    #[snafu(display("Read transaction limit of {limit} reached"))]
    ReadTransactionLimit {
        /// Configured maximum of concurrent readers.
        limit: usize,
    },

    /// The requested transaction root is already locked by another writer.
    #[snafu(display("Node {key} is locked by another write transaction"))]
    TransactionRootLocked {
        /// The requested transaction root.
        key: NodeKey,
    },

    /// An ancestor of the requested root is the root of another writer.
    #[snafu(display("Ancestor {ancestor} of node {key} is the root of another write transaction"))]
    AncestorIsTransactionRoot {
        /// The requested transaction root.
        key: NodeKey,
        /// The conflicting ancestor.
        ancestor: NodeKey,
    },

    /// The requested transaction root does not exist in the latest revision.
    #[snafu(display("Transaction root {key} does not exist"))]
    UnknownTransactionRoot {
        /// The requested transaction root.
        key: NodeKey,
    },

    /// Sibling insertion next to the transaction root.
    #[snafu(display("Cannot insert a sibling of transaction root {key}"))]
    TransactionRootSiblingEdit {
        /// The transaction root.
        key: NodeKey,
    },

    /// Removal of the transaction root.
    #[snafu(display("Cannot remove transaction root {key}"))]
    RemoveTransactionRoot {
        /// The transaction root.
        key: NodeKey,
    },

    /// Removal of the document root.
    #[snafu(display("Cannot remove the document root"))]
    RemoveDocumentRoot,

    /// Mutation target lies outside the subtree owned by this transaction.
    #[snafu(display("Node {key} is outside the subtree rooted at {root}"))]
    OutOfScope {
        /// The mutation target.
        key: NodeKey,
        /// The transaction root.
        root: NodeKey,
    },

    /// Insert or update is not valid for the current node kind.
    #[snafu(display("Cannot {operation} at node {key} of kind {kind:?}"))]
    InvalidInsertPosition {
        /// The current node.
        key: NodeKey,
        /// Kind of the current node.
        kind: crate::node::NodeKind,
        /// Short description of the rejected operation.
        operation: &'static str,
    },

    /// Unlock of a key without a matching lock.
    #[snafu(display("Node {key} is not locked"))]
    LockUnderflow {
        /// The key that was unlocked.
        key: NodeKey,
    },

    /// The session was closed while the transaction was still open.
    #[snafu(display("Session is closed"))]
    SessionClosed,

    /// The store is encrypted but no key was configured.
    #[snafu(display("Store is encrypted but no encryption key was configured"))]
    MissingEncryptionKey,

    /// A session for this path is already registered.
    #[snafu(display("Session already open for {path}"))]
    SessionAlreadyOpen {
        /// The canonical store path.
        path: String,
    },

    /// Configuration rejected by validation.
    #[snafu(display("Invalid configuration: {source}"))]
    InvalidConfig {
        /// The validation failure.
        source: ConfigError,
    },

    /// Negative (non-persistent) key dereferenced without an item list.
    #[snafu(display("Node key {key} is non-persistent and no item list is attached"))]
    NoItemList {
        /// The negative key.
        key: NodeKey,
    },

    /// Revision number not present in the revision index.
    #[snafu(display("Revision {revision} not found"))]
    RevisionNotFound {
        /// The requested revision.
        revision: u64,
    },

    /// Key exceeds the capacity of an indirect page tree.
    #[snafu(display("Key {key} exceeds index capacity of {capacity}"))]
    KeyOutOfRange {
        /// The key being addressed.
        key: u64,
        /// Number of addressable keys.
        capacity: u64,
    },

    /// Attempt to serialize a reference that still points into a transaction log.
    #[snafu(display("Cannot serialize uncommitted page reference"))]
    UncommittedReference,

    /// A page reference points at a log entry that no longer exists.
    #[snafu(display("Page log entry {key} is missing"))]
    MissingLogEntry {
        /// The log key.
        key: u64,
    },

    /// Page found at a reference is not of the expected kind.
    #[snafu(display("Page kind mismatch: expected {expected:?}, found {found:?}"))]
    PageKindMismatch {
        /// The expected kind.
        expected: crate::page::PageKind,
        /// The kind actually found.
        found: crate::page::PageKind,
    },
}

impl Error {
    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io { .. }
            | Error::ChecksumMismatch { .. }
            | Error::Compress { .. }
            | Error::Decompress { .. }
            | Error::Encrypt
            | Error::Decrypt
            | Error::Corrupted { .. }
            | Error::InvalidMagic
            | Error::UnsupportedVersion { .. } => ErrorKind::Io,
            Error::WriteTransactionInProgress
            | Error::ReadTransactionLimit { .. }
            | Error::TransactionRootLocked { .. }
            | Error::AncestorIsTransactionRoot { .. }
            | Error::UnknownTransactionRoot { .. }
            | Error::TransactionRootSiblingEdit { .. }
            | Error::RemoveTransactionRoot { .. }
            | Error::RemoveDocumentRoot
            | Error::OutOfScope { .. }
            | Error::InvalidInsertPosition { .. }
            | Error::LockUnderflow { .. }
            | Error::SessionClosed
            | Error::MissingEncryptionKey
            | Error::SessionAlreadyOpen { .. }
            | Error::InvalidConfig { .. } => ErrorKind::Usage,
            Error::NoItemList { .. }
            | Error::RevisionNotFound { .. }
            | Error::KeyOutOfRange { .. }
            | Error::UncommittedReference
            | Error::MissingLogEntry { .. }
            | Error::PageKindMismatch { .. } => ErrorKind::State,
        }
    }

    /// Returns `true` if a caller may reasonably retry after this error
    /// (for example by reopening the session).
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Io
    }
}

// Provide automatic conversion from io::Error to Error::Io for ergonomic ? usage
impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

impl From<ConfigError> for Error {
    fn from(source: ConfigError) -> Self {
        Error::InvalidConfig { source }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_checksum_mismatch() {
        let err = Error::ChecksumMismatch { offset: 128, expected: 0xDEADBEEF, actual: 1 };
        assert_eq!(
            format!("{err}"),
            "Checksum mismatch at offset 128: expected 0xdeadbeef, found 0x00000001"
        );
    }

    #[test]
    fn test_error_display_ancestor_conflict() {
        let err = Error::AncestorIsTransactionRoot { key: 7, ancestor: 2 };
        assert_eq!(
            format!("{err}"),
            "Ancestor 2 of node 7 is the root of another write transaction"
        );
    }

    #[test]
    fn test_error_kinds_are_disjoint() {
        assert_eq!(Error::WriteTransactionInProgress.kind(), ErrorKind::Usage);
        assert_eq!(Error::LockUnderflow { key: 3 }.kind(), ErrorKind::Usage);
        assert_eq!(Error::RemoveDocumentRoot.kind(), ErrorKind::Usage);
        assert_eq!(Error::Decrypt.kind(), ErrorKind::Io);
        assert_eq!(
            Error::ChecksumMismatch { offset: 0, expected: 0, actual: 1 }.kind(),
            ErrorKind::Io
        );
        assert_eq!(Error::NoItemList { key: -3 }.kind(), ErrorKind::State);
        assert_eq!(Error::RevisionNotFound { revision: 9 }.kind(), ErrorKind::State);
    }

    #[test]
    fn test_only_io_errors_are_retryable() {
        let io_err = Error::from(io::Error::new(io::ErrorKind::Other, "disk gone"));
        assert!(io_err.is_retryable());
        assert!(!Error::SessionClosed.is_retryable());
        assert!(!Error::RevisionNotFound { revision: 1 }.is_retryable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        match err {
            Error::Io { source } => assert_eq!(source.kind(), io::ErrorKind::PermissionDenied),
            _ => panic!("Expected Io variant"),
        }
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error as StdError;

        let err = Error::from(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        assert!(err.source().is_some(), "Error::Io should have a source");
    }
}
