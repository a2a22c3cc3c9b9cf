//! Sessions: one store instance, its committed root and transaction admission.
//!
//! A session owns the last committed [`UberPage`], the shared page cache, the
//! live-transaction registry and two permit pools. Readers compete only for the
//! bounded reader pool; the exclusive writer takes the single writer permit and
//! fails fast when it is taken. Scoped writers take no permit and are admitted
//! by the [`LockManager`] instead.
//!
//! Commits are serialized by the header mutex. A writer whose base revision is
//! no longer the latest is rebased onto it before writing.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::{
        CommitSlot, FileBackend, FileHeader, InMemoryBackend, PageGeometry, StorageBackend,
        StorageProperties,
    },
    codec::{PageCipher, PageCodec},
    config::StoreConfig,
    error::{Error, Result},
    integrity::{RevisionVerifier, VerifyReport},
    lock::LockManager,
    node::{DOCUMENT_ROOT_KEY, NULL_NODE_KEY, NodeKey, NodeKind},
    page::{CacheStats, UberPage},
    state::{PageStore, ReadState, WriteState, load_revision_root},
    txn::{ReadTransaction, WriteTransaction},
};

// =========================================================================
// Transaction registry types
// =========================================================================

/// Random identifier of a live transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(Uuid);

impl TransactionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Whether a transaction reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    /// Read-only transaction.
    Read,
    /// Write transaction.
    Write,
}

/// Registry entry of a live transaction.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    /// Transaction id.
    pub id: TransactionId,
    /// Read or write.
    pub mode: TransactionMode,
    /// Bound revision for readers, working revision for writers.
    pub revision: u64,
    /// Transaction root for writers, document root for readers.
    pub root: NodeKey,
    /// When the transaction was opened.
    pub started_at: DateTime<Utc>,
}

/// Snapshot of session counters.
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Latest committed revision.
    pub latest_revision: u64,
    /// Open read transactions.
    pub readers: usize,
    /// Open write transactions, scoped writers included.
    pub writers: usize,
    /// Page cache counters.
    pub cache: CacheStats,
}

// =========================================================================
// PermitPool
// =========================================================================

/// Counting semaphore with fail-fast and bounded-wait acquisition.
#[derive(Debug)]
pub struct PermitPool {
    limit: usize,
    in_use: Mutex<usize>,
    available: Condvar,
}

impl PermitPool {
    /// Creates a pool of `limit` permits.
    pub fn new(limit: usize) -> Self {
        Self { limit, in_use: Mutex::new(0), available: Condvar::new() }
    }

    /// Total permits.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Permits currently held.
    pub fn in_use(&self) -> usize {
        *self.in_use.lock()
    }

    /// Takes a permit if one is free.
    pub fn try_acquire(&self) -> bool {
        let mut in_use = self.in_use.lock();
        if *in_use >= self.limit {
            return false;
        }
        *in_use += 1;
        true
    }

    /// Takes a permit, waiting at most `timeout` for one to be released.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_use = self.in_use.lock();
        while *in_use >= self.limit {
            if self.available.wait_until(&mut in_use, deadline).timed_out() && *in_use >= self.limit
            {
                return false;
            }
        }
        *in_use += 1;
        true
    }

    /// Returns a permit.
    pub fn release(&self) {
        let mut in_use = self.in_use.lock();
        *in_use = in_use.saturating_sub(1);
        self.available.notify_one();
    }
}

// =========================================================================
// SessionShared
// =========================================================================

/// State shared by a session handle and its transactions.
pub(crate) struct SessionShared {
    store: Arc<PageStore>,
    config: StoreConfig,
    last_committed: ArcSwap<UberPage>,
    /// Doubles as the commit lock.
    header: Mutex<FileHeader>,
    next_node_key: AtomicI64,
    readers: PermitPool,
    writer: PermitPool,
    locks: LockManager,
    transactions: Mutex<HashMap<TransactionId, TransactionInfo>>,
    closed: AtomicBool,
    path: Option<PathBuf>,
}

impl SessionShared {
    pub(crate) fn store(&self) -> Arc<PageStore> {
        Arc::clone(&self.store)
    }

    pub(crate) fn last_committed(&self) -> Arc<UberPage> {
        self.last_committed.load_full()
    }

    pub(crate) fn allocate_node_key(&self) -> NodeKey {
        self.next_node_key.fetch_add(1, Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    /// Writes `state` and publishes it as the latest revision.
    ///
    /// `state` is rebased first if another writer committed after it was opened.
    pub(crate) fn commit(&self, state: &mut WriteState) -> Result<Arc<UberPage>> {
        let mut header = self.header.lock();
        let latest = self.last_committed.load_full();
        if latest.revision_count != state.base_revision_count() {
            debug!(
                base = state.base_revision_count(),
                latest = latest.revision_count,
                "Rebasing write state onto latest revision"
            );
            *state = state.rebase(latest)?;
        }

        let timestamp = now_millis();
        let outcome = state.commit(timestamp)?;
        let slot = CommitSlot::new(outcome.location, outcome.uber.revision_count, timestamp);
        header.publish(self.store.backend(), slot, self.config.sync_on_commit)?;

        let uber = Arc::new(outcome.uber);
        self.last_committed.store(Arc::clone(&uber));
        debug!(
            revision = uber.revision_count - 1,
            pages_written = outcome.pages_written,
            bytes_written = outcome.bytes_written,
            "Committed revision"
        );
        Ok(uber)
    }
}

/// Commit timestamp in milliseconds since the Unix epoch.
fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

// =========================================================================
// TransactionGuard
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Reader,
    Writer,
    None,
}

/// Registration of a live transaction; dropping it releases everything it holds.
pub(crate) struct TransactionGuard {
    shared: Arc<SessionShared>,
    id: TransactionId,
    mode: TransactionMode,
    permit: Permit,
    lock: Option<(NodeKey, Vec<NodeKey>)>,
}

impl TransactionGuard {
    /// Registers a transaction that already holds `permit`.
    fn register(
        shared: &Arc<SessionShared>,
        mode: TransactionMode,
        permit: Permit,
        revision: u64,
        root: NodeKey,
    ) -> Self {
        let id = TransactionId::new();
        let info = TransactionInfo { id, mode, revision, root, started_at: Utc::now() };
        shared.transactions.lock().insert(id, info);
        debug!(transaction_id = %id, ?mode, revision, root, "Transaction opened");
        Self { shared: Arc::clone(shared), id, mode, permit, lock: None }
    }

    pub(crate) fn id(&self) -> TransactionId {
        self.id
    }

    /// Fails once the session is closed.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        self.shared.ensure_open()
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        match self.permit {
            Permit::Reader => self.shared.readers.release(),
            Permit::Writer => self.shared.writer.release(),
            Permit::None => {},
        }
        if let Some((root, ancestors)) = self.lock.take() {
            if let Err(e) = self.shared.locks.release_subtree(root, &ancestors) {
                warn!(transaction_id = %self.id, root, error = %e, "Failed to release subtree lock");
            }
        }
        self.shared.transactions.lock().remove(&self.id);
        debug!(transaction_id = %self.id, mode = ?self.mode, "Transaction closed");
    }
}

// =========================================================================
// Session
// =========================================================================

/// Handle to an open store. Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Creates a new store on `backend` and commits the bootstrap revision.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an invalid configuration, or an
    /// I/O-kind error if the bootstrap revision cannot be written.
    pub fn create(backend: Box<dyn StorageBackend>, config: StoreConfig) -> Result<Self> {
        Self::create_at(backend, config, None)
    }

    /// Opens an existing store on `backend`.
    ///
    /// Storage properties are taken from the file header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingEncryptionKey`] for an encrypted store without a
    /// configured key, [`Error::Corrupted`] if no commit slot is valid, or an
    /// I/O-kind error if the header or root page cannot be read.
    pub fn open(backend: Box<dyn StorageBackend>, config: StoreConfig) -> Result<Self> {
        Self::open_at(backend, config, None)
    }

    /// Opens the store file at `path`, creating it if it does not exist.
    ///
    /// # Errors
    ///
    /// See [`create`](Self::create) and [`open`](Self::open).
    pub fn open_path(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open_at(Box::new(FileBackend::open(path)?), config, Some(path.to_path_buf()))
        } else {
            Self::create_at(Box::new(FileBackend::create(path)?), config, Some(path.to_path_buf()))
        }
    }

    /// Creates a store held entirely in memory.
    ///
    /// # Errors
    ///
    /// See [`create`](Self::create).
    pub fn in_memory(config: StoreConfig) -> Result<Self> {
        Self::create(Box::new(InMemoryBackend::new()), config)
    }

    fn create_at(
        backend: Box<dyn StorageBackend>,
        config: StoreConfig,
        path: Option<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        let properties = StorageProperties {
            checksummed: config.checksummed,
            encrypted: config.encryption_key.is_some(),
        };
        let mut header = FileHeader::new(properties, PageGeometry::of(&config));
        backend.write_header(&header.to_bytes())?;

        let codec = PageCodec::from_config(&config);
        let store = Arc::new(PageStore::new(backend, codec, config.clone()));
        let mut state = WriteState::bootstrap(Arc::clone(&store))?;
        let timestamp = now_millis();
        let outcome = state.commit(timestamp)?;
        let slot = CommitSlot::new(outcome.location, outcome.uber.revision_count, timestamp);
        header.publish(store.backend(), slot, config.sync_on_commit)?;

        info!(
            path = ?path,
            checksummed = properties.checksummed,
            encrypted = properties.encrypted,
            "Created store"
        );
        Self::from_parts(store, config, header, outcome.uber, path)
    }

    fn open_at(
        backend: Box<dyn StorageBackend>,
        mut config: StoreConfig,
        path: Option<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        let header = FileHeader::from_bytes(&backend.read_header()?)?;
        let slot = header.choose_slot()?;

        // Pages were laid out for the geometry recorded at creation.
        let requested = PageGeometry::of(&config);
        if requested != header.geometry {
            info!(
                ?requested,
                stored = ?header.geometry,
                "Using the page geometry stored in the file"
            );
            header.geometry.apply(&mut config);
            config.validate().map_err(|e| Error::Corrupted {
                reason: format!("stored page geometry is invalid: {e}"),
            })?;
        }

        let cipher = if header.properties.encrypted {
            let key = config.encryption_key.as_ref().ok_or(Error::MissingEncryptionKey)?;
            Some(PageCipher::new(key))
        } else {
            None
        };
        let codec =
            PageCodec::new(config.compression_level, header.properties.checksummed, cipher);
        let store = Arc::new(PageStore::new(backend, codec, config.clone()));

        let uber = store.load_uncached(&slot.uber_location())?.as_uber()?.clone();
        if uber.revision_count != slot.revision_count {
            return Err(Error::Corrupted {
                reason: format!(
                    "commit slot records {} revisions, uber page {}",
                    slot.revision_count, uber.revision_count
                ),
            });
        }
        info!(path = ?path, revisions = uber.revision_count, "Opened store");
        Self::from_parts(store, config, header, uber, path)
    }

    fn from_parts(
        store: Arc<PageStore>,
        config: StoreConfig,
        header: FileHeader,
        uber: UberPage,
        path: Option<PathBuf>,
    ) -> Result<Self> {
        let latest = uber.latest_revision().ok_or(Error::RevisionNotFound { revision: 0 })?;
        let max_node_key = load_revision_root(&store, &uber, latest)?.max_node_key;
        let shared = SessionShared {
            readers: PermitPool::new(config.max_read_transactions),
            writer: PermitPool::new(1),
            store,
            config,
            last_committed: ArcSwap::from_pointee(uber),
            header: Mutex::new(header),
            next_node_key: AtomicI64::new(max_node_key + 1),
            locks: LockManager::new(),
            transactions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            path,
        };
        Ok(Self { shared: Arc::new(shared) })
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Opens a read transaction on the latest revision.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadTransactionLimit`] if no reader permit frees up within
    /// the configured timeout, or [`Error::SessionClosed`].
    pub fn begin_read_transaction(&self) -> Result<ReadTransaction> {
        let revision = self.latest_revision();
        self.begin_read_transaction_at(revision)
    }

    /// Opens a read transaction pinned to `revision`.
    ///
    /// # Errors
    ///
    /// As [`begin_read_transaction`](Self::begin_read_transaction), plus
    /// [`Error::RevisionNotFound`] for an uncommitted revision.
    pub fn begin_read_transaction_at(&self, revision: u64) -> Result<ReadTransaction> {
        let shared = &self.shared;
        shared.ensure_open()?;
        if !shared.readers.acquire_timeout(shared.config.read_acquire_timeout) {
            return Err(Error::ReadTransactionLimit { limit: shared.readers.limit() });
        }
        let guard = TransactionGuard::register(
            shared,
            TransactionMode::Read,
            Permit::Reader,
            revision,
            DOCUMENT_ROOT_KEY,
        );
        let state = ReadState::open(shared.store(), shared.last_committed(), revision)?;
        ReadTransaction::new(state, guard)
    }

    /// Opens the exclusive write transaction, rooted at the document root.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteTransactionInProgress`] without blocking if the
    /// writer permit is taken, [`Error::TransactionRootLocked`] while scoped
    /// writers are open, or [`Error::SessionClosed`].
    pub fn begin_write_transaction(&self) -> Result<WriteTransaction> {
        let shared = &self.shared;
        shared.ensure_open()?;
        if !shared.writer.try_acquire() {
            return Err(Error::WriteTransactionInProgress);
        }
        let uber = shared.last_committed();
        let mut guard = TransactionGuard::register(
            shared,
            TransactionMode::Write,
            Permit::Writer,
            uber.revision_count,
            DOCUMENT_ROOT_KEY,
        );
        shared.locks.acquire_subtree(DOCUMENT_ROOT_KEY, &[])?;
        guard.lock = Some((DOCUMENT_ROOT_KEY, Vec::new()));

        let latest = uber.latest_revision().ok_or(Error::RevisionNotFound { revision: 0 })?;
        let state = WriteState::open(shared.store(), uber, latest)?;
        WriteTransaction::new(Arc::clone(shared), state, DOCUMENT_ROOT_KEY, guard)
    }

    /// Opens a write transaction confined to the subtree of element `root`.
    ///
    /// Rooting at the document root is the same as
    /// [`begin_write_transaction`](Self::begin_write_transaction).
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTransactionRoot`] if `root` does not exist in the
    /// latest revision, [`Error::InvalidInsertPosition`] if it is not an element,
    /// [`Error::TransactionRootLocked`] or [`Error::AncestorIsTransactionRoot`]
    /// on a conflicting writer, or [`Error::SessionClosed`].
    pub fn begin_scoped_write_transaction(&self, root: NodeKey) -> Result<WriteTransaction> {
        if root == DOCUMENT_ROOT_KEY {
            return self.begin_write_transaction();
        }
        let shared = &self.shared;
        shared.ensure_open()?;

        let uber = shared.last_committed();
        let latest = uber.latest_revision().ok_or(Error::RevisionNotFound { revision: 0 })?;
        let snapshot = ReadState::open(shared.store(), Arc::clone(&uber), latest)?;
        let node = snapshot.node(root)?.ok_or(Error::UnknownTransactionRoot { key: root })?;
        if node.kind() != NodeKind::Element {
            return Err(Error::InvalidInsertPosition {
                key: root,
                kind: node.kind(),
                operation: "root a write transaction",
            });
        }

        let mut ancestors = Vec::new();
        let mut parent = node.parent;
        while parent != NULL_NODE_KEY {
            ancestors.push(parent);
            parent = snapshot
                .node(parent)?
                .map_or(NULL_NODE_KEY, |ancestor| ancestor.parent);
        }

        shared.locks.acquire_subtree(root, &ancestors)?;
        let mut guard = TransactionGuard::register(
            shared,
            TransactionMode::Write,
            Permit::None,
            uber.revision_count,
            root,
        );
        guard.lock = Some((root, ancestors));

        let state = WriteState::open(shared.store(), uber, latest)?;
        WriteTransaction::new(Arc::clone(shared), state, root, guard)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Latest committed revision.
    pub fn latest_revision(&self) -> u64 {
        self.shared.last_committed().revision_count.saturating_sub(1)
    }

    /// Path of the store file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.shared.path.as_deref()
    }

    /// Session configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// The lock manager of this session.
    pub fn locks(&self) -> &LockManager {
        &self.shared.locks
    }

    /// Live transactions.
    pub fn transactions(&self) -> Vec<TransactionInfo> {
        self.shared.transactions.lock().values().cloned().collect()
    }

    /// Current counters.
    pub fn stats(&self) -> SessionStats {
        let transactions = self.shared.transactions.lock();
        let writers =
            transactions.values().filter(|info| info.mode == TransactionMode::Write).count();
        SessionStats {
            latest_revision: self.latest_revision(),
            readers: transactions.len() - writers,
            writers,
            cache: self.shared.store.cache().stats(),
        }
    }

    /// Verifies every page reachable from `revision` on disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RevisionNotFound`] for an uncommitted revision.
    pub fn verify(&self, revision: u64) -> Result<VerifyReport> {
        let uber = self.shared.last_committed();
        RevisionVerifier::new(&self.shared.store).verify(&uber, revision)
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Closes the session.
    ///
    /// New transactions are refused and open ones fail with
    /// [`Error::SessionClosed`] on their next operation. Their permits and locks
    /// are released when they are dropped.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the final sync fails.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let open_transactions = self.shared.transactions.lock().len();
        self.shared.store.backend().sync()?;
        info!(
            path = ?self.shared.path,
            open_transactions,
            latest_revision = self.latest_revision(),
            "Closed session"
        );
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("path", &self.shared.path)
            .field("latest_revision", &self.latest_revision())
            .field("closed", &self.is_closed())
            .finish()
    }
}
