//! Admission and locking across concurrent transactions of one session.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

use std::{
    sync::{Arc, Barrier},
    thread,
    time::Duration,
};

use revtree_store::{
    DOCUMENT_ROOT_KEY, Error, Navigate, NodeKey, NodeKind, Session, StoreConfig, TransactionMode,
};

/// Builds `doc → (a → a1), b` and returns `(a, a1, b)`.
fn two_branches(session: &Session) -> (NodeKey, NodeKey, NodeKey) {
    let mut wtx = session.begin_write_transaction().unwrap();
    let a = wtx.insert_element_as_first_child("a").unwrap();
    let a1 = wtx.insert_element_as_first_child("a1").unwrap();
    wtx.move_to(a).unwrap();
    let b = wtx.insert_element_as_right_sibling("b").unwrap();
    wtx.commit().unwrap();
    (a, a1, b)
}

#[test]
fn test_second_exclusive_writer_fails_fast() {
    let session = Session::in_memory(StoreConfig::default()).unwrap();
    let wtx = session.begin_write_transaction().unwrap();
    let err = session.begin_write_transaction().unwrap_err();
    assert!(matches!(err, Error::WriteTransactionInProgress));

    drop(wtx);
    assert!(session.begin_write_transaction().is_ok());
}

#[test]
fn test_reader_limit() {
    let config = StoreConfig::builder()
        .max_read_transactions(2)
        .read_acquire_timeout(Duration::from_millis(20))
        .build()
        .unwrap();
    let session = Session::in_memory(config).unwrap();

    let first = session.begin_read_transaction().unwrap();
    let _second = session.begin_read_transaction().unwrap();
    let err = session.begin_read_transaction().unwrap_err();
    assert!(matches!(err, Error::ReadTransactionLimit { limit: 2 }));

    // Writers do not compete for reader permits.
    assert!(session.begin_write_transaction().is_ok());

    first.close();
    assert!(session.begin_read_transaction().is_ok());
}

#[test]
fn test_waiting_reader_is_admitted_when_a_permit_frees_up() {
    let config = StoreConfig::builder()
        .max_read_transactions(1)
        .read_acquire_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let session = Session::in_memory(config).unwrap();
    let held = session.begin_read_transaction().unwrap();

    let waiter = {
        let session = session.clone();
        thread::spawn(move || session.begin_read_transaction().map(|rtx| rtx.revision()))
    };
    thread::sleep(Duration::from_millis(20));
    drop(held);
    assert_eq!(waiter.join().unwrap().unwrap(), 0);
}

#[test]
fn test_scoped_writers_on_disjoint_subtrees() {
    let session = Session::in_memory(StoreConfig::default()).unwrap();
    let (a, a1, b) = two_branches(&session);

    let mut left = session.begin_scoped_write_transaction(a).unwrap();
    let mut right = session.begin_scoped_write_transaction(b).unwrap();
    assert_eq!(left.root(), a);
    assert_eq!(left.node_key(), a, "cursor starts on the transaction root");

    // Conflicts with the open scoped writers.
    assert!(matches!(
        session.begin_scoped_write_transaction(a).unwrap_err(),
        Error::TransactionRootLocked { key } if key == a
    ));
    assert!(matches!(
        session.begin_scoped_write_transaction(a1).unwrap_err(),
        Error::AncestorIsTransactionRoot { key, ancestor } if key == a1 && ancestor == a
    ));
    assert!(matches!(
        session.begin_write_transaction().unwrap_err(),
        Error::TransactionRootLocked { key: DOCUMENT_ROOT_KEY }
    ));

    // Root siblings are off limits, children are not.
    assert!(matches!(
        left.insert_element_as_right_sibling("x").unwrap_err(),
        Error::TransactionRootSiblingEdit { key } if key == a
    ));
    assert!(matches!(left.remove().unwrap_err(), Error::RemoveTransactionRoot { .. }));
    let from_left = left.insert_element_as_first_child("from-left").unwrap();
    let from_right = right.insert_element_as_first_child("from-right").unwrap();

    // Navigation may leave the subtree, mutation may not.
    assert!(left.move_to(b).unwrap());
    assert!(matches!(
        left.insert_element_as_first_child("x").unwrap_err(),
        Error::OutOfScope { root, .. } if root == a
    ));

    assert_eq!(left.commit().unwrap(), 2);
    // The right writer is rebased onto revision 2.
    assert_eq!(right.commit().unwrap(), 3);
    drop(left);
    drop(right);

    let mut rtx = session.begin_read_transaction().unwrap();
    assert_eq!(rtx.revision(), 3);
    assert_eq!(rtx.node_count(), 6);
    assert!(rtx.move_to(from_left).unwrap());
    assert_eq!(rtx.node().parent, a);
    assert!(rtx.move_to(from_right).unwrap());
    assert_eq!(rtx.node().parent, b);
    assert!(rtx.move_to(a).unwrap());
    assert_eq!(rtx.node().child_count, 2);
    assert!(session.verify(3).unwrap().is_clean());

    // All locks are gone once both writers are dropped.
    assert!(!session.locks().is_locked(DOCUMENT_ROOT_KEY));
    assert!(session.begin_write_transaction().is_ok());
}

#[test]
fn test_rebase_keeps_names_whose_keys_collide() {
    // Distinct names sharing the low 32 bits of their xxh3 hash, hence the
    // same initial name key.
    const FIRST: &str = "n91119";
    const SECOND: &str = "n112395";
    let low = |name: &str| xxhash_rust::xxh3::xxh3_64(name.as_bytes()) as u32;
    assert_eq!(low(FIRST), low(SECOND));

    let session = Session::in_memory(StoreConfig::default()).unwrap();
    let (a, _, b) = two_branches(&session);

    let mut left = session.begin_scoped_write_transaction(a).unwrap();
    let mut right = session.begin_scoped_write_transaction(b).unwrap();
    let first = left.insert_element_as_first_child(FIRST).unwrap();
    let second = right.insert_element_as_first_child(SECOND).unwrap();
    left.insert_attribute(SECOND, b"left").unwrap();
    right.insert_attribute(FIRST, b"right").unwrap();

    assert_eq!(left.commit().unwrap(), 2);
    assert_eq!(right.commit().unwrap(), 3);

    // The rebased writer keeps seeing its own names.
    right.move_to(second).unwrap();
    assert_eq!(right.name().unwrap().as_deref(), Some(SECOND));
    drop(left);
    drop(right);

    let mut rtx = session.begin_read_transaction().unwrap();
    assert!(rtx.move_to(first).unwrap());
    assert_eq!(rtx.name().unwrap().as_deref(), Some(FIRST));
    assert!(rtx.move_to_attribute(0).unwrap());
    assert_eq!(rtx.name().unwrap().as_deref(), Some(SECOND));
    assert_eq!(rtx.value(), Some(&b"left"[..]));

    assert!(rtx.move_to(second).unwrap());
    assert_eq!(rtx.name().unwrap().as_deref(), Some(SECOND));
    assert!(rtx.move_to_attribute(0).unwrap());
    assert_eq!(rtx.name().unwrap().as_deref(), Some(FIRST));
    assert_eq!(rtx.value(), Some(&b"right"[..]));
    assert!(session.verify(3).unwrap().is_clean());
}

#[test]
fn test_exclusive_writer_blocks_scoped_writers() {
    let session = Session::in_memory(StoreConfig::default()).unwrap();
    let (a, _, _) = two_branches(&session);

    let wtx = session.begin_write_transaction().unwrap();
    assert!(matches!(
        session.begin_scoped_write_transaction(a).unwrap_err(),
        Error::AncestorIsTransactionRoot { ancestor: DOCUMENT_ROOT_KEY, .. }
    ));
    drop(wtx);
    assert!(session.begin_scoped_write_transaction(a).is_ok());
}

#[test]
fn test_scoped_root_must_be_an_existing_element() {
    let session = Session::in_memory(StoreConfig::default()).unwrap();
    let (a, _, _) = two_branches(&session);

    let mut wtx = session.begin_write_transaction().unwrap();
    wtx.move_to(a).unwrap();
    let attribute = wtx.insert_attribute("k", b"v").unwrap();
    wtx.commit().unwrap();
    drop(wtx);

    assert!(matches!(
        session.begin_scoped_write_transaction(999).unwrap_err(),
        Error::UnknownTransactionRoot { key: 999 }
    ));
    assert!(matches!(
        session.begin_scoped_write_transaction(attribute).unwrap_err(),
        Error::InvalidInsertPosition { kind: NodeKind::Attribute, .. }
    ));
    assert!(session.transactions().is_empty());
}

#[test]
fn test_failed_exclusive_admission_releases_the_writer_permit() {
    let session = Session::in_memory(StoreConfig::default()).unwrap();
    let (a, _, _) = two_branches(&session);

    let scoped = session.begin_scoped_write_transaction(a).unwrap();
    assert!(session.begin_write_transaction().is_err());
    drop(scoped);
    assert!(session.begin_write_transaction().is_ok());
}

#[test]
fn test_registry_and_stats() {
    let session = Session::in_memory(StoreConfig::default()).unwrap();
    let (a, _, _) = two_branches(&session);

    let rtx = session.begin_read_transaction().unwrap();
    let wtx = session.begin_scoped_write_transaction(a).unwrap();

    let stats = session.stats();
    assert_eq!(stats.latest_revision, 1);
    assert_eq!(stats.readers, 1);
    assert_eq!(stats.writers, 1);

    let transactions = session.transactions();
    let writer = transactions.iter().find(|info| info.id == wtx.id()).unwrap();
    assert_eq!(writer.mode, TransactionMode::Write);
    assert_eq!(writer.root, a);
    assert_eq!(writer.revision, 2);
    let reader = transactions.iter().find(|info| info.id == rtx.id()).unwrap();
    assert_eq!(reader.mode, TransactionMode::Read);
    assert_eq!(reader.revision, 1);

    drop(rtx);
    drop(wtx);
    assert!(session.transactions().is_empty());
}

#[test]
fn test_readers_on_other_threads_see_stable_snapshots() {
    let session = Session::in_memory(StoreConfig::default()).unwrap();
    let mut wtx = session.begin_write_transaction().unwrap();
    wtx.insert_element_as_first_child("seed").unwrap();
    wtx.commit().unwrap();

    let start = Arc::new(Barrier::new(5));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let session = session.clone();
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..50 {
                    let rtx = session.begin_read_transaction().unwrap();
                    let revision = rtx.revision();
                    // Revision r holds the document root plus r elements.
                    assert_eq!(rtx.node_count(), revision + 1);
                }
            })
        })
        .collect();

    start.wait();
    for _ in 0..20 {
        wtx.insert_element_as_right_sibling("next").unwrap();
        wtx.commit().unwrap();
    }
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(session.latest_revision(), 21);
}
