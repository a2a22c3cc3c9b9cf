//! Read and write transaction behavior on a single session.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

use revtree_store::{
    DOCUMENT_ROOT_KEY, Error, ItemList, NULL_NAME_KEY, Navigate, NodeKind, NodeRecord,
    NodeVariant, Session, StoreConfig,
};

fn session() -> Session {
    Session::in_memory(StoreConfig::default()).unwrap()
}

/// Names of the element children of the cursor node, left to right.
fn child_names(tx: &mut impl Navigate) -> Vec<String> {
    let mut names = Vec::new();
    if !tx.move_to_first_child().unwrap() {
        return names;
    }
    loop {
        names.push(tx.name().unwrap().unwrap_or_default());
        if !tx.move_to_right_sibling().unwrap() {
            break;
        }
    }
    tx.move_to_parent().unwrap();
    names
}

#[test]
fn test_fresh_store_holds_only_the_document_root() {
    let session = session();
    let rtx = session.begin_read_transaction().unwrap();
    assert_eq!(rtx.revision(), 0);
    assert_eq!(rtx.node_count(), 1);
    assert_eq!(rtx.node_key(), DOCUMENT_ROOT_KEY);
    assert_eq!(rtx.kind(), NodeKind::Document);
}

#[test]
fn test_read_transaction_is_isolated_from_later_commits() {
    let session = session();
    let mut wtx = session.begin_write_transaction().unwrap();
    wtx.insert_element_as_first_child("a").unwrap();
    assert_eq!(wtx.commit().unwrap(), 1);

    let mut before = session.begin_read_transaction().unwrap();
    assert_eq!(before.revision(), 1);
    let count_before = before.node_count();

    for name in ["b", "c", "d"] {
        wtx.insert_element_as_right_sibling(name).unwrap();
    }
    assert_eq!(wtx.commit().unwrap(), 2);

    assert_eq!(before.node_count(), count_before);
    assert_eq!(child_names(&mut before), ["a"]);

    let mut after = session.begin_read_transaction().unwrap();
    assert_eq!(after.revision(), 2);
    assert_eq!(after.node_count(), count_before + 3);
    assert_eq!(child_names(&mut after), ["a", "b", "c", "d"]);
}

#[test]
fn test_write_transaction_sees_its_own_writes() {
    let session = session();
    let mut wtx = session.begin_write_transaction().unwrap();
    assert_eq!(wtx.revision(), 1);

    let book = wtx.insert_element_as_first_child("book").unwrap();
    wtx.insert_text_as_first_child(b"Dune").unwrap();
    assert!(wtx.move_to(book).unwrap());
    assert_eq!(wtx.name().unwrap().as_deref(), Some("book"));
    assert!(wtx.move_to_first_child().unwrap());
    assert_eq!(wtx.value(), Some(&b"Dune"[..]));
    assert_eq!(wtx.modification_count(), 2);

    // Nothing is visible to readers before commit.
    let mut rtx = session.begin_read_transaction().unwrap();
    assert!(!rtx.move_to_first_child().unwrap());
}

#[test]
fn test_attributes_and_namespaces() {
    let session = session();
    let mut wtx = session.begin_write_transaction().unwrap();
    let element = wtx.insert_element_as_first_child("item").unwrap();

    let id = wtx.insert_attribute("id", b"1").unwrap();
    assert_eq!(wtx.kind(), NodeKind::Attribute);
    wtx.move_to_parent().unwrap();
    let replaced = wtx.insert_attribute("id", b"2").unwrap();
    assert_eq!(replaced, id, "same-named attribute is updated in place");
    wtx.move_to_parent().unwrap();
    wtx.insert_attribute("lang", b"en").unwrap();
    wtx.move_to_parent().unwrap();
    wtx.insert_namespace("x", "urn:example").unwrap();
    let revision = wtx.commit().unwrap();
    wtx.close();

    let mut rtx = session.begin_read_transaction_at(revision).unwrap();
    assert!(rtx.move_to(element).unwrap());
    assert_eq!(rtx.node().attributes().len(), 2);
    assert!(rtx.move_to_attribute(0).unwrap());
    assert_eq!(rtx.name().unwrap().as_deref(), Some("id"));
    assert_eq!(rtx.value(), Some(&b"2"[..]));
    assert_eq!(rtx.node().parent, element);

    rtx.move_to_parent().unwrap();
    assert!(!rtx.move_to_attribute(2).unwrap());
    assert!(rtx.move_to_namespace(0).unwrap());
    assert_eq!(rtx.name().unwrap().as_deref(), Some("x"));
    assert_eq!(rtx.uri().unwrap().as_deref(), Some("urn:example"));

    // Attributes and namespaces are not children.
    rtx.move_to(element).unwrap();
    assert_eq!(rtx.node().child_count, 0);
    assert!(!rtx.move_to_first_child().unwrap());
}

#[test]
fn test_setters() {
    let session = session();
    let mut wtx = session.begin_write_transaction().unwrap();
    wtx.insert_element_as_first_child("old").unwrap();
    wtx.set_name("new").unwrap();
    wtx.set_uri("urn:new").unwrap();
    let text = wtx.insert_text_as_first_child(b"v1").unwrap();
    wtx.set_value(b"v2").unwrap();
    wtx.commit().unwrap();

    let mut rtx = session.begin_read_transaction().unwrap();
    rtx.move_to_first_child().unwrap();
    assert_eq!(rtx.name().unwrap().as_deref(), Some("new"));
    assert_eq!(rtx.uri().unwrap().as_deref(), Some("urn:new"));
    assert!(rtx.move_to(text).unwrap());
    assert_eq!(rtx.value(), Some(&b"v2"[..]));
    assert_eq!(rtx.name().unwrap(), None);
}

#[test]
fn test_invalid_positions_are_rejected_without_changes() {
    let session = session();
    let mut wtx = session.begin_write_transaction().unwrap();

    let err = wtx.insert_element_as_right_sibling("x").unwrap_err();
    assert!(matches!(err, Error::TransactionRootSiblingEdit { key: DOCUMENT_ROOT_KEY }));
    assert!(matches!(wtx.remove().unwrap_err(), Error::RemoveDocumentRoot));
    assert!(matches!(
        wtx.insert_attribute("a", b"").unwrap_err(),
        Error::InvalidInsertPosition { kind: NodeKind::Document, .. }
    ));

    wtx.insert_text_as_first_child(b"t").unwrap();
    let modifications = wtx.modification_count();
    assert!(matches!(
        wtx.insert_element_as_first_child("x").unwrap_err(),
        Error::InvalidInsertPosition { kind: NodeKind::Text, .. }
    ));
    assert!(matches!(wtx.set_name("x").unwrap_err(), Error::InvalidInsertPosition { .. }));
    assert_eq!(wtx.modification_count(), modifications);
    assert_eq!(wtx.node_count().unwrap(), 2);
}

#[test]
fn test_remove_moves_cursor_right_then_left_then_up() {
    let session = session();
    let mut wtx = session.begin_write_transaction().unwrap();
    let a = wtx.insert_element_as_first_child("a").unwrap();
    let b = wtx.insert_element_as_right_sibling("b").unwrap();
    let c = wtx.insert_element_as_right_sibling("c").unwrap();
    wtx.insert_text_as_first_child(b"under c").unwrap();
    assert_eq!(wtx.node_count().unwrap(), 5);

    wtx.move_to(b).unwrap();
    wtx.remove().unwrap();
    assert_eq!(wtx.node_key(), c);
    assert_eq!(wtx.node().left_sibling, a);

    wtx.remove().unwrap();
    assert_eq!(wtx.node_key(), a);
    assert_eq!(wtx.node_count().unwrap(), 2, "removal takes the whole subtree");

    wtx.remove().unwrap();
    assert_eq!(wtx.node_key(), DOCUMENT_ROOT_KEY);
    assert_eq!(wtx.node().child_count, 0);
    assert_eq!(wtx.node().first_child, -1);
}

#[test]
fn test_remove_attribute_detaches_it_from_the_element() {
    let session = session();
    let mut wtx = session.begin_write_transaction().unwrap();
    let element = wtx.insert_element_as_first_child("e").unwrap();
    let attribute = wtx.insert_attribute("k", b"v").unwrap();
    wtx.remove().unwrap();

    assert_eq!(wtx.node_key(), element);
    assert!(wtx.node().attributes().is_empty());
    assert!(!wtx.move_to(attribute).unwrap());
}

#[test]
fn test_abort_discards_uncommitted_work() {
    let session = session();
    let mut wtx = session.begin_write_transaction().unwrap();
    wtx.insert_element_as_first_child("kept").unwrap();
    wtx.commit().unwrap();

    wtx.insert_element_as_right_sibling("dropped").unwrap();
    wtx.abort().unwrap();
    assert_eq!(wtx.modification_count(), 0);
    assert_eq!(wtx.revision(), 2);

    wtx.move_to_document_root().unwrap();
    assert_eq!(child_names(&mut wtx), ["kept"]);
    assert_eq!(session.latest_revision(), 1);
}

#[test]
fn test_revert_publishes_old_content_as_new_revision() {
    let session = session();
    let mut wtx = session.begin_write_transaction().unwrap();
    wtx.insert_element_as_first_child("v1").unwrap();
    wtx.commit().unwrap();
    wtx.set_name("v2").unwrap();
    wtx.insert_element_as_right_sibling("extra").unwrap();
    wtx.commit().unwrap();

    wtx.revert_to(1).unwrap();
    assert_eq!(wtx.modification_count(), 1);
    assert_eq!(wtx.commit().unwrap(), 3);

    let mut reverted = session.begin_read_transaction_at(3).unwrap();
    assert_eq!(child_names(&mut reverted), ["v1"]);
    let mut history = session.begin_read_transaction_at(2).unwrap();
    assert_eq!(child_names(&mut history), ["v2", "extra"]);

    // Keys stay monotonic after a revert.
    let key = wtx.insert_element_as_first_child("later").unwrap();
    assert!(key > history.max_node_key());

    assert!(matches!(wtx.revert_to(9).unwrap_err(), Error::RevisionNotFound { revision: 9 }));
}

#[test]
fn test_commit_keeps_the_transaction_open() {
    let session = session();
    let mut wtx = session.begin_write_transaction().unwrap();
    let key = wtx.insert_element_as_first_child("a").unwrap();
    assert_eq!(wtx.commit().unwrap(), 1);
    assert_eq!(wtx.revision(), 2);
    assert_eq!(wtx.node_key(), key, "cursor survives the commit");
    assert_eq!(wtx.commit().unwrap(), 2, "an empty commit still publishes");

    let rtx = session.begin_read_transaction().unwrap();
    assert!(rtx.timestamp() > 0);
}

#[test]
fn test_unknown_revision() {
    let session = session();
    let err = session.begin_read_transaction_at(1).unwrap_err();
    assert!(matches!(err, Error::RevisionNotFound { revision: 1 }));
    // The failed admission did not leak a permit or a registry entry.
    assert!(session.transactions().is_empty());
    assert_eq!(session.stats().readers, 0);
}

#[test]
fn test_item_list_navigation() {
    let session = session();
    let mut rtx = session.begin_read_transaction().unwrap();
    assert!(matches!(rtx.move_to(-2).unwrap_err(), Error::NoItemList { key: -2 }));
    assert!(!rtx.move_to(-1).unwrap(), "the null key is never a node");

    let mut items = ItemList::new();
    let key = items.add(NodeRecord::new(
        0,
        DOCUMENT_ROOT_KEY,
        NodeVariant::Text { type_key: NULL_NAME_KEY, value: b"transient".to_vec() },
    ));
    assert_eq!(key, -2);
    rtx.set_item_list(items);

    assert!(rtx.move_to(key).unwrap());
    assert_eq!(rtx.value(), Some(&b"transient"[..]));
    assert!(!rtx.move_to(-3).unwrap());
    assert!(rtx.move_to_parent().unwrap());
    assert_eq!(rtx.kind(), NodeKind::Document);

    assert_eq!(rtx.take_item_list().map(|items| items.len()), Some(1));
    assert!(rtx.move_to(key).is_err());
}

#[test]
fn test_closed_session_fails_open_transactions() {
    let session = session();
    let mut rtx = session.begin_read_transaction().unwrap();
    let mut wtx = session.begin_write_transaction().unwrap();
    session.close().unwrap();
    session.close().unwrap();

    assert!(matches!(rtx.move_to_document_root().unwrap_err(), Error::SessionClosed));
    assert!(matches!(
        wtx.insert_element_as_first_child("x").unwrap_err(),
        Error::SessionClosed
    ));
    assert!(matches!(wtx.commit().unwrap_err(), Error::SessionClosed));
    assert!(matches!(session.begin_read_transaction().unwrap_err(), Error::SessionClosed));

    drop(rtx);
    drop(wtx);
    assert!(session.transactions().is_empty());
}
