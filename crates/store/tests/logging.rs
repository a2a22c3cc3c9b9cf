//! Structured events emitted by sessions and transactions.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

use std::sync::Arc;

use parking_lot::Mutex;
use revtree_store::{Session, StoreConfig};
use tracing_subscriber::layer::SubscriberExt;

/// Test layer recording the target of every event it sees.
struct TargetLayer {
    targets: Arc<Mutex<Vec<String>>>,
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for TargetLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        self.targets.lock().push(event.metadata().target().to_string());
    }
}

fn with_test_subscriber<F, R>(f: F) -> (R, Vec<String>)
where
    F: FnOnce() -> R,
{
    let targets = Arc::new(Mutex::new(Vec::new()));
    let layer = TargetLayer { targets: Arc::clone(&targets) };
    let subscriber = tracing_subscriber::registry().with(layer);
    let result = tracing::subscriber::with_default(subscriber, f);
    let targets = targets.lock().clone();
    (result, targets)
}

#[test]
fn test_commit_and_session_lifecycle_are_logged() {
    let (revision, targets) = with_test_subscriber(|| {
        let session = Session::in_memory(StoreConfig::default()).unwrap();
        let mut wtx = session.begin_write_transaction().unwrap();
        wtx.insert_element_as_first_child("logged").unwrap();
        let revision = wtx.commit().unwrap();
        wtx.close();
        session.close().unwrap();
        revision
    });

    assert_eq!(revision, 1);
    assert!(targets.iter().any(|t| t == "revtree_store::session"), "{targets:?}");
    assert!(targets.iter().any(|t| t == "revtree_store::txn::write"), "{targets:?}");
}
