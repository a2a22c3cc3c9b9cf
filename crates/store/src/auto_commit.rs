//! Periodic auto-commit of a write transaction.
//!
//! The job ticks at the configured interval and commits the shared write
//! transaction whenever it holds uncommitted modifications. Commits run on the
//! blocking pool since they perform file I/O.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info};

use crate::{config::AutoCommitConfig, txn::WriteTransaction};

/// Background job committing a write transaction on a timer.
#[derive(bon::Builder)]
#[builder(on(_, required))]
pub struct AutoCommitJob {
    /// The transaction to commit. Callers mutate it through the same mutex.
    transaction: Arc<Mutex<WriteTransaction>>,
    /// Configuration.
    #[builder(default)]
    config: AutoCommitConfig,
}

impl AutoCommitJob {
    /// Commits the transaction if it has pending modifications.
    ///
    /// Returns the committed revision, if any.
    fn tick(transaction: &Mutex<WriteTransaction>) -> Option<u64> {
        let mut transaction = transaction.lock();
        let modifications = transaction.modification_count();
        if modifications == 0 {
            return None;
        }
        match transaction.commit() {
            Ok(revision) => {
                debug!(revision, modifications, "Auto-commit published revision");
                Some(revision)
            },
            Err(e) => {
                error!(
                    transaction_id = %transaction.id(),
                    modifications,
                    error = %e,
                    "Auto-commit failed"
                );
                None
            },
        }
    }

    /// Runs the job until `shutdown` receives a message or is closed.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Auto-commit is disabled");
            return;
        }

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(interval = ?self.config.interval, "Auto-commit job started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let transaction = Arc::clone(&self.transaction);
                    if let Err(e) = tokio::task::spawn_blocking(move || Self::tick(&transaction)).await {
                        error!(error = %e, "Auto-commit task panicked");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Auto-commit job shutting down");
                    break;
                }
            }
        }
    }

    /// Spawns the job on the current runtime.
    pub fn spawn(self) -> AutoCommitHandle {
        let (shutdown, receiver) = mpsc::channel(1);
        let task = tokio::spawn(self.run(receiver));
        AutoCommitHandle { shutdown, task }
    }
}

/// Handle to a spawned [`AutoCommitJob`].
///
/// Dropping the handle closes the shutdown channel, which also stops the job.
pub struct AutoCommitHandle {
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl AutoCommitHandle {
    /// Stops the job and waits for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(()).await;
        if let Err(e) = self.task.await {
            error!(error = %e, "Auto-commit job panicked");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{config::StoreConfig, session::Session};

    fn enabled(interval: Duration) -> AutoCommitConfig {
        AutoCommitConfig::builder().enabled(true).interval(interval).build().unwrap()
    }

    #[test]
    fn test_tick_skips_clean_transaction() {
        let session = Session::in_memory(StoreConfig::default()).unwrap();
        let transaction = Mutex::new(session.begin_write_transaction().unwrap());
        assert_eq!(AutoCommitJob::tick(&transaction), None);
        assert_eq!(session.latest_revision(), 0);
    }

    #[test]
    fn test_tick_commits_modifications() {
        let session = Session::in_memory(StoreConfig::default()).unwrap();
        let transaction = Mutex::new(session.begin_write_transaction().unwrap());
        transaction.lock().insert_element_as_first_child("a").unwrap();

        assert_eq!(AutoCommitJob::tick(&transaction), Some(1));
        assert_eq!(transaction.lock().modification_count(), 0);
        assert_eq!(session.latest_revision(), 1);
    }

    #[tokio::test]
    async fn test_disabled_job_returns_immediately() {
        let session = Session::in_memory(StoreConfig::default()).unwrap();
        let transaction = Arc::new(Mutex::new(session.begin_write_transaction().unwrap()));
        let job = AutoCommitJob::builder()
            .transaction(transaction)
            .config(AutoCommitConfig::default())
            .build();
        let (_tx, rx) = mpsc::channel(1);
        tokio::time::timeout(Duration::from_secs(1), job.run(rx)).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_job() {
        let session = Session::in_memory(StoreConfig::default()).unwrap();
        let transaction = Arc::new(Mutex::new(session.begin_write_transaction().unwrap()));
        let handle = AutoCommitJob::builder()
            .transaction(transaction)
            .config(enabled(Duration::from_millis(10)))
            .build()
            .spawn();
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown()).await.unwrap();
    }
}
