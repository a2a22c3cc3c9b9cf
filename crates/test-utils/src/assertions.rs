//! Polling assertions for background activity such as auto-commit.

use std::time::Duration;

use tokio::time::{Instant, sleep};

/// How often [`assert_eventually`] re-evaluates its condition.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Re-evaluates `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition held. The condition is checked one last
/// time after the deadline, so a slow final tick is not reported as a miss.
///
/// ```no_run
/// use std::time::Duration;
/// use revtree_test_utils::assert_eventually;
///
/// # async fn demo(latest_revision: impl Fn() -> u64) {
/// // Wait for a background job to publish revision 1.
/// let published = assert_eventually(Duration::from_secs(5), || latest_revision() >= 1).await;
/// assert!(published);
/// # }
/// ```
pub async fn assert_eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(POLL_INTERVAL).await;
    }
    condition()
}
