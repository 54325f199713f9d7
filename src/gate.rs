//! Shared admission wait used by both backpressure gates.

use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Wait until `try_acquire` yields a value.
///
/// Re-checks whenever `released` is notified, and at least once per
/// `poll_interval` in case a release was signalled without a waiter
/// registered. Returns the value and how long the caller was held back.
pub(crate) async fn acquire<T>(
    released: &Notify,
    poll_interval: Duration,
    mut try_acquire: impl FnMut() -> Option<T>,
) -> (T, Duration) {
    let started = Instant::now();
    loop {
        // Register interest before checking, so a release between the check
        // and the wait is not lost.
        let notified = released.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(value) = try_acquire() {
            return (value, started.elapsed());
        }

        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}
