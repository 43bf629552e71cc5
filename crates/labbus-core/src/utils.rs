/*!
 * Utility functions and helpers for LabBus.
 *
 * Timing helpers shared by the periodic loops.
 */
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Time left in a polling period after `elapsed` has been spent
///
/// Returns `None` when the work took at least the whole period, in which
/// case the caller should start the next cycle immediately.
pub fn remaining_period(period: Duration, elapsed: Duration) -> Option<Duration> {
    period.checked_sub(elapsed).filter(|rest| !rest.is_zero())
}

/// Sleep for whatever is left of `period` since `started`
///
/// Logs a warning when the period could not be met. Returns `false` when
/// `cancel` fired before the sleep completed.
pub async fn sleep_remaining(
    task: &str,
    period: Duration,
    started: Instant,
    cancel: &CancellationToken,
) -> bool {
    let elapsed = started.elapsed();
    match remaining_period(period, elapsed) {
        Some(rest) => sleep_or_cancel(rest, cancel).await,
        None => {
            warn!(
                task = %task,
                period_ms = period.as_millis() as u64,
                elapsed_ms = elapsed.as_millis() as u64,
                "Could not keep up with the configured period"
            );
            !cancel.is_cancelled()
        }
    }
}

/// Sleep unless cancelled; returns `false` when cancelled
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
