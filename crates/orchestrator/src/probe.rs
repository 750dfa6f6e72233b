//! Readiness probing.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Poll `check` every `interval` until it yields `true` or `timeout` elapses.
///
/// An error from `check` counts as "not ready yet". Returns `false` on
/// timeout. A check in flight when the deadline passes is abandoned.
pub async fn wait_ready<F, Fut, E>(
    name: &str,
    mut check: F,
    timeout: Duration,
    interval: Duration,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: Display,
{
    let start = Instant::now();
    let poll = async {
        let mut attempts: u64 = 0;
        loop {
            attempts += 1;
            match check().await {
                Ok(true) => return attempts,
                Ok(false) => {}
                Err(e) => debug!(entity = %name, attempts, error = %e, "Not ready yet"),
            }
            tokio::time::sleep(interval).await;
        }
    };

    match tokio::time::timeout(timeout, poll).await {
        Ok(attempts) => {
            debug!(entity = %name, attempts, elapsed = ?start.elapsed(), "Ready");
            true
        }
        Err(_) => {
            warn!(entity = %name, ?timeout, "Readiness timeout");
            false
        }
    }
}
