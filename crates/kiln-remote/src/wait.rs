//! Bounded poll-and-backoff readiness wait

use crate::error::{RemoteError, Result};
use kiln_cloud::WaitPolicy;
use std::time::Duration;

/// Poll `probe` until it reports ready or `policy.timeout` elapses.
///
/// Fails no earlier than the timeout and no later than one poll interval
/// past it. Returns how long the wait took.
pub async fn wait_until<F, Fut>(policy: &WaitPolicy, what: &str, mut probe: F) -> Result<Duration>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if probe().await {
            tracing::debug!("{what} ready after {:?}", start.elapsed());
            return Ok(start.elapsed());
        }
        if start.elapsed() >= policy.timeout {
            return Err(RemoteError::ConnectTimeout {
                what: what.to_string(),
                waited_secs: start.elapsed().as_secs(),
            });
        }
        tracing::debug!(
            "{what} not ready yet, retrying in {:?}",
            policy.poll_interval
        );
        tokio::time::sleep(policy.poll_interval).await;
    }
}
