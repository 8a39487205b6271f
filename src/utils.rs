//! Polling helpers shared by the lock manager and the lifecycle controller.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Default budget for [`wait_until`]
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default sleep between two predicate checks
pub const WAIT_INTERVAL: Duration = Duration::from_millis(50);

/// Boxed `Send` future, used for scoped bodies that borrow their argument.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Poll `predicate` until it returns `true` or `timeout` elapses.
///
/// # Arguments
/// * `predicate` - Async check, evaluated once per interval
/// * `timeout` - Overall budget
/// * `interval` - Sleep between checks
///
/// # Returns
/// `true` if the predicate was satisfied, `false` on timeout. Never fails on
/// its own; callers that need a hard failure check the result.
pub async fn wait_until<F, Fut>(mut predicate: F, timeout: Duration, interval: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate().await {
            return true;
        }
        sleep(interval).await;
    }
    false
}

/// Await `fut`, bounded by `limit` when one is given.
///
/// Returns `None` if the bound expired first.
pub async fn bounded<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}
