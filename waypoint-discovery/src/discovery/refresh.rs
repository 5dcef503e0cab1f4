//! Shared plumbing for the background refresh loops
//!
//! Both monitors poll the registry on an interval, keep serving the last good
//! snapshot on error, and back off exponentially while errors persist.

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Upper bound for a single registry call
pub const REGISTRY_TIMEOUT: Duration = Duration::from_secs(5);

/// Ceiling for the retry delay while the registry keeps failing
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Load state of a monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    /// First fetch still in flight
    Loading,
    /// At least one fetch succeeded
    Ready,
    /// Every fetch so far failed
    Failed(Error),
}

impl LoadStatus {
    /// Record a failed fetch; a monitor that loaded once stays `Ready`
    pub(crate) fn fail(status: &watch::Sender<Self>, error: Error) {
        status.send_if_modified(|current| match *current {
            Self::Ready => false,
            Self::Loading | Self::Failed(_) => {
                let changed = *current != Self::Failed(error.clone());
                *current = Self::Failed(error);
                changed
            }
        });
    }

    pub(crate) fn ready(status: &watch::Sender<Self>) {
        status.send_if_modified(|current| {
            if *current == Self::Ready {
                false
            } else {
                *current = Self::Ready;
                true
            }
        });
    }
}

/// Wait for the first fetch to complete and report its outcome
pub(crate) async fn wait_until_loaded(status: &watch::Sender<LoadStatus>) -> Result<()> {
    let mut rx = status.subscribe();
    let outcome = rx
        .wait_for(|s| *s != LoadStatus::Loading)
        .await
        .map(|s| s.clone())
        .map_err(|_| Error::Registry("Refresh loop stopped before first load".to_string()))?;

    match outcome {
        LoadStatus::Ready => Ok(()),
        LoadStatus::Failed(e) => Err(e),
        LoadStatus::Loading => unreachable!("wait_for only returns settled states"),
    }
}

/// Backoff used after consecutive registry failures, starting at the
/// regular polling interval
pub(crate) fn retry_backoff(interval: Duration) -> ExponentialBackoff {
    ExponentialBuilder::default()
        .with_min_delay(interval.max(Duration::from_millis(1)))
        .with_max_delay(MAX_RETRY_DELAY.max(interval))
        .without_max_times()
        .with_jitter()
        .build()
}

/// Run a registry call under `REGISTRY_TIMEOUT`
pub(crate) async fn with_registry_timeout<T, F>(operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    timeout(REGISTRY_TIMEOUT, fut)
        .await
        .map_err(|_| Error::Timeout(format!("Registry {operation} timed out")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_does_not_downgrade_ready() {
        let (tx, _) = watch::channel(LoadStatus::Loading);

        LoadStatus::fail(&tx, Error::Registry("first".to_string()));
        assert_eq!(*tx.borrow(), LoadStatus::Failed(Error::Registry("first".to_string())));

        LoadStatus::ready(&tx);
        LoadStatus::fail(&tx, Error::Registry("later".to_string()));
        assert_eq!(*tx.borrow(), LoadStatus::Ready);
    }

    #[tokio::test]
    async fn test_wait_until_loaded_reports_failure() {
        let (tx, _) = watch::channel(LoadStatus::Loading);
        let tx = std::sync::Arc::new(tx);
        let waiter = {
            let tx = tx.clone();
            tokio::spawn(async move { wait_until_loaded(&tx).await })
        };

        LoadStatus::fail(&tx, Error::Registry("down".to_string()));
        let result = waiter.await.unwrap();
        assert_eq!(result, Err(Error::Registry("down".to_string())));
    }

    #[test]
    fn test_retry_backoff_grows_and_is_bounded() {
        let delays: Vec<_> = retry_backoff(Duration::from_millis(10)).take(20).collect();
        assert_eq!(delays.len(), 20);
        assert!(delays.iter().all(|d| *d <= MAX_RETRY_DELAY * 2));
        assert!(delays[19] > delays[0]);
    }

    #[tokio::test]
    async fn test_with_registry_timeout_passes_through() {
        let value = with_registry_timeout("probe", async { Ok::<_, Error>(7) }).await;
        assert_eq!(value, Ok(7));
    }
}
