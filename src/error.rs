use std::future::Future;
use std::time::Duration;

/// Failure classes surfaced by the data layer.
///
/// Nothing here is fatal to the process: handlers log the error and skip the
/// current cycle, the next natural tick is the retry.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("fetch failed: {0}")]
    TransientFetch(String),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("no cached block within tolerance of timestamp {0}")]
    IndexMiss(u64),
    #[error("snapshot aborted at `{step}`: {source}")]
    PartialReadAbort {
        step: &'static str,
        #[source]
        source: Box<MonitorError>,
    },
    #[error("block {0} not found")]
    BlockNotFound(u64),
    #[error("could not locate block for timestamp {target}: {reason}")]
    LocateFailed { target: u64, reason: String },
    #[error("not enough chain history: {0}")]
    InsufficientHistory(String),
}

pub type MonitorResult<T> = Result<T, MonitorError>;

impl MonitorError {
    /// Network, RPC and timeout failures. These are expected to clear up on
    /// their own by the next tick.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientFetch(_) | Self::Timeout(_) => true,
            Self::PartialReadAbort { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    pub fn abort(step: &'static str, source: MonitorError) -> Self {
        Self::PartialReadAbort { step, source: Box::new(source) }
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::TransientFetch(format!("request timed out: {error}"));
        }
        Self::TransientFetch(error.to_string())
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(error: serde_json::Error) -> Self {
        Self::TransientFetch(format!("malformed response: {error}"))
    }
}

/// Run `fut` with an upper bound on its duration. Expiry is reported as
/// [`MonitorError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, fut: F) -> MonitorResult<T>
where
    F: Future<Output = MonitorResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(MonitorError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let result: MonitorResult<()> = bounded(Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, MonitorError::Timeout(d) if d == Duration::from_secs(1)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_bounded_passes_through() {
        let value = bounded(Duration::from_secs(1), async { Ok(7u64) }).await.unwrap();
        assert_eq!(value, 7);

        let err = bounded::<u64, _>(Duration::from_secs(1), async { Err(MonitorError::BlockNotFound(3)) })
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_partial_abort_classification() {
        let err = MonitorError::abort("dailyTotals", MonitorError::TransientFetch("boom".into()));
        assert!(err.is_transient());
        assert!(err.to_string().contains("dailyTotals"));
    }
}
