//! Shared controller helpers.
//!
//! Utilities used by the scale-down and rolling upgrade paths.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::controller::error::Error;

/// Run a network operation unless the reconciliation is cancelled first.
///
/// Cancellation wins ties so no new request is issued once the token fires.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Whether a kube error is an HTTP 404.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

/// Whether a kube error is an HTTP 409 (optimistic concurrency conflict).
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}
