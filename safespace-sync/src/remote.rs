//! Remote call plumbing shared by the services.

use safespace_core::RemoteError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use safespace_core::RemoteSource;

/// How services hold the backend.
pub type SharedRemote = Arc<dyn RemoteSource>;

/// Run a remote call under `limit`; expiry becomes [`RemoteError::Timeout`].
pub(crate) async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout { after: limit }),
    }
}
