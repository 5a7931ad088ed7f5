use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Dispatch;
use tracing::instrument::WithSubscriber;

/// Runs `future` under the configured dispatcher, or the ambient one when
/// none was injected.
pub(crate) async fn scoped<F>(logger: Option<&Dispatch>, future: F) -> F::Output
where
    F: Future,
{
    match logger {
        Some(dispatch) => future.with_subscriber(dispatch.clone()).await,
        None => future.await,
    }
}

/// Spawns a background task that keeps logging to the spawner's dispatcher.
pub(crate) fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future.with_current_subscriber())
}
