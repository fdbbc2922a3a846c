//! Runs handler work off the consumer loop so it can be abandoned at a deadline.

use crate::error::WorkerError;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tokio::time::timeout;

/// The result of one guarded handler invocation.
#[derive(Debug)]
pub enum ConsumeOutcome {
    Processed,
    Failed(WorkerError),
    /// The handler exceeded the limit and was abandoned.
    TimedOut(Duration),
}

/// Executes `work` on a blocking-pool thread, joining it with an optional deadline.
///
/// The deadline is awaited on the caller's task, so it fires even when the handler
/// blocks its thread and regardless of the runtime flavour. On timeout, async work is
/// cancelled at its next `.await`; a handler stuck inside a blocking call cannot be
/// preempted and is left to finish on its own thread. Panics are reported as failures.
pub async fn run_guarded<F>(limit: Option<Duration>, work: F) -> ConsumeOutcome
where
    F: Future<Output = Result<(), WorkerError>> + Send + 'static,
{
    let handle = Handle::current();
    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

    let mut task = tokio::task::spawn_blocking(move || {
        handle.block_on(async move {
            tokio::select! {
                result = work => Some(result),
                _ = cancel_rx => None,
            }
        })
    });

    let joined = match limit {
        None => task.await,
        Some(limit) => match timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                drop(cancel_tx);
                return ConsumeOutcome::TimedOut(limit);
            }
        },
    };

    drop(cancel_tx);
    from_join(joined)
}

fn from_join(joined: Result<Option<Result<(), WorkerError>>, JoinError>) -> ConsumeOutcome {
    match joined {
        Ok(Some(Ok(()))) => ConsumeOutcome::Processed,
        Ok(Some(Err(e))) => ConsumeOutcome::Failed(e),
        Ok(None) => ConsumeOutcome::Failed(WorkerError::handler("Cancelled", "handler task was cancelled")),
        Err(e) if e.is_panic() => {
            ConsumeOutcome::Failed(WorkerError::handler("Panic", "handler panicked during execution"))
        }
        Err(_) => ConsumeOutcome::Failed(WorkerError::handler("Cancelled", "handler task was cancelled")),
    }
}
