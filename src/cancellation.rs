use std::future::Future;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("operation was cancelled")]
pub struct Cancelled;

/// Drives `fut` to completion unless `cancel` fires first, in which case `fut` is dropped.
pub async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, Cancelled> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Cancelled),
        output = fut => Ok(output),
    }
}
