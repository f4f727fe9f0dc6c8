use std::future::Future;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

/// A spawned retry or poll loop that can be cancelled from outside.
///
/// The loop receives a child token and is expected to stop at its next
/// scheduling point once the token fires.
#[derive(Debug)]
pub struct TaskHandle<T> {
    cancel_token: CancellationToken,
    join_handle: JoinHandle<T>,
}

impl<T: Send + 'static> TaskHandle<T> {
    pub fn spawn<F, Fut>(span: Span, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let cancel_token = CancellationToken::new();
        let join_handle = tokio::spawn(f(cancel_token.clone()).instrument(span));
        TaskHandle {
            cancel_token,
            join_handle,
        }
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Wait for the loop to return. Safe to use as a `select!` branch; do not
    /// call again once it has resolved.
    pub async fn join(&mut self) -> Result<T, JoinError> {
        (&mut self.join_handle).await
    }
}
