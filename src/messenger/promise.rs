//! Single-assignment response slots.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{QueryError, Result};

/// The completing side of a response.
///
/// Completes at most once. A promise dropped without completing resolves its
/// [`ResponseFuture`] with [`QueryError::Rejected`].
pub struct Promise<R> {
    tx: Option<oneshot::Sender<Result<R>>>,
}

impl<R> Promise<R> {
    /// Create a promise and the future it completes.
    pub fn new() -> (Self, ResponseFuture<R>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, ResponseFuture { rx })
    }

    /// Complete with `outcome`.
    ///
    /// Returns `false` if the promise was already completed or nobody is
    /// listening any more; the outcome is dropped in both cases.
    pub fn complete(&mut self, outcome: Result<R>) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Check if the promise has been completed.
    pub fn is_completed(&self) -> bool {
        self.tx.is_none()
    }

    /// Check if the receiving future was dropped before completion.
    pub fn is_abandoned(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.is_closed())
    }

    /// Wait until the receiving future is dropped.
    ///
    /// Never resolves once the promise is completed.
    pub async fn abandoned(&mut self) {
        match self.tx.as_mut() {
            Some(tx) => tx.closed().await,
            None => std::future::pending().await,
        }
    }
}

impl<R> fmt::Debug for Promise<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Resolves with the response or the failure that ended the exchange.
#[must_use = "dropping the future abandons the request"]
pub struct ResponseFuture<R> {
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> Future for ResponseFuture<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(QueryError::Rejected)))
    }
}

impl<R> fmt::Debug for ResponseFuture<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_once() {
        let (mut promise, response) = Promise::new();
        assert!(promise.complete(Ok(1)));
        assert!(promise.is_completed());
        assert!(!promise.complete(Ok(2)));
        assert_eq!(response.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_promise_rejects() {
        let (promise, response) = Promise::<u8>::new();
        drop(promise);
        assert!(matches!(response.await, Err(QueryError::Rejected)));
    }

    #[tokio::test]
    async fn test_abandoned_detection() {
        let (mut promise, response) = Promise::<u8>::new();
        assert!(!promise.is_abandoned());
        drop(response);
        assert!(promise.is_abandoned());
        promise.abandoned().await;
        assert!(!promise.complete(Ok(3)));
    }
}
