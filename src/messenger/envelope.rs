//! Request envelopes.

use std::net::SocketAddr;

use super::promise::{Promise, ResponseFuture};

/// A request bound to its addressing and its response promise.
#[derive(Debug)]
pub struct Envelope<M, R> {
    message: M,
    sender: Option<SocketAddr>,
    recipient: Option<SocketAddr>,
    promise: Promise<R>,
    response: Option<ResponseFuture<R>>,
}

impl<M, R> Envelope<M, R> {
    /// Wrap `message` with a fresh promise and no explicit addressing.
    pub fn new(message: M) -> Self {
        Self::builder(message).build()
    }

    /// Start building an envelope for `message`.
    pub fn builder(message: M) -> EnvelopeBuilder<M, R> {
        EnvelopeBuilder {
            message,
            sender: None,
            recipient: None,
            promise: None,
        }
    }

    /// The request message.
    pub fn message(&self) -> &M {
        &self.message
    }

    /// Local address the request should leave from. `None` means any.
    pub fn sender(&self) -> Option<SocketAddr> {
        self.sender
    }

    /// Destination. `None` means the connection's peer.
    pub fn recipient(&self) -> Option<SocketAddr> {
        self.recipient
    }

    /// The promise completed with the response.
    pub fn promise(&self) -> &Promise<R> {
        &self.promise
    }

    /// Take the response future of a promise this envelope created.
    ///
    /// Returns `None` for a caller-supplied promise, or on the second call.
    pub fn take_response(&mut self) -> Option<ResponseFuture<R>> {
        self.response.take()
    }

    pub(crate) fn into_parts(self) -> (M, Option<SocketAddr>, Option<SocketAddr>, Promise<R>) {
        (self.message, self.sender, self.recipient, self.promise)
    }
}

/// Builder for [`Envelope`].
#[derive(Debug)]
pub struct EnvelopeBuilder<M, R> {
    message: M,
    sender: Option<SocketAddr>,
    recipient: Option<SocketAddr>,
    promise: Option<Promise<R>>,
}

impl<M, R> EnvelopeBuilder<M, R> {
    /// Set the local address.
    pub fn sender(mut self, addr: SocketAddr) -> Self {
        self.sender = Some(addr);
        self
    }

    /// Set the destination.
    pub fn recipient(mut self, addr: SocketAddr) -> Self {
        self.recipient = Some(addr);
        self
    }

    /// Complete `promise` instead of creating one.
    pub fn promise(mut self, promise: Promise<R>) -> Self {
        self.promise = Some(promise);
        self
    }

    /// Build the envelope.
    pub fn build(self) -> Envelope<M, R> {
        let (promise, response) = match self.promise {
            Some(promise) => (promise, None),
            None => {
                let (promise, response) = Promise::new();
                (promise, Some(response))
            }
        };
        Envelope {
            message: self.message,
            sender: self.sender,
            recipient: self.recipient,
            promise,
            response,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builder_creates_promise() {
        let addr: SocketAddr = "10.0.0.1:27015".parse().unwrap();
        let mut envelope = Envelope::<&str, u32>::builder("info").recipient(addr).build();
        assert_eq!(envelope.recipient(), Some(addr));
        assert_eq!(envelope.sender(), None);

        let response = envelope.take_response().unwrap();
        assert!(envelope.take_response().is_none());

        let (_, _, _, mut promise) = envelope.into_parts();
        promise.complete(Ok(9));
        assert_eq!(response.await.unwrap(), 9);
    }

    #[test]
    fn test_supplied_promise() {
        let (promise, _response) = Promise::<u32>::new();
        let mut envelope = Envelope::builder("rules").promise(promise).build();
        assert!(envelope.take_response().is_none());
        assert!(!envelope.promise().is_completed());
    }
}
