//! Envelope dispatch and response correlation.
//!
//! An [`Envelope`] pairs a request with addressing and a [`Promise`]. The
//! [`Messenger`] runs the exchange for each envelope and completes the
//! promise exactly once.

mod envelope;
mod exchange;
mod promise;

pub use envelope::{Envelope, EnvelopeBuilder};
pub use exchange::{DEFAULT_MESSAGE_TYPE, Messenger, MessengerBuilder, MessengerConfig};
pub use promise::{Promise, ResponseFuture};
