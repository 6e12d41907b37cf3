//! Typed, lockable client configuration.
//!
//! Every tunable is a [`ClientOption<T>`] handle whose key carries the value
//! type. Values live in an [`Options`] set; options marked as connection
//! attributes can also be projected onto a live connection's
//! [`ConnectionAttributes`].
//!
//! # Example
//!
//! ```
//! use gamequery::options::{defaults, Options};
//! use std::time::Duration;
//!
//! let options = Options::new();
//! options
//!     .add_locked(&defaults::READ_TIMEOUT, Duration::from_secs(2))
//!     .unwrap();
//!
//! assert_eq!(options.get(&defaults::READ_TIMEOUT), Duration::from_secs(2));
//! assert!(options.add(&defaults::READ_TIMEOUT, Duration::ZERO).is_err());
//! ```

mod attributes;
pub mod defaults;
mod option;
mod set;

pub use attributes::ConnectionAttributes;
pub use option::{ClientOption, OptionRegistry, OptionValue};
pub use set::Options;
