//! Per-connection attribute slots keyed by option.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::option::{ClientOption, ErasedValue, OptionValue};

/// Runtime state attached to one live connection.
///
/// Slots share their keys with [`ClientOption`]s, so a connection attribute
/// can be seeded from static configuration and later overwritten with
/// negotiated values.
#[derive(Default)]
pub struct ConnectionAttributes {
    slots: RwLock<HashMap<String, ErasedValue>>,
}

impl ConnectionAttributes {
    /// Create an empty attribute map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the attribute for `option`, if set.
    pub fn get<T: OptionValue>(&self, option: &ClientOption<T>) -> Option<T> {
        self.slots
            .read()
            .get(option.key())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Read the attribute, falling back to the option default.
    pub fn get_or_default<T: OptionValue>(&self, option: &ClientOption<T>) -> T {
        self.get(option)
            .unwrap_or_else(|| option.default_value().clone())
    }

    /// Overwrite the attribute for `option`.
    pub fn set<T: OptionValue>(&self, option: &ClientOption<T>, value: T) {
        self.set_erased(option.key(), Arc::new(value));
    }

    pub(crate) fn set_erased(&self, key: &str, value: ErasedValue) {
        self.slots.write().insert(key.to_string(), value);
    }

    /// Remove the attribute for `option`. Returns `true` if it was set.
    pub fn remove<T>(&self, option: &ClientOption<T>) -> bool {
        self.slots.write().remove(option.key()).is_some()
    }

    /// Check if a slot exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.slots.read().contains_key(key)
    }

    /// Number of populated slots.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Check if no slots are populated.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

impl fmt::Debug for ConnectionAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.slots.read().keys().cloned().collect();
        keys.sort();
        f.debug_struct("ConnectionAttributes")
            .field("keys", &keys)
            .finish()
    }
}
