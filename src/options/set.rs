//! Concurrent option-value sets with per-entry locking.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::error::{QueryError, Result};

use super::attributes::ConnectionAttributes;
use super::option::{ClientOption, ErasedValue, OptionRegistry, OptionValue};

#[derive(Clone)]
struct Entry {
    /// `None` records an explicit null.
    value: Option<ErasedValue>,
    locked: bool,
    connection_attribute: bool,
}

/// A set of option values.
///
/// Reads and writes are atomic per key. An entry stored with `locked = true`
/// can never be replaced or removed.
#[derive(Default)]
pub struct Options {
    entries: RwLock<HashMap<String, Entry>>,
}

impl Options {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any unlocked entry.
    pub fn add<T: OptionValue>(&self, option: &ClientOption<T>, value: T) -> Result<()> {
        self.insert(option, Some(value), false)
    }

    /// Store a value and lock the entry against further changes.
    pub fn add_locked<T: OptionValue>(&self, option: &ClientOption<T>, value: T) -> Result<()> {
        self.insert(option, Some(value), true)
    }

    /// Record an explicit null. It reads back as the default.
    pub fn add_null<T: OptionValue>(&self, option: &ClientOption<T>) -> Result<()> {
        self.insert(option, None, false)
    }

    fn insert<T: OptionValue>(
        &self,
        option: &ClientOption<T>,
        value: Option<T>,
        locked: bool,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.get(option.key()).is_some_and(|e| e.locked) {
            return Err(QueryError::OptionLocked {
                key: option.key().to_string(),
            });
        }
        trace!(key = %option, locked, "option set");
        entries.insert(
            option.key().to_string(),
            Entry {
                value: value.map(|v| Arc::new(v) as ErasedValue),
                locked,
                connection_attribute: option.is_connection_attribute(),
            },
        );
        Ok(())
    }

    fn stored<T: OptionValue>(&self, option: &ClientOption<T>) -> Option<T> {
        self.entries
            .read()
            .get(option.key())
            .and_then(|e| e.value.as_ref())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Read a value, falling back to the option default when unset or null.
    pub fn get<T: OptionValue>(&self, option: &ClientOption<T>) -> T {
        self.stored(option)
            .unwrap_or_else(|| option.default_value().clone())
    }

    /// Read a value, falling back to `fallback` when unset or null.
    pub fn get_or<T: OptionValue>(&self, option: &ClientOption<T>, fallback: T) -> T {
        self.stored(option).unwrap_or(fallback)
    }

    /// Check if an entry exists and was stored locked.
    pub fn is_locked<T>(&self, option: &ClientOption<T>) -> bool {
        self.entries
            .read()
            .get(option.key())
            .is_some_and(|e| e.locked)
    }

    /// Check if an entry exists, including explicit nulls.
    pub fn contains<T>(&self, option: &ClientOption<T>) -> bool {
        self.entries.read().contains_key(option.key())
    }

    /// Remove an unlocked entry. Returns `true` if an entry was removed.
    pub fn remove<T>(&self, option: &ClientOption<T>) -> Result<bool> {
        let mut entries = self.entries.write();
        match entries.get(option.key()) {
            Some(e) if e.locked => Err(QueryError::OptionLocked {
                key: option.key().to_string(),
            }),
            Some(_) => {
                entries.remove(option.key());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the set has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Copy entries from `other` into this set.
    ///
    /// Entries locked here are kept. Returns the number of entries copied.
    pub fn merge_from(&self, other: &Options) -> usize {
        let source = other.entries.read().clone();
        let mut entries = self.entries.write();
        let mut copied = 0;
        for (key, entry) in source {
            if entries.get(&key).is_some_and(|e| e.locked) {
                continue;
            }
            entries.insert(key, entry);
            copied += 1;
        }
        copied
    }

    /// Copy the effective value of `option` onto a connection.
    ///
    /// Fails with [`QueryError::InvalidOption`] if the option is not a
    /// connection attribute.
    pub fn apply_to<T: OptionValue>(
        &self,
        option: &ClientOption<T>,
        attributes: &ConnectionAttributes,
    ) -> Result<()> {
        if !option.is_connection_attribute() {
            return Err(QueryError::invalid_option(
                option.key(),
                "not a connection attribute",
            ));
        }
        attributes.set(option, self.get(option));
        Ok(())
    }

    /// Seed a new connection's attributes.
    ///
    /// Every auto-create option in `registry` is materialized with its
    /// effective value. Other attribute options are copied only when set.
    pub fn seed_attributes(&self, registry: &OptionRegistry, attributes: &ConnectionAttributes) {
        let entries = self.entries.read();
        for entry in registry.auto_create_entries() {
            let value = entries
                .get(&entry.key)
                .and_then(|e| e.value.clone())
                .filter(|v| Any::type_id(&**v) == entry.type_id)
                .unwrap_or_else(|| Arc::clone(&entry.default));
            attributes.set_erased(&entry.key, value);
        }
        for (key, entry) in entries.iter() {
            if !entry.connection_attribute || attributes.contains(key) {
                continue;
            }
            if let Some(value) = &entry.value {
                attributes.set_erased(key, Arc::clone(value));
            }
        }
    }
}

impl Clone for Options {
    fn clone(&self) -> Self {
        Self {
            entries: RwLock::new(self.entries.read().clone()),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        let mut keys: Vec<(&String, bool)> = entries.iter().map(|(k, e)| (k, e.locked)).collect();
        keys.sort();
        f.debug_struct("Options").field("entries", &keys).finish()
    }
}
