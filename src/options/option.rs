//! Typed option handles and the option registry.

use std::any::{Any, TypeId, type_name};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{QueryError, Result};

use super::defaults;

/// Bound for values that can be stored in an option set.
pub trait OptionValue: Clone + Send + Sync + fmt::Debug + 'static {}

impl<T: Clone + Send + Sync + fmt::Debug + 'static> OptionValue for T {}

/// Type-erased option value.
pub(crate) type ErasedValue = Arc<dyn Any + Send + Sync>;

/// A uniquely keyed, typed configuration entry.
///
/// The value type is carried by the handle, so every `get`/`add` through it is
/// type checked at compile time. Two options are equal iff their keys match.
pub struct ClientOption<T> {
    key: Cow<'static, str>,
    default: T,
    connection_attribute: bool,
    auto_create: bool,
}

impl<T> ClientOption<T> {
    pub(crate) const fn builtin(key: &'static str, default: T) -> Self {
        Self {
            key: Cow::Borrowed(key),
            default,
            connection_attribute: false,
            auto_create: false,
        }
    }

    pub(crate) const fn builtin_attribute(key: &'static str, default: T, auto_create: bool) -> Self {
        Self {
            key: Cow::Borrowed(key),
            default,
            connection_attribute: true,
            auto_create,
        }
    }

    /// Get the option key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the default value.
    pub fn default_value(&self) -> &T {
        &self.default
    }

    /// Check if this option also exists as a per-connection attribute.
    pub fn is_connection_attribute(&self) -> bool {
        self.connection_attribute
    }

    /// Check if the attribute is materialized on every connection.
    pub fn auto_create(&self) -> bool {
        self.auto_create
    }
}

impl<T: Clone> Clone for ClientOption<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            default: self.default.clone(),
            connection_attribute: self.connection_attribute,
            auto_create: self.auto_create,
        }
    }
}

impl<T> PartialEq for ClientOption<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for ClientOption<T> {}

impl<T> Hash for ClientOption<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl<T: fmt::Debug> fmt::Debug for ClientOption<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOption")
            .field("key", &self.key)
            .field("default", &self.default)
            .field("connection_attribute", &self.connection_attribute)
            .field("auto_create", &self.auto_create)
            .finish()
    }
}

impl<T> fmt::Display for ClientOption<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Registry entry describing one defined option.
#[derive(Clone)]
pub(crate) struct OptionEntry {
    pub(crate) key: String,
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) default: ErasedValue,
    pub(crate) connection_attribute: bool,
    pub(crate) auto_create: bool,
}

impl OptionEntry {
    pub(crate) fn of<T: OptionValue>(option: &ClientOption<T>) -> Self {
        Self {
            key: option.key().to_string(),
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            default: Arc::new(option.default.clone()),
            connection_attribute: option.connection_attribute,
            auto_create: option.auto_create,
        }
    }
}

/// The set of defined option keys.
///
/// Holds every built-in option and any options defined by the application.
/// Keys are unique within a registry.
pub struct OptionRegistry {
    entries: RwLock<HashMap<String, OptionEntry>>,
}

impl OptionRegistry {
    /// Create a registry pre-populated with the built-in options.
    pub fn new() -> Self {
        let entries = defaults::builtin_entries()
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Create a registry with no options at all.
    pub fn empty() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Define a new option that is not a connection attribute.
    pub fn create<T: OptionValue>(
        &self,
        key: impl Into<String>,
        default: T,
    ) -> Result<ClientOption<T>> {
        self.create_with(key, default, false, false)
    }

    /// Define a new option.
    ///
    /// Fails if the key is already defined, or if `auto_create` is requested
    /// for an option that is not a connection attribute.
    pub fn create_with<T: OptionValue>(
        &self,
        key: impl Into<String>,
        default: T,
        connection_attribute: bool,
        auto_create: bool,
    ) -> Result<ClientOption<T>> {
        let key = key.into();
        if key.is_empty() {
            return Err(QueryError::invalid_option(key, "key must not be empty"));
        }
        if auto_create && !connection_attribute {
            return Err(QueryError::invalid_option(
                key,
                "auto-create requires a connection attribute",
            ));
        }

        let option = ClientOption {
            key: Cow::Owned(key),
            default,
            connection_attribute,
            auto_create,
        };
        self.register(&option)?;
        Ok(option)
    }

    /// Register an existing handle, failing if its key is taken.
    pub fn register<T: OptionValue>(&self, option: &ClientOption<T>) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(option.key()) {
            return Err(QueryError::DuplicateOption {
                key: option.key().to_string(),
            });
        }
        entries.insert(option.key().to_string(), OptionEntry::of(option));
        Ok(())
    }

    /// Look up a defined option by key.
    ///
    /// Returns `None` if the key is unknown or holds a different value type.
    pub fn lookup<T: OptionValue>(&self, key: &str) -> Option<ClientOption<T>> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.type_id != TypeId::of::<T>() {
            return None;
        }
        let default = entry.default.downcast_ref::<T>()?.clone();
        Some(ClientOption {
            key: Cow::Owned(entry.key.clone()),
            default,
            connection_attribute: entry.connection_attribute,
            auto_create: entry.auto_create,
        })
    }

    /// Check if a key is defined.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Name of the value type stored under `key`.
    pub fn type_name(&self, key: &str) -> Option<&'static str> {
        self.entries.read().get(key).map(|s| s.type_name)
    }

    /// Number of defined options.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if no options are defined.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// All defined keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub(crate) fn auto_create_entries(&self) -> Vec<OptionEntry> {
        self.entries
            .read()
            .values()
            .filter(|s| s.auto_create)
            .cloned()
            .collect()
    }
}

impl Default for OptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}
