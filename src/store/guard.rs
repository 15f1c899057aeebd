//! Per-entity mutual exclusion.
//!
//! Every mutable leaf of the exchange tree (user ledger, asset entry, order
//! row) and every matching engine is wrapped in a [`Guarded`] cell. The only
//! ways in are scoped acquisition via [`Guarded::with`] and a plain
//! [`Guarded::lock`] used by snapshot serialization and invariant checks.
//!
//! Guards are non-reentrant. Callers must respect the global acquisition
//! order: engine guard, then asset guard, then user guard (buyer before
//! seller), then the order allocator.

use parking_lot::{Mutex, MutexGuard};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

pub struct Guarded<T> {
    inner: Mutex<T>,
}

impl<T> Guarded<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Scoped acquisition: the borrow ends when the closure returns.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Raw lock, for serialization and inspection paths that need a guard
    /// object rather than a closure.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Guarded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_lock() {
            Some(v) => f.debug_tuple("Guarded").field(&*v).finish(),
            None => f.write_str("Guarded(<locked>)"),
        }
    }
}

impl<T: Default> Default for Guarded<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Serialized form: the inner value's fields plus a `__GUARD__` sentinel so
/// that the wrapper is reconstructed on load.
#[derive(Serialize)]
struct TaggedRef<'a, T> {
    #[serde(flatten)]
    value: &'a T,
    #[serde(rename = "__GUARD__")]
    guarded: bool,
}

#[derive(Deserialize)]
struct TaggedOwned<T> {
    #[serde(flatten)]
    value: T,
    #[serde(rename = "__GUARD__", default)]
    _guarded: bool,
}

impl<T: Serialize> Serialize for Guarded<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = self.inner.lock();
        TaggedRef {
            value: &*value,
            guarded: true,
        }
        .serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Guarded<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tagged = TaggedOwned::<T>::deserialize(deserializer)?;
        Ok(Guarded::new(tagged.value))
    }
}
