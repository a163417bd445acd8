//! Map wrapper that never creates entries implicitly.
//!
//! Usage counters are the main client: a counter exists for exactly as long
//! as the external IP it counts is configured, so an increment or decrement
//! against a missing key is a bug and must surface as an error rather than
//! silently creating a fresh counter at zero.
//!
//! - `get()` returns `Option<&V>`
//! - `increment_ref()` / `decrement_ref()` return `Result<u32, SyncMapError>`
//! - decrementing a zero count is an underflow error, never a wrap

use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;

/// Error type for SyncMap operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncMapError {
    #[error("Key not found")]
    KeyNotFound,

    #[error("Reference count underflow")]
    RefCountUnderflow,
}

/// Types carrying a non-negative reference count.
pub trait HasRefCount {
    /// Increments the count and returns the new value.
    fn increment_ref(&mut self) -> u32;

    /// Decrements the count and returns the new value.
    ///
    /// Returns `None` if the count is already zero.
    fn decrement_ref(&mut self) -> Option<u32>;

    fn ref_count(&self) -> u32;
}

/// A map that only gains entries through explicit inserts.
///
/// # Example
///
/// ```
/// use snat_orch_common::SyncMap;
///
/// let mut map: SyncMap<String, i32> = SyncMap::new();
/// assert!(map.get(&"missing".to_string()).is_none());
/// assert!(map.is_empty());
///
/// map.insert("key".to_string(), 42);
/// assert_eq!(map.get(&"key".to_string()), Some(&42));
/// ```
#[derive(Debug, Clone)]
pub struct SyncMap<K, V> {
    inner: HashMap<K, V>,
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Returns the value for `key` without creating an entry.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Returns the value for `key` without creating an entry.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.remove(key)
    }

    /// Keeps only the entries for which `f` returns true.
    pub fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        self.inner.retain(f);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.values()
    }

    /// Inserts `value` only if `key` is absent; returns the stored value.
    ///
    /// This is the one call that creates entries besides `insert`.
    pub fn get_or_insert(&mut self, key: K, value: V) -> &mut V {
        self.inner.entry(key).or_insert(value)
    }
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
    V: HasRefCount,
{
    /// Increments the count for `key`. Never creates the entry.
    pub fn increment_ref(&mut self, key: &K) -> Result<u32, SyncMapError> {
        match self.inner.get_mut(key) {
            Some(entry) => Ok(entry.increment_ref()),
            None => Err(SyncMapError::KeyNotFound),
        }
    }

    /// Decrements the count for `key`, failing on a missing key or underflow.
    pub fn decrement_ref(&mut self, key: &K) -> Result<u32, SyncMapError> {
        match self.inner.get_mut(key) {
            Some(entry) => entry
                .decrement_ref()
                .ok_or(SyncMapError::RefCountUnderflow),
            None => Err(SyncMapError::KeyNotFound),
        }
    }

    pub fn ref_count(&self, key: &K) -> Option<u32> {
        self.inner.get(key).map(|e| e.ref_count())
    }

    /// Returns the candidate with the smallest count.
    ///
    /// Candidates are scanned in the given order and only a strictly smaller
    /// count replaces the current pick, so ties go to the earliest candidate.
    /// Candidates without an entry are skipped.
    pub fn least_referenced<'a, I>(&self, candidates: I) -> Option<&'a K>
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let mut best: Option<(&'a K, u32)> = None;
        for key in candidates {
            let Some(count) = self.ref_count(key) else {
                continue;
            };
            match best {
                Some((_, min)) if count >= min => {}
                _ => best = Some((key, count)),
            }
        }
        best.map(|(key, _)| key)
    }
}

impl<K, V> Default for SyncMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> FromIterator<(K, V)> for SyncMap<K, V>
where
    K: Eq + Hash,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}
