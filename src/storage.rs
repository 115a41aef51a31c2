/*!
 * In-Memory Storage
 *
 * A concurrent map from key to `Entry` (stored value plus optional expiry
 * deadline), guarded by a single reader/writer lock. Reads share the lock;
 * every mutation, including the purge of an expired key discovered on a
 * read path, takes it exclusively.
 *
 * Expiry is lazy: a stale key is removed only when something touches it
 * (or when `purge_expired` is called explicitly).
 */

use crate::error::WrongType;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::time::{Duration, Instant};

// AHash: faster lookups than the default SipHash
pub(crate) type AHash = BuildHasherDefault<ahash::AHasher>;

/// Field map held by a hash entry
pub type FieldMap = HashMap<Bytes, Bytes, AHash>;

/// The closed set of value kinds a key can hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    /// Plain string/binary value
    Str(Bytes),
    /// Field → value map
    Hash(FieldMap),
}

/// A stored value plus its optional expiry deadline
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: StoredValue,
    pub expires_at: Option<Instant>,
}

impl Entry {
    fn persistent(value: StoredValue) -> Self {
        Self { value, expires_at: None }
    }

    #[inline]
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}

/// Remaining lifetime of a key as reported by `Store::ttl`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Key absent or already expired (`-2`)
    Missing,
    /// Key present without a deadline (`-1`)
    Persistent,
    /// Key expires in this many whole seconds, rounded up
    Seconds(i64),
}

impl Ttl {
    /// The integer reply used on the wire
    pub fn as_reply(self) -> i64 {
        match self {
            Ttl::Missing => -2,
            Ttl::Persistent => -1,
            Ttl::Seconds(s) => s,
        }
    }
}

/// Result of a successful `Store::hset_many`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashWrite {
    /// Fields written, overwrites included
    pub written: usize,
    /// The hash itself was created by this write
    pub created: bool,
}

/// Concurrent key → entry map
#[derive(Default)]
pub struct Store {
    inner: RwLock<HashMap<Bytes, Entry, AHash>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a string value, replacing whatever the key held
    ///
    /// # Arguments
    /// * `key` - Key to write
    /// * `value` - String value
    /// * `ttl` - Lifetime; `None` or a zero duration means no expiry
    pub fn set(&self, key: Bytes, value: Bytes, ttl: Option<Duration>) {
        // A deadline past what Instant can represent is treated as never
        let expires_at = ttl
            .filter(|d| !d.is_zero())
            .and_then(|d| Instant::now().checked_add(d));
        let entry = Entry { value: StoredValue::Str(value), expires_at };
        self.inner.write().insert(key, entry);
    }

    /// Get a string value
    ///
    /// Expired keys are purged and reported as missing. A key holding a
    /// hash is also reported as missing.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.read_live(key, |entry| match &entry.value {
            StoredValue::Str(v) => Some(v.clone()),
            StoredValue::Hash(_) => None,
        })
        .flatten()
    }

    /// Delete a key
    ///
    /// # Returns
    /// * `true` if a live key was removed
    /// * `false` if the key was absent or had already expired
    pub fn delete(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        match self.inner.write().remove(key) {
            Some(entry) => !entry.is_expired(now),
            None => false,
        }
    }

    /// Set a single hash field
    ///
    /// # Returns
    /// * `true` if the field was written
    /// * `false` if the key holds a string; nothing is changed
    pub fn hset(&self, key: Bytes, field: Bytes, value: Bytes) -> bool {
        self.hset_many(key, vec![(field, value)]).is_ok()
    }

    /// Upsert several hash fields in one critical section
    ///
    /// Creates the hash if the key is absent (or expired).
    ///
    /// # Returns
    /// * `Ok(HashWrite)` - how many fields were written and whether the hash was created
    /// * `Err(WrongType)` - the key holds a string; nothing is changed
    pub fn hset_many(&self, key: Bytes, pairs: Vec<(Bytes, Bytes)>) -> Result<HashWrite, WrongType> {
        let now = Instant::now();
        let mut map = self.inner.write();

        if map.get(&key).is_some_and(|e| e.is_expired(now)) {
            map.remove(&key);
        }
        let created = !map.contains_key(&key);

        let entry = map
            .entry(key)
            .or_insert_with(|| Entry::persistent(StoredValue::Hash(FieldMap::default())));
        let fields = match &mut entry.value {
            StoredValue::Hash(fields) => fields,
            StoredValue::Str(_) => return Err(WrongType),
        };

        let written = pairs.len();
        fields.extend(pairs);
        Ok(HashWrite { written, created })
    }

    /// Get one hash field; a missing key, missing field or string key all yield `None`
    pub fn hget(&self, key: &[u8], field: &[u8]) -> Option<Bytes> {
        self.read_live(key, |entry| match &entry.value {
            StoredValue::Hash(fields) => fields.get(field).cloned(),
            StoredValue::Str(_) => None,
        })
        .flatten()
    }

    /// Copy out every field of a hash
    pub fn hgetall(&self, key: &[u8]) -> Option<FieldMap> {
        self.read_live(key, |entry| match &entry.value {
            StoredValue::Hash(fields) => Some(fields.clone()),
            StoredValue::Str(_) => None,
        })
        .flatten()
    }

    /// Check whether a live key exists, whatever its type
    pub fn exists(&self, key: &[u8]) -> bool {
        self.read_live(key, |_| ()).is_some()
    }

    /// Remaining lifetime of a key
    pub fn ttl(&self, key: &[u8]) -> Ttl {
        let now = Instant::now();
        self.read_live(key, |entry| match entry.expires_at {
            None => Ttl::Persistent,
            Some(deadline) => {
                let left = deadline.saturating_duration_since(now);
                // Round up so a key that is still alive never reports 0
                Ttl::Seconds(left.as_nanos().div_ceil(1_000_000_000) as i64)
            }
        })
        .unwrap_or(Ttl::Missing)
    }

    /// Number of stored entries, including expired ones nobody has touched yet
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Drop every expired entry in one pass
    ///
    /// Nothing schedules this; it is the hook for a periodic sweeper.
    ///
    /// # Returns
    /// * Number of entries removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.inner.write();
        let before = map.len();
        map.retain(|_, entry| !entry.is_expired(now));
        before - map.len()
    }

    /// Clone out every live key and value, ignoring deadlines
    ///
    /// Used to compare two stores observationally (e.g. before and after
    /// replaying a log).
    pub fn snapshot(&self) -> HashMap<Bytes, StoredValue> {
        let now = Instant::now();
        self.inner
            .read()
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(k, entry)| (k.clone(), entry.value.clone()))
            .collect()
    }

    /// Run `f` against a live entry under the shared lock
    ///
    /// If the entry turns out to be expired, the shared lock is released,
    /// the exclusive lock is taken, and the deadline is checked again
    /// before removing, so a concurrent SET that replaced the key in
    /// between is left alone.
    fn read_live<T>(&self, key: &[u8], f: impl FnOnce(&Entry) -> T) -> Option<T> {
        let now = Instant::now();
        {
            let map = self.inner.read();
            match map.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(f(entry)),
                Some(_) => {}
            }
        }

        let mut map = self.inner.write();
        if map.get(key).is_some_and(|e| e.is_expired(now)) {
            map.remove(key);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn set_overwrites_and_get_reads() {
        let store = Store::new();
        store.set(b("k"), b("v1"), None);
        store.set(b("k"), b("v2"), None);
        assert_eq!(store.get(b"k"), Some(b("v2")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn zero_ttl_means_no_expiry() {
        let store = Store::new();
        store.set(b("k"), b("v"), Some(Duration::ZERO));
        assert_eq!(store.ttl(b"k"), Ttl::Persistent);
    }

    #[test]
    fn expired_key_is_purged_on_read() {
        let store = Store::new();
        store.set(b("k"), b("v"), Some(Duration::from_millis(20)));
        assert!(store.exists(b"k"));
        sleep(Duration::from_millis(40));

        assert_eq!(store.len(), 1, "nothing sweeps in the background");
        assert_eq!(store.get(b"k"), None);
        assert_eq!(store.len(), 0);
        assert_eq!(store.ttl(b"k"), Ttl::Missing);
    }

    #[test]
    fn ttl_rounds_up_to_whole_seconds() {
        let store = Store::new();
        store.set(b("k"), b("v"), Some(Duration::from_millis(1500)));
        assert_eq!(store.ttl(b"k"), Ttl::Seconds(2));
        store.set(b("k"), b("v"), Some(Duration::from_millis(300)));
        assert_eq!(store.ttl(b"k"), Ttl::Seconds(1));
    }

    #[test]
    fn hset_on_string_fails_without_mutation() {
        let store = Store::new();
        store.set(b("k"), b("v"), None);
        assert!(!store.hset(b("k"), b("f"), b("x")));
        assert_eq!(store.get(b"k"), Some(b("v")));
    }

    #[test]
    fn type_mismatch_reads_as_missing() {
        let store = Store::new();
        store.set(b("s"), b("v"), None);
        assert!(store.hset(b("h"), b("f"), b("x")));

        assert_eq!(store.get(b"h"), None);
        assert_eq!(store.hget(b"s", b"f"), None);
        assert_eq!(store.hgetall(b"s"), None);
        assert!(store.exists(b"s") && store.exists(b"h"));
    }

    #[test]
    fn hset_many_counts_every_written_field() {
        let store = Store::new();
        assert_eq!(
            store.hset_many(b("h"), vec![(b("a"), b("1")), (b("b"), b("2"))]),
            Ok(HashWrite { written: 2, created: true })
        );
        assert_eq!(
            store.hset_many(b("h"), vec![(b("a"), b("9")), (b("c"), b("3"))]),
            Ok(HashWrite { written: 2, created: false })
        );
        assert_eq!(store.hget(b"h", b"a"), Some(b("9")));
        assert_eq!(store.hgetall(b"h").map(|m| m.len()), Some(3));
    }

    #[test]
    fn hset_replaces_expired_string() {
        let store = Store::new();
        store.set(b("k"), b("v"), Some(Duration::from_millis(10)));
        sleep(Duration::from_millis(30));
        assert_eq!(store.hset_many(b("k"), vec![(b("f"), b("x"))]), Ok(HashWrite { written: 1, created: true }));
        assert_eq!(store.hget(b"k", b"f"), Some(b("x")));
    }

    #[test]
    fn delete_is_idempotent() {
        let store = Store::new();
        store.set(b("k"), b("v"), None);
        assert!(store.delete(b"k"));
        assert!(!store.delete(b"k"));
        assert!(!store.exists(b"k"));
    }

    #[test]
    fn purge_expired_sweeps_untouched_keys() {
        let store = Store::new();
        store.set(b("a"), b("1"), Some(Duration::from_millis(10)));
        store.set(b("b"), b("2"), None);
        sleep(Duration::from_millis(30));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.snapshot().len(), 1);
    }
}
