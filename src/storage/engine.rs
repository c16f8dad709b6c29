//! Thread-Safe Storage Engine
//!
//! The engine owns every piece of shared data: string entries, list entries,
//! per-key expiry instants and the dirty counter that drives background saves.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                StorageEngine                 │
//! │  ┌────────────────────────────────────────┐  │
//! │  │            Mutex<Keyspace>             │  │
//! │  │  entries: HashMap<Bytes, Value>        │  │
//! │  │  expires: HashMap<Bytes, i64>          │  │
//! │  │  dirty:   u64                          │  │
//! │  └────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Every public method takes the lock exactly once and finishes its whole
//! check-expired / read / write sequence before releasing it, so INCR on one
//! connection can never interleave with INCR on another. Operations are a few
//! hash lookups long, which keeps a single lock cheap.

use crate::storage::expiry::now_ms;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Errors returned by storage operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The key holds a different kind of value than the operation expects
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// The stored string is not a base-10 64-bit integer
    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR increment or decrement would overflow")]
    Overflow,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A stored value, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(Bytes),
    List(VecDeque<Bytes>),
}

/// The maps guarded by the engine lock.
#[derive(Debug, Default)]
pub(crate) struct Keyspace {
    pub(crate) entries: HashMap<Bytes, Value>,
    /// Absolute expiry instants, milliseconds since the Unix epoch
    pub(crate) expires: HashMap<Bytes, i64>,
    /// Key changes since the last successful snapshot
    pub(crate) dirty: u64,
    /// Keys removed because their TTL passed
    pub(crate) expired_total: u64,
}

/// A point-in-time copy of the keyspace, sorted by key.
///
/// Produced by [`StorageEngine::image`] for the snapshot writer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyspaceImage {
    pub strings: Vec<(Bytes, Bytes)>,
    pub lists: Vec<(Bytes, Vec<Bytes>)>,
    pub expires: Vec<(Bytes, i64)>,
    /// Dirty counter at the moment the image was taken
    pub dirty: u64,
}

impl KeyspaceImage {
    /// Number of keys holding a value.
    pub fn key_count(&self) -> usize {
        self.strings.len() + self.lists.len()
    }
}

/// The main storage engine.
///
/// Wrap it in an `Arc` and share it across connection tasks and the
/// persistence manager.
///
/// # Example
///
/// ```
/// use emberkv::storage::StorageEngine;
/// use bytes::Bytes;
///
/// let engine = StorageEngine::new();
/// engine.set(Bytes::from("name"), Bytes::from("ember"), None);
/// assert_eq!(engine.get(b"name"), Ok(Some(Bytes::from("ember"))));
/// assert_eq!(engine.incr(b"hits"), Ok(1));
/// ```
#[derive(Debug, Default)]
pub struct StorageEngine {
    inner: Mutex<Keyspace>,
}

impl StorageEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the keyspace.
    ///
    /// A panic while holding the lock cannot leave a map half-updated, so a
    /// poisoned lock is recovered rather than propagated.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Keyspace> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a string value, replacing whatever the key held before.
    ///
    /// Any previous expiry is dropped; `expires_at` (ms since epoch) installs a new one.
    pub fn set(&self, key: Bytes, value: Bytes, expires_at: Option<i64>) {
        let mut ks = self.lock();
        match expires_at {
            Some(at) => {
                ks.expires.insert(key.clone(), at);
            }
            None => {
                ks.expires.remove(&key);
            }
        }
        ks.entries.insert(key, Value::String(value));
        ks.dirty += 1;
    }

    /// Gets a string value.
    ///
    /// Expired keys are evicted and reported as absent.
    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        let mut ks = self.lock();
        ks.expire_if_needed(key, now_ms());
        match ks.entries.get(key) {
            Some(Value::String(v)) => Ok(Some(v.clone())),
            Some(Value::List(_)) => Err(StorageError::WrongType),
            None => Ok(None),
        }
    }

    /// Returns the items of a list, or `None` if the key is absent.
    pub fn list_items(&self, key: &[u8]) -> StorageResult<Option<Vec<Bytes>>> {
        let mut ks = self.lock();
        ks.expire_if_needed(key, now_ms());
        match ks.entries.get(key) {
            Some(Value::List(items)) => Ok(Some(items.iter().cloned().collect())),
            Some(Value::String(_)) => Err(StorageError::WrongType),
            None => Ok(None),
        }
    }

    /// Deletes keys of any kind.
    ///
    /// Keys found expired are evicted without being counted. Returns the number
    /// of live keys removed; the dirty counter grows by the same amount.
    pub fn delete(&self, keys: &[Bytes]) -> u64 {
        let mut ks = self.lock();
        let now = now_ms();
        let mut removed = 0;
        for key in keys {
            if ks.expire_if_needed(key, now) {
                continue;
            }
            if ks.entries.remove(key).is_some() {
                ks.expires.remove(key);
                removed += 1;
            }
        }
        ks.dirty += removed;
        removed
    }

    /// Counts how many of the given keys are live.
    ///
    /// A key named twice is counted twice.
    pub fn exists(&self, keys: &[Bytes]) -> u64 {
        let mut ks = self.lock();
        let now = now_ms();
        let mut count = 0;
        for key in keys {
            if !ks.expire_if_needed(key, now) && ks.entries.contains_key(key) {
                count += 1;
            }
        }
        count
    }

    /// Adds one to the integer at `key`; an absent key becomes `1`.
    pub fn incr(&self, key: &[u8]) -> StorageResult<i64> {
        self.apply_delta(key, 1, 1)
    }

    /// Subtracts one from the integer at `key`; an absent key becomes `0`.
    pub fn decr(&self, key: &[u8]) -> StorageResult<i64> {
        self.apply_delta(key, -1, 0)
    }

    /// Read-modify-write on an integer string.
    ///
    /// `initial` is what an absent key is set to. An existing TTL is kept. The
    /// stored value and dirty counter are untouched on error.
    fn apply_delta(&self, key: &[u8], delta: i64, initial: i64) -> StorageResult<i64> {
        let mut ks = self.lock();
        ks.expire_if_needed(key, now_ms());

        let new_value = match ks.entries.get(key) {
            None => initial,
            Some(Value::List(_)) => return Err(StorageError::WrongType),
            Some(Value::String(v)) => {
                let current = std::str::from_utf8(v)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or(StorageError::NotAnInteger)?;
                current.checked_add(delta).ok_or(StorageError::Overflow)?
            }
        };

        ks.entries.insert(
            Bytes::copy_from_slice(key),
            Value::String(Bytes::from(new_value.to_string())),
        );
        ks.dirty += 1;
        Ok(new_value)
    }

    /// Pushes values to the head of a list, one at a time in argument order.
    ///
    /// `LPUSH k a b c` therefore leaves `[c, b, a]`. Returns the new length.
    pub fn lpush(&self, key: &[u8], values: &[Bytes]) -> StorageResult<usize> {
        self.push(key, values, |list, v| list.push_front(v))
    }

    /// Pushes values to the tail of a list in argument order. Returns the new length.
    pub fn rpush(&self, key: &[u8], values: &[Bytes]) -> StorageResult<usize> {
        self.push(key, values, |list, v| list.push_back(v))
    }

    fn push(
        &self,
        key: &[u8],
        values: &[Bytes],
        push_one: impl Fn(&mut VecDeque<Bytes>, Bytes),
    ) -> StorageResult<usize> {
        let mut ks = self.lock();
        ks.expire_if_needed(key, now_ms());

        let entry = ks
            .entries
            .entry(Bytes::copy_from_slice(key))
            .or_insert_with(|| Value::List(VecDeque::new()));

        let len = match entry {
            Value::List(list) => {
                for value in values {
                    push_one(list, value.clone());
                }
                list.len()
            }
            Value::String(_) => return Err(StorageError::WrongType),
        };

        ks.dirty += 1;
        Ok(len)
    }

    /// Returns the number of keys currently stored (expired-but-unswept included).
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key changes since the last successful snapshot.
    pub fn dirty(&self) -> u64 {
        self.lock().dirty
    }

    /// Resets the dirty counter once a snapshot has reached disk.
    pub fn mark_saved(&self) {
        self.lock().dirty = 0;
    }

    /// Copies the whole keyspace under one lock acquisition.
    pub fn image(&self) -> KeyspaceImage {
        let ks = self.lock();
        let mut image = KeyspaceImage {
            dirty: ks.dirty,
            ..Default::default()
        };

        for (key, value) in &ks.entries {
            match value {
                Value::String(v) => image.strings.push((key.clone(), v.clone())),
                Value::List(items) => image
                    .lists
                    .push((key.clone(), items.iter().cloned().collect())),
            }
        }
        image.expires = ks.expires.iter().map(|(k, at)| (k.clone(), *at)).collect();
        drop(ks);

        image.strings.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        image.lists.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        image.expires.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        image
    }

    /// Installs a string entry read from a snapshot. Does not count as a change.
    pub fn restore_string(&self, key: Bytes, value: Bytes) {
        self.lock().entries.insert(key, Value::String(value));
    }

    /// Installs a list entry read from a snapshot. Does not count as a change.
    pub fn restore_list(&self, key: Bytes, items: Vec<Bytes>) {
        self.lock().entries.insert(key, Value::List(items.into()));
    }

    /// Installs an expiry read from a snapshot.
    ///
    /// Returns false and ignores the record if the key holds no value.
    pub fn restore_expiry(&self, key: Bytes, expires_at: i64) -> bool {
        let mut ks = self.lock();
        if !ks.entries.contains_key(&key) {
            return false;
        }
        ks.expires.insert(key, expires_at);
        true
    }

    /// Returns storage statistics.
    pub fn stats(&self) -> StorageStats {
        let ks = self.lock();
        StorageStats {
            keys: ks.entries.len() as u64,
            volatile_keys: ks.expires.len() as u64,
            dirty: ks.dirty,
            expired: ks.expired_total,
        }
    }
}

/// Storage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    /// Number of keys currently stored
    pub keys: u64,
    /// Number of keys with an expiry
    pub volatile_keys: u64,
    /// Changes since the last snapshot
    pub dirty: u64,
    /// Total keys removed by expiry
    pub expired: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn b(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    #[test]
    fn test_set_and_get() {
        let engine = StorageEngine::new();
        engine.set(b("key"), b("value"), None);
        assert_eq!(engine.get(b"key"), Ok(Some(b("value"))));
        assert_eq!(engine.get(b"missing"), Ok(None));
    }

    #[test]
    fn test_set_overwrites_and_clears_ttl() {
        let engine = StorageEngine::new();
        engine.set(b("key"), b("old"), Some(now_ms() + 60_000));
        engine.set(b("key"), b("new"), None);
        assert_eq!(engine.get(b"key"), Ok(Some(b("new"))));
        assert_eq!(engine.stats().volatile_keys, 0);
    }

    #[test]
    fn test_set_replaces_list() {
        let engine = StorageEngine::new();
        engine.rpush(b"key", &[b("a")]).unwrap();
        engine.set(b("key"), b("value"), None);
        assert_eq!(engine.get(b"key"), Ok(Some(b("value"))));
    }

    #[test]
    fn test_expired_key_is_invisible() {
        let engine = StorageEngine::new();
        engine.set(b("key"), b("value"), Some(now_ms() - 1));

        assert_eq!(engine.get(b"key"), Ok(None));
        assert_eq!(engine.len(), 0);
        assert_eq!(engine.stats().expired, 1);
    }

    #[test]
    fn test_delete_skips_expired() {
        let engine = StorageEngine::new();
        engine.set(b("live"), b("1"), None);
        engine.set(b("gone"), b("2"), Some(now_ms() - 1000));
        engine.rpush(b"list", &[b("x")]).unwrap();
        let dirty_before = engine.dirty();

        let removed = engine.delete(&[b("live"), b("gone"), b("list"), b("missing")]);
        assert_eq!(removed, 2);
        assert_eq!(engine.dirty(), dirty_before + 2);
        assert!(engine.is_empty());
        assert_eq!(engine.stats().volatile_keys, 0);
    }

    #[test]
    fn test_exists_counts_both_kinds() {
        let engine = StorageEngine::new();
        engine.set(b("s"), b("1"), None);
        engine.lpush(b"l", &[b("x")]).unwrap();
        engine.set(b("gone"), b("2"), Some(now_ms() - 1));

        assert_eq!(engine.exists(&[b("s"), b("l"), b("gone"), b("none")]), 2);
        assert_eq!(engine.exists(&[b("s"), b("s")]), 2);
        assert_eq!(engine.len(), 2);
    }

    #[test]
    fn test_incr() {
        let engine = StorageEngine::new();
        assert_eq!(engine.incr(b"counter"), Ok(1));
        assert_eq!(engine.incr(b"counter"), Ok(2));

        engine.set(b("num"), b("41"), None);
        assert_eq!(engine.incr(b"num"), Ok(42));
        assert_eq!(engine.get(b"num"), Ok(Some(b("42"))));
    }

    #[test]
    fn test_incr_non_numeric_leaves_value() {
        let engine = StorageEngine::new();
        engine.set(b("text"), b("abc"), None);
        let dirty = engine.dirty();

        assert_eq!(engine.incr(b"text"), Err(StorageError::NotAnInteger));
        assert_eq!(engine.get(b"text"), Ok(Some(b("abc"))));
        assert_eq!(engine.dirty(), dirty);
    }

    #[test]
    fn test_incr_overflow() {
        let engine = StorageEngine::new();
        engine.set(b("max"), Bytes::from(i64::MAX.to_string()), None);
        assert_eq!(engine.incr(b"max"), Err(StorageError::Overflow));
    }

    #[test]
    fn test_decr() {
        let engine = StorageEngine::new();
        assert_eq!(engine.decr(b"counter"), Ok(0));
        assert_eq!(engine.decr(b"counter"), Ok(-1));

        engine.set(b("num"), b("10"), None);
        assert_eq!(engine.decr(b"num"), Ok(9));
    }

    #[test]
    fn test_incr_after_expiry_starts_over() {
        let engine = StorageEngine::new();
        engine.set(b("counter"), b("99"), Some(now_ms() - 1));
        assert_eq!(engine.incr(b"counter"), Ok(1));
        assert_eq!(engine.stats().volatile_keys, 0);
    }

    #[test]
    fn test_incr_keeps_ttl() {
        let engine = StorageEngine::new();
        engine.set(b("counter"), b("1"), Some(now_ms() + 60_000));
        assert_eq!(engine.incr(b"counter"), Ok(2));
        assert_eq!(engine.stats().volatile_keys, 1);
    }

    #[test]
    fn test_lpush_rpush_order() {
        let engine = StorageEngine::new();
        assert_eq!(engine.lpush(b"l", &[b("a"), b("b"), b("c")]), Ok(3));
        assert_eq!(
            engine.list_items(b"l"),
            Ok(Some(vec![b("c"), b("b"), b("a")]))
        );

        assert_eq!(engine.rpush(b"r", &[b("a"), b("b"), b("c")]), Ok(3));
        assert_eq!(
            engine.list_items(b"r"),
            Ok(Some(vec![b("a"), b("b"), b("c")]))
        );

        assert_eq!(engine.rpush(b"l", &[b("z")]), Ok(4));
        assert_eq!(engine.lpush(b"l", &[b("y")]), Ok(5));
        assert_eq!(
            engine.list_items(b"l"),
            Ok(Some(vec![b("y"), b("c"), b("b"), b("a"), b("z")]))
        );
    }

    #[test]
    fn test_cross_type_operations_rejected() {
        let engine = StorageEngine::new();
        engine.set(b("s"), b("1"), None);
        engine.rpush(b"l", &[b("x")]).unwrap();

        assert_eq!(engine.lpush(b"s", &[b("x")]), Err(StorageError::WrongType));
        assert_eq!(engine.rpush(b"s", &[b("x")]), Err(StorageError::WrongType));
        assert_eq!(engine.get(b"l"), Err(StorageError::WrongType));
        assert_eq!(engine.incr(b"l"), Err(StorageError::WrongType));
        assert_eq!(engine.decr(b"l"), Err(StorageError::WrongType));
        assert_eq!(engine.get(b"s"), Ok(Some(b("1"))));
    }

    #[test]
    fn test_push_onto_expired_list_starts_fresh() {
        let engine = StorageEngine::new();
        engine.rpush(b"l", &[b("old")]).unwrap();
        engine.lock().expires.insert(b("l"), now_ms() - 1);

        assert_eq!(engine.rpush(b"l", &[b("new")]), Ok(1));
        assert_eq!(engine.list_items(b"l"), Ok(Some(vec![b("new")])));
    }

    #[test]
    fn test_dirty_counter() {
        let engine = StorageEngine::new();
        engine.set(b("a"), b("1"), None);
        engine.incr(b"a").unwrap();
        engine.lpush(b"l", &[b("x"), b("y")]).unwrap();
        engine.get(b"a").unwrap();
        engine.exists(&[b("a")]);
        assert_eq!(engine.dirty(), 3);

        engine.mark_saved();
        assert_eq!(engine.dirty(), 0);
    }

    #[test]
    fn test_mark_saved_clears_writes_after_image() {
        let engine = StorageEngine::new();
        engine.set(b("a"), b("1"), None);
        let image = engine.image();
        assert_eq!(image.dirty, 1);

        // A write lands while the snapshot is being written.
        engine.set(b("b"), b("2"), None);
        assert_eq!(engine.dirty(), 2);

        engine.mark_saved();
        assert_eq!(engine.dirty(), 0);
    }

    #[test]
    fn test_image_and_restore() {
        let engine = StorageEngine::new();
        let at = now_ms() + 60_000;
        engine.set(b("b"), b("2"), None);
        engine.set(b("a"), b("1"), Some(at));
        engine.rpush(b"list", &[b("x"), b("y")]).unwrap();

        let image = engine.image();
        assert_eq!(image.strings, vec![(b("a"), b("1")), (b("b"), b("2"))]);
        assert_eq!(image.lists, vec![(b("list"), vec![b("x"), b("y")])]);
        assert_eq!(image.expires, vec![(b("a"), at)]);
        assert_eq!(image.dirty, 3);
        assert_eq!(image.key_count(), 3);

        let copy = StorageEngine::new();
        for (k, v) in image.strings.clone() {
            copy.restore_string(k, v);
        }
        for (k, items) in image.lists.clone() {
            copy.restore_list(k, items);
        }
        for (k, at) in image.expires.clone() {
            assert!(copy.restore_expiry(k, at));
        }
        assert!(!copy.restore_expiry(b("orphan"), at));

        let restored = copy.image();
        assert_eq!(restored.strings, image.strings);
        assert_eq!(restored.lists, image.lists);
        assert_eq!(restored.expires, image.expires);
        assert_eq!(restored.dirty, 0);
    }

    #[test]
    fn test_concurrent_incr_no_lost_updates() {
        const THREADS: usize = 16;
        const PER_THREAD: usize = 1000;

        let engine = Arc::new(StorageEngine::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        engine.incr(b"counter").unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            engine.get(b"counter"),
            Ok(Some(Bytes::from((THREADS * PER_THREAD).to_string())))
        );
        assert_eq!(engine.dirty(), (THREADS * PER_THREAD) as u64);
    }

    #[test]
    fn test_concurrent_mixed_access() {
        let engine = Arc::new(StorageEngine::new());
        let mut handles = vec![];

        for i in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(thread::spawn(move || {
                for j in 0..200 {
                    let key = Bytes::from(format!("key-{}-{}", i, j));
                    engine.set(key.clone(), Bytes::from("v"), Some(now_ms() - 1));
                    engine.rpush(b"shared", &[key.clone()]).unwrap();
                    assert_eq!(engine.exists(&[key.clone()]), 0);
                    assert_eq!(engine.delete(&[key]), 0);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(engine.list_items(b"shared").unwrap().unwrap().len(), 1600);
        assert_eq!(engine.len(), 1);
    }
}
