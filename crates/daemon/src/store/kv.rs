//! In-process key-value engine.
//!
//! Provides the subset of a hash/list key-value store the session store is
//! laid out on: hashes, append-only lists, per-key expiry, and multi-key
//! transactions. A transaction runs under a single lock and is rolled back
//! if its closure returns an error, so callers never observe a torn write.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::StoreError;

/// A stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Hash(HashMap<String, String>),
    List(Vec<String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Hash(_) => "hash",
            Value::List(_) => "list",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Thread-safe in-memory key-value store.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

/// A view over the store held for the duration of one transaction.
pub struct Txn<'a> {
    entries: &'a mut HashMap<String, Entry>,
    now: Instant,
    /// Prior state of every key touched, recorded on first mutation.
    undo: Vec<(String, Option<Entry>)>,
}

impl Txn<'_> {
    fn live(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key).filter(|e| !e.is_expired(self.now))
    }

    /// Records the prior state of `key` and drops it if expired.
    fn touch(&mut self, key: &str) {
        if !self.undo.iter().any(|(k, _)| k == key) {
            self.undo
                .push((key.to_string(), self.entries.get(key).cloned()));
        }
        if self
            .entries
            .get(key)
            .is_some_and(|e| e.is_expired(self.now))
        {
            self.entries.remove(key);
        }
    }

    fn wrong_type(key: &str, expected: &str, found: &Value) -> StoreError {
        StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("expected {}, found {}", expected, found.kind()),
        }
    }

    /// Returns true if a live value exists at `key`.
    pub fn exists(&self, key: &str) -> bool {
        self.live(key).is_some()
    }

    /// Returns all fields of the hash at `key`.
    pub fn hgetall(&self, key: &str) -> Result<Option<HashMap<String, String>>, StoreError> {
        match self.live(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(map)) => Ok(Some(map.clone())),
            Some(other) => Err(Self::wrong_type(key, "hash", other)),
        }
    }

    /// Merges fields into the hash at `key`, creating it if absent.
    ///
    /// An existing expiry is preserved.
    pub fn hset<I>(&mut self, key: &str, fields: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.touch(key);
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(map) => {
                map.extend(fields);
                Ok(())
            }
            other => Err(Self::wrong_type(key, "hash", other)),
        }
    }

    /// Appends to the list at `key`, creating it if absent. Returns the new length.
    pub fn rpush(&mut self, key: &str, value: String) -> Result<usize, StoreError> {
        self.touch(key);
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(Vec::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::List(list) => {
                list.push(value);
                Ok(list.len())
            }
            other => Err(Self::wrong_type(key, "list", other)),
        }
    }

    /// Returns every element of the list at `key`, oldest first.
    pub fn lrange_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        match self.live(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(list.clone()),
            Some(other) => Err(Self::wrong_type(key, "list", other)),
        }
    }

    /// Returns the length of the list at `key`.
    pub fn llen(&self, key: &str) -> Result<usize, StoreError> {
        match self.live(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(other) => Err(Self::wrong_type(key, "list", other)),
        }
    }

    /// Removes `key`. Returns true if a live value was removed.
    pub fn del(&mut self, key: &str) -> bool {
        let existed = self.exists(key);
        self.touch(key);
        self.entries.remove(key);
        existed
    }

    /// Sets a time-to-live on `key`. Returns false if the key does not exist.
    pub fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        if !self.exists(key) {
            return false;
        }
        self.touch(key);
        let deadline = self.now + ttl;
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(deadline);
                true
            }
            None => false,
        }
    }

    /// Remaining time-to-live of `key`, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.live(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(self.now))
    }

    /// Lists live keys starting with `prefix`.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired(self.now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn rollback(self) {
        for (key, prior) in self.undo.into_iter().rev() {
            match prior {
                Some(entry) => {
                    self.entries.insert(key, entry);
                }
                None => {
                    self.entries.remove(&key);
                }
            }
        }
    }
}

impl MemoryKv {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` atomically against the store.
    ///
    /// All reads and writes inside `f` happen under one lock. If `f` returns
    /// an error every write it made is undone.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T, StoreError>,
    {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Unavailable("key-value lock poisoned".to_string()))?;

        let mut txn = Txn {
            entries: &mut *entries,
            now: Instant::now(),
            undo: Vec::new(),
        };

        match f(&mut txn) {
            Ok(value) => Ok(value),
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    /// Returns all fields of the hash at `key`.
    pub fn hgetall(&self, key: &str) -> Result<Option<HashMap<String, String>>, StoreError> {
        self.transaction(|tx| tx.hgetall(key))
    }

    /// Returns every element of the list at `key`.
    pub fn lrange_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.transaction(|tx| tx.lrange_all(key))
    }

    /// Remaining time-to-live of `key`.
    pub fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.transaction(|tx| Ok(tx.ttl(key)))
    }

    /// Returns true if a live value exists at `key`.
    pub fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.transaction(|tx| Ok(tx.exists(key)))
    }

    /// Physically removes expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Unavailable("key-value lock poisoned".to_string()))?;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok(before - entries.len())
    }

    /// Number of physically stored entries, including expired ones not yet purged.
    pub fn raw_len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}
