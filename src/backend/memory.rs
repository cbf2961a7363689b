//! In-memory backend.
//!
//! A single keyspace behind a mutex. Each command takes the lock once, which
//! makes every command (including the batched ones) atomic with respect to
//! other handles. Expiry is lazy: an expired key is dropped the next time any
//! command touches it. Deadlines use `tokio::time::Instant`, so paused-clock
//! tests can drive expiry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{Backend, BackendError};

#[derive(Debug)]
enum Value {
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    Str(String),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    /// Live entry for `key`, evicting it first if its TTL elapsed.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }
}

/// Expiry deadline `ttl` from now. A TTL past the end of the clock never
/// expires.
fn deadline(ttl: Duration) -> Option<Instant> {
    Instant::now().checked_add(ttl)
}

/// Backend holding all keys in process memory.
///
/// Handles created with [`InMemoryBackend::handle`] share the keyspace but
/// are disposed independently, mirroring separate connections to one server.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    keyspace: Arc<Mutex<Keyspace>>,
    disposed: AtomicBool,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Another handle onto the same keyspace.
    pub fn handle(&self) -> Self {
        Self {
            keyspace: Arc::clone(&self.keyspace),
            disposed: AtomicBool::new(false),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let mut keyspace = self.keyspace.lock();
        let now = Instant::now();
        keyspace
            .entries
            .retain(|_, e| e.expires_at.is_none_or(|at| at > now));
        keyspace.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(BackendError::Disposed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn hset_all(
        &self,
        key: &str,
        fields: &[(&str, String)],
        expire: Option<Duration>,
    ) -> Result<(), BackendError> {
        self.ensure_open()?;
        let mut keyspace = self.keyspace.lock();
        if keyspace.live(key).is_none() {
            keyspace.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        let Some(entry) = keyspace.entries.get_mut(key) else {
            return Err(BackendError::Command(format!("key {key} vanished")));
        };
        let Value::Hash(hash) = &mut entry.value else {
            return Err(BackendError::WrongType(key.to_string()));
        };
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
        // Like `EXPIRE NX`: a TTL already running is left alone.
        if let Some(ttl) = expire
            && entry.expires_at.is_none()
        {
            entry.expires_at = deadline(ttl);
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BackendError> {
        self.ensure_open()?;
        let mut keyspace = self.keyspace.lock();
        match keyspace.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.get(field).cloned()),
            Some(_) => Err(BackendError::WrongType(key.to_string())),
        }
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, BackendError> {
        self.ensure_open()?;
        let mut keyspace = self.keyspace.lock();
        match keyspace.live(key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(BackendError::WrongType(key.to_string())),
        }
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), BackendError> {
        self.ensure_open()?;
        let mut keyspace = self.keyspace.lock();
        if keyspace.live(key).is_none() {
            keyspace.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::List(VecDeque::new()),
                    expires_at: None,
                },
            );
        }
        match keyspace.entries.get_mut(key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => {
                list.push_back(value.to_string());
                Ok(())
            }
            _ => Err(BackendError::WrongType(key.to_string())),
        }
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.ensure_open()?;
        let mut keyspace = self.keyspace.lock();
        let (popped, now_empty) = match keyspace.live(key) {
            None => return Ok(None),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => {
                let popped = list.pop_front();
                (popped, list.is_empty())
            }
            Some(_) => return Err(BackendError::WrongType(key.to_string())),
        };
        // Redis deletes a list once its last element is removed.
        if now_empty {
            keyspace.entries.remove(key);
        }
        Ok(popped)
    }

    async fn llen(&self, key: &str) -> Result<usize, BackendError> {
        self.ensure_open()?;
        let mut keyspace = self.keyspace.lock();
        match keyspace.live(key) {
            None => Ok(0),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.len()),
            Some(_) => Err(BackendError::WrongType(key.to_string())),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.ensure_open()?;
        let mut keyspace = self.keyspace.lock();
        match keyspace.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(BackendError::WrongType(key.to_string())),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError> {
        self.ensure_open()?;
        let mut keyspace = self.keyspace.lock();
        keyspace.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: deadline(ttl),
            },
        );
        Ok(())
    }

    async fn dispose(&self) -> Result<(), BackendError> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Err(BackendError::Disposed);
        }
        Ok(())
    }
}
