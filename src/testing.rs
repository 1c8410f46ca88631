//! In-process remote store for tests

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{CacheError, Liveness, RemoteStore};

/// Remote store double that can be switched unreachable.
///
/// While unreachable every command fails, as a dropped Redis connection would.
/// Readiness is driven explicitly through [`MemoryStore::connect`] and
/// [`MemoryStore::disconnect`], standing in for the reconnect supervisor.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    data: Mutex<HashMap<String, (String, Option<Duration>)>>,
    reachable: AtomicBool,
    liveness: Liveness,
    commands: AtomicUsize,
}

impl MemoryStore {
    /// A store that is reachable and ready
    pub fn ready() -> Self {
        let store = Self::default();
        store.connect();
        store
    }

    pub fn connect(&self) {
        self.inner.reachable.store(true, Ordering::SeqCst);
        self.inner.liveness.mark_ready();
    }

    /// Fail every command from now on, without touching the readiness flag.
    ///
    /// The first failing command is what flips readiness, as with a real
    /// connection dropping between commands.
    pub fn break_link(&self) {
        self.inner.reachable.store(false, Ordering::SeqCst);
    }

    pub fn disconnect(&self) {
        self.break_link();
        self.inner.liveness.mark_down("connection closed");
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.lock().get(key).map(|(v, _)| v.clone())
    }

    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.lock().get(key).and_then(|(_, ttl)| *ttl)
    }

    pub fn put_raw(&self, key: &str, value: &str) {
        self.lock().insert(key.to_owned(), (value.to_owned(), None));
    }

    pub fn commands(&self) -> usize {
        self.inner.commands.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Option<Duration>)>> {
        self.inner.data.lock().unwrap()
    }

    fn check(&self) -> Result<(), CacheError> {
        self.inner.commands.fetch_add(1, Ordering::SeqCst);
        if self.inner.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable)
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        Ok(self.raw(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.check()?;
        let ttl = ttl.filter(|t| t.as_secs() > 0);
        self.lock().insert(key.to_owned(), (value.to_owned(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.check()?;
        Ok(self.lock().remove(key).is_some())
    }

    async fn ping(&self) -> Result<Duration, CacheError> {
        self.check()?;
        Ok(Duration::from_micros(250))
    }

    async fn info(&self) -> Result<String, CacheError> {
        self.check()?;
        Ok(format!("# Keyspace\r\ndb0:keys={}\r\n", self.lock().len()))
    }

    async fn flush(&self) -> Result<(), CacheError> {
        self.check()?;
        self.lock().clear();
        Ok(())
    }

    fn liveness(&self) -> &Liveness {
        &self.inner.liveness
    }
}
