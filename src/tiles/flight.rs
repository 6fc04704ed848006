//! Single-flight request coalescing.
//!
//! A [`SingleFlight`] maps a key to the one in-flight future computing its
//! value. Concurrent callers asking for the same key share that future; the
//! entry is dropped as soon as the future resolves, so failures are never
//! cached and a later call starts a fresh attempt. Caching successful values
//! is left to the loader.

use crate::prelude::{Arc, HashMap, Mutex};
use crate::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::hash::Hash;
use std::sync::PoisonError;

/// Shared handle to an in-flight computation
pub type SharedResult<V> = Shared<BoxFuture<'static, Result<V>>>;

pub struct SingleFlight<K, V> {
    in_flight: Arc<Mutex<HashMap<K, SharedResult<V>>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::default())),
        }
    }

    /// Returns the in-flight future for `key`, creating it with `loader` when
    /// none exists. The check and the insert happen under one lock, so at most
    /// one loader runs per key at a time.
    pub fn get_or_create<F, Fut>(&self, key: K, loader: F) -> SharedResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = in_flight.get(&key) {
            return existing.clone();
        }

        let registry = Arc::clone(&self.in_flight);
        let entry_key = key.clone();
        let work = loader();
        let shared = async move {
            let result = work.await;
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&entry_key);
            result
        }
        .boxed()
        .shared();

        in_flight.insert(key, shared.clone());
        shared
    }

    /// Whether a computation for `key` is currently in flight
    pub fn is_pending(&self, key: &K) -> bool {
        self.in_flight
            .lock()
            .map(|in_flight| in_flight.contains_key(key))
            .unwrap_or(false)
    }

    /// Number of keys currently in flight
    pub fn len(&self) -> usize {
        self.in_flight
            .lock()
            .map(|in_flight| in_flight.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for SingleFlight<K, V> {
    fn clone(&self) -> Self {
        Self {
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}
