//! Request coalescing
//!
//! Concurrent calls with the same key share one execution and all observe its
//! result. The work runs in its own task, so a caller going away does not
//! cancel it, and the key is released as soon as the work completes: the next
//! call after that starts a fresh execution.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::task::JoinError;
use tracing::trace;

type InFlight<K, T, E> = Arc<Mutex<HashMap<K, Shared<BoxFuture<'static, Result<T, E>>>>>>;

pub struct Coalescer<K, T, E> {
    inflight: InFlight<K, T, E>,
}

impl<K, T, E> Clone for Coalescer<K, T, E> {
    fn clone(&self) -> Self {
        Self {
            inflight: self.inflight.clone(),
        }
    }
}

impl<K, T, E> Default for Coalescer<K, T, E> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, T, E> Coalescer<K, T, E>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + From<JoinError> + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` under `key`, or join the execution already in flight
    pub async fn run<F, Fut>(&self, key: K, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());

            match inflight.get(&key) {
                Some(existing) => {
                    trace!(key = ?key, "Joining in-flight execution");
                    existing.clone()
                }
                None => {
                    let release = Release {
                        key: key.clone(),
                        inflight: self.inflight.clone(),
                    };
                    let fut = work();
                    // The map lock is held until the entry is inserted, so the
                    // task cannot release the key before it exists
                    let handle = tokio::spawn(async move {
                        let _release = release;
                        fut.await
                    });

                    let shared = async move { handle.await.unwrap_or_else(|e| Err(E::from(e))) }
                        .boxed()
                        .shared();
                    inflight.insert(key, shared.clone());
                    shared
                }
            }
        };

        shared.await
    }

    /// Number of keys currently executing
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Removes the key when the work finishes, panics included
struct Release<K: Eq + Hash, T, E> {
    key: K,
    inflight: InFlight<K, T, E>,
}

impl<K: Eq + Hash, T, E> Drop for Release<K, T, E> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight.remove(&self.key);
    }
}
