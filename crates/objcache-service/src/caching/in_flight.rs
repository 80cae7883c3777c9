use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};

use crate::utils::defer::defer;

use super::{CacheContents, CacheKey, CacheName};

type SharedResult<T> = Shared<BoxFuture<'static, CacheContents<T>>>;
type Running<T> = Arc<Mutex<HashMap<CacheKey, SharedResult<T>>>>;

/// A ledger of operations that are currently running, keyed by [`CacheKey`].
///
/// The first request for a key starts the operation, every concurrent request for the same key
/// attaches to it and observes the identical result. The operation is spawned onto the runtime,
/// so it runs to completion even when every caller stops waiting. Its ledger entry is removed
/// as soon as it finishes, successful or not.
pub(super) struct InFlight<T> {
    name: CacheName,
    /// What kind of operation this ledger tracks, used as a metric tag.
    op: &'static str,
    running: Running<T>,
}

impl<T> Clone for InFlight<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            op: self.op,
            running: Arc::clone(&self.running),
        }
    }
}

impl<T> std::fmt::Debug for InFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let running = self.running.try_lock().map(|r| r.len()).unwrap_or_default();
        f.debug_struct("InFlight")
            .field("name", &self.name)
            .field("op", &self.op)
            .field("running", &running)
            .finish()
    }
}

impl<T> InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: CacheName, op: &'static str) -> Self {
        Self {
            name,
            op,
            running: Default::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, SharedResult<T>>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().contains_key(key)
    }

    /// The file names of all keys with a running operation.
    pub fn file_names(&self) -> Vec<String> {
        self.lock().keys().map(CacheKey::file_name).collect()
    }

    /// Returns handles to every running operation.
    pub fn all(&self) -> Vec<SharedResult<T>> {
        self.lock().values().cloned().collect()
    }

    /// Returns a handle to the running operation for `key`, if any.
    pub fn get(&self, key: &CacheKey) -> Option<SharedResult<T>> {
        self.lock().get(key).cloned()
    }

    /// Attaches to the running operation for `key`, or starts a new one created by `make`.
    pub async fn run_or_join<F, Fut>(&self, key: CacheKey, make: F) -> CacheContents<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheContents<T>> + Send + 'static,
    {
        let shared = {
            let mut running = self.lock();
            match running.get(&key) {
                Some(existing) => {
                    metric!(
                        counter("caches.coalesced") += 1,
                        "cache" => self.name.as_ref(),
                        "op" => self.op,
                    );
                    tracing::trace!("Joining running {} of {} `{}`", self.op, self.name, key);
                    existing.clone()
                }
                None => {
                    let done = {
                        let running = Arc::clone(&self.running);
                        let key = key.clone();
                        defer(move || {
                            running
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .remove(&key);
                        })
                    };

                    let task = make();
                    let task = async move {
                        let _done = done;
                        task.await
                    };
                    let handle = tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));

                    // The entry is inserted before the lock is released, so the task can only
                    // remove it afterwards.
                    let shared = async move { handle.await.unwrap_or_else(|e| Err(e.into())) }
                        .boxed()
                        .shared();
                    running.insert(key, shared.clone());
                    shared
                }
            }
        };

        shared.await
    }
}
