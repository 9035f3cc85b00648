//! Request deduplication.
//!
//! The first caller for a key runs the work on a spawned task; everyone
//! else awaits the same shared future. The entry is removed when the work
//! finishes, before any waiter observes the value, so a later call for the
//! same key starts fresh.
//!
//! Dropping a waiter's future only detaches that waiter. The work keeps
//! running for the others.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::error::GatewayError;

/// The shared result every caller for one key awaits.
pub type SharedResult<T> = Shared<BoxFuture<'static, Result<T, GatewayError>>>;

/// Map of in-flight keys to their shared result.
pub struct Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pending: Arc<Mutex<HashMap<String, SharedResult<T>>>>,
}

impl<T> Default for Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T> Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently in flight.
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Run `work` unless the same key is already running, then return the
    /// shared result. Returns `(result, joined)` where `joined` is true
    /// when this caller reused another caller's execution.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> (Result<T, GatewayError>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        let (shared, joined) = self.start_or_join(key, work);
        (shared.await, joined)
    }

    /// Start `work` for `key`, or join the execution already running. The
    /// caller decides how long to wait on the returned future.
    pub fn start_or_join<F, Fut>(&self, key: &str, work: F) -> (SharedResult<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        let (shared, joined) = {
            let mut pending = lock(&self.pending);
            match pending.get(key) {
                Some(existing) => (existing.clone(), true),
                None => {
                    let fut = work();
                    let map = self.pending.clone();
                    let owned_key = key.to_string();
                    let handle = tokio::spawn(async move {
                        let result = fut.await;
                        lock(&map).remove(&owned_key);
                        result
                    });
                    let shared = async move {
                        match handle.await {
                            Ok(result) => result,
                            Err(e) => Err(GatewayError::Internal(format!(
                                "deduplicated work failed: {e}"
                            ))),
                        }
                    }
                    .boxed()
                    .shared();
                    pending.insert(key.to_string(), shared.clone());
                    (shared, false)
                }
            }
        };
        if joined {
            tracing::debug!(key, "Joined in-flight request");
        }
        (shared, joined)
    }
}
