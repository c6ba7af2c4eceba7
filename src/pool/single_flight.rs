//! Keyed single-flight: at most one in-flight operation per key, with every
//! concurrent caller awaiting the same shared result. Entries remove
//! themselves on completion (success or failure), so a failed operation can
//! be retried by the next caller instead of wedging the key.

use std::future::Future;
use std::sync::{Arc, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

type SharedResult<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

pub struct SingleFlight<T, E> {
    inflight: Mutex<FxHashMap<usize, SharedResult<T, E>>>,
}

impl<T, E> SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inflight: Mutex::new(FxHashMap::default()),
        })
    }

    /// Join the in-flight operation for `key`, or install `make()` as the new
    /// one. The returned future is shared: all callers observe the same
    /// result, and the map entry is removed when the operation completes.
    pub fn run<F, Fut>(self: &Arc<Self>, key: usize, make: F) -> SharedResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut inflight = self.inflight.lock();
        if let Some(existing) = inflight.get(&key) {
            return existing.clone();
        }

        let registry: Weak<Self> = Arc::downgrade(self);
        let fut = make();
        let shared = async move {
            let result = fut.await;
            if let Some(registry) = registry.upgrade() {
                registry.inflight.lock().remove(&key);
            }
            result
        }
        .boxed()
        .shared();
        inflight.insert(key, shared.clone());
        shared
    }

    /// Number of keys currently in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inflight.lock().is_empty()
    }

    /// Drop all registrations. In-flight shared futures keep running for
    /// their awaiters; their self-removal becomes a no-op.
    pub fn clear(&self) {
        self.inflight.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flight: Arc<SingleFlight<u32, String>> = SingleFlight::new();
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let calls = Arc::clone(&calls);
            let fut = flight.run(1, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<u32, String>(42)
            });
            handles.push(tokio::spawn(fut));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(flight.is_empty());
    }

    #[tokio::test]
    async fn failure_clears_entry_for_retry() {
        let flight: Arc<SingleFlight<u32, String>> = SingleFlight::new();
        let calls = Arc::new(AtomicU32::new(0));

        let first_calls = Arc::clone(&calls);
        let first = flight
            .run(7, move || async move {
                first_calls.fetch_add(1, Ordering::SeqCst);
                Err::<u32, String>("boom".to_string())
            })
            .await;
        assert!(first.is_err());
        assert!(flight.is_empty());

        let second_calls = Arc::clone(&calls);
        let second = flight
            .run(7, move || async move {
                second_calls.fetch_add(1, Ordering::SeqCst);
                Ok::<u32, String>(9)
            })
            .await;
        assert_eq!(second, Ok(9));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let flight: Arc<SingleFlight<u32, String>> = SingleFlight::new();
        let a = flight.run(1, || async { Ok::<u32, String>(1) });
        let b = flight.run(2, || async { Ok::<u32, String>(2) });
        assert_eq!(a.await, Ok(1));
        assert_eq!(b.await, Ok(2));
    }
}
