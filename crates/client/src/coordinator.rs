//! Deduplication of concurrent idempotent requests.
//!
//! [`RequestCoordinator`] keeps a registry of in-flight operations keyed by
//! logical identity ([`RequestKey`]). Depending on the [`DedupePolicy`], a
//! new submission either joins the call already running under the same
//! key or cancels it and starts over.
//!
//! Each operation runs on its own task, so it makes progress and completes
//! (removing its registry entry) whether or not anyone is still awaiting
//! the result. Dropping a [`ResultHandle`] never cancels a shared call;
//! only supersession by a `CancelPrevious` submission does.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, NetworkFailure};

/// Outcome shared by every caller of one deduplicated request.
pub type SharedResult = Result<Arc<serde_json::Value>, ClientError>;

/// Cloneable future resolving to the [`SharedResult`] of a request.
pub type ResultHandle = Shared<BoxFuture<'static, SharedResult>>;

/// How a submission interacts with a call already in flight for its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupePolicy {
    /// Join the in-flight call; no new network call is made.
    Share,
    /// Cancel the in-flight call and start a new one under the same key.
    CancelPrevious,
}

/// Logical identity of a request: operation kind plus path and query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn new(kind: &str, target: &str) -> Self {
        Self(format!("{kind} {target}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry entry for one running operation.
struct InFlightRequest {
    id: u64,
    cancel: CancellationToken,
    result: ResultHandle,
}

#[derive(Default)]
struct Registry {
    inflight: Mutex<HashMap<RequestKey, InFlightRequest>>,
    next_id: AtomicU64,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<RequestKey, InFlightRequest>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the entry for `key` only if it still belongs to request `id`.
    fn finish(&self, key: &RequestKey, id: u64) {
        let mut inflight = self.lock();
        if inflight.get(key).is_some_and(|entry| entry.id == id) {
            inflight.remove(key);
        }
    }
}

/// Session-scoped registry of in-flight requests.
///
/// Cheap to clone; clones share the same registry. Must be used from
/// within a Tokio runtime.
#[derive(Clone, Default)]
pub struct RequestCoordinator {
    registry: Arc<Registry>,
}

impl RequestCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit `operation` under `key`.
    ///
    /// `operation` is only invoked when a new call is actually started.
    /// The registry is updated without any intervening suspension point.
    pub fn submit<F, Fut>(&self, key: RequestKey, policy: DedupePolicy, operation: F) -> ResultHandle
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, ClientError>> + Send + 'static,
    {
        let mut inflight = self.registry.lock();

        if let Some(existing) = inflight.get(&key) {
            match policy {
                DedupePolicy::Share => {
                    tracing::trace!(key = %key, "Joining in-flight request");
                    return existing.result.clone();
                }
                DedupePolicy::CancelPrevious => {
                    tracing::debug!(key = %key, "Cancelling superseded request");
                    existing.cancel.cancel();
                    inflight.remove(&key);
                }
            }
        }

        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let call = operation();

        let registry = Arc::clone(&self.registry);
        let task_key = key.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = task_cancel.cancelled() => Err(NetworkFailure::Cancelled.into()),
                result = call => result.map(Arc::new),
            };
            registry.finish(&task_key, id);
            outcome
        });

        let result = async move {
            task.await.unwrap_or_else(|e| {
                Err(NetworkFailure::Transport(format!("request task failed: {e}")).into())
            })
        }
        .boxed()
        .shared();

        inflight.insert(
            key,
            InFlightRequest {
                id,
                cancel,
                result: result.clone(),
            },
        );
        result
    }

    /// Number of requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.registry.lock().len()
    }

    /// Whether a request is in flight under `key`.
    pub fn is_in_flight(&self, key: &RequestKey) -> bool {
        self.registry.lock().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;
    use tokio::sync::oneshot;

    use super::*;

    fn key() -> RequestKey {
        RequestKey::new("GET", "/api/indexing/jobs/latest")
    }

    /// Sets a flag when dropped, so tests can see that a call was aborted.
    struct DropFlag(Arc<AtomicUsize>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn share_runs_operation_once() {
        let coordinator = RequestCoordinator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<()>();

        let c = Arc::clone(&calls);
        let first = coordinator.submit(key(), DedupePolicy::Share, move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            let _ = rx.await;
            Ok(serde_json::json!({"id": 42}))
        });
        let c = Arc::clone(&calls);
        let second = coordinator.submit(key(), DedupePolicy::Share, move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({"id": 7}))
        });

        tx.send(()).unwrap();
        let (a, b) = tokio::join!(first, second);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn sharers_observe_the_same_failure() {
        let coordinator = RequestCoordinator::new();
        let (tx, rx) = oneshot::channel::<()>();

        let first = coordinator.submit(key(), DedupePolicy::Share, move || async move {
            let _ = rx.await;
            Err(ClientError::HttpStatus {
                status: 503,
                body: "busy".into(),
            })
        });
        let second = coordinator.submit(key(), DedupePolicy::Share, || async {
            Ok(serde_json::Value::Null)
        });

        tx.send(()).unwrap();
        let (a, b) = tokio::join!(first, second);

        assert_matches!(a, Err(ClientError::HttpStatus { status: 503, .. }));
        assert_eq!(a.unwrap_err(), b.unwrap_err());
    }

    #[tokio::test]
    async fn cancel_previous_aborts_pending_call_once() {
        let coordinator = RequestCoordinator::new();
        let dropped = Arc::new(AtomicUsize::new(0));

        let flag = DropFlag(Arc::clone(&dropped));
        let first = coordinator.submit(key(), DedupePolicy::CancelPrevious, move || async move {
            let _flag = flag;
            std::future::pending::<()>().await;
            Ok(serde_json::json!("stale"))
        });
        let second = coordinator.submit(key(), DedupePolicy::CancelPrevious, || async {
            Ok(serde_json::json!("fresh"))
        });

        let stale = first.await;
        assert_matches!(stale, Err(e) if e.is_cancelled());
        assert_eq!(*second.await.unwrap(), serde_json::json!("fresh"));

        tokio::task::yield_now().await;
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_call_does_not_evict_its_successor() {
        let coordinator = RequestCoordinator::new();
        let (tx, rx) = oneshot::channel::<()>();

        let first = coordinator.submit(key(), DedupePolicy::CancelPrevious, || async {
            std::future::pending::<()>().await;
            Ok(serde_json::Value::Null)
        });
        let second = coordinator.submit(key(), DedupePolicy::CancelPrevious, move || async move {
            let _ = rx.await;
            Ok(serde_json::json!(2))
        });

        assert!(first.await.is_err());
        assert!(coordinator.is_in_flight(&key()));

        tx.send(()).unwrap();
        second.await.unwrap();
        assert!(!coordinator.is_in_flight(&key()));
    }

    #[tokio::test]
    async fn completed_key_starts_fresh() {
        let coordinator = RequestCoordinator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let c = Arc::clone(&calls);
            coordinator
                .submit(key(), DedupePolicy::Share, move || async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropping_a_sharer_does_not_cancel_the_call() {
        let coordinator = RequestCoordinator::new();
        let (tx, rx) = oneshot::channel::<()>();

        let abandoned = coordinator.submit(key(), DedupePolicy::Share, move || async move {
            let _ = rx.await;
            Ok(serde_json::json!("done"))
        });
        drop(abandoned);

        let joined = coordinator.submit(key(), DedupePolicy::Share, || async {
            Ok(serde_json::json!("second call"))
        });
        tx.send(()).unwrap();

        assert_eq!(*joined.await.unwrap(), serde_json::json!("done"));
    }

    #[tokio::test]
    async fn distinct_keys_do_not_interact() {
        let coordinator = RequestCoordinator::new();
        let a = coordinator.submit(
            RequestKey::new("GET", "/api/indexing/jobs/1"),
            DedupePolicy::Share,
            || async { Ok(serde_json::json!(1)) },
        );
        let b = coordinator.submit(
            RequestKey::new("GET", "/api/indexing/jobs/2"),
            DedupePolicy::Share,
            || async { Ok(serde_json::json!(2)) },
        );

        assert_eq!(*a.await.unwrap(), serde_json::json!(1));
        assert_eq!(*b.await.unwrap(), serde_json::json!(2));
    }
}
