//! Per-batch orchestration of backend sub-calls.
//!
//! A [`Dispatcher`] is created once at startup and shared by every request.
//! For each buffer of a batch, in request order, it claims the next backend
//! from the server-wide [`RoundRobin`] cursor and submits a sub-call to a
//! [`TaskGroup`] opened on the server-wide [`AdmissionPool`]. Each sub-call
//! writes its hash into the slot reserved for its buffer index, so the
//! response order never depends on completion order.
//!
//! A batch fails as a whole: the first sub-call error cancels the remaining
//! sub-calls and is returned to the caller, and no partial results are
//! exposed.

use crate::server::{
    backend::HashBackend,
    dispatch::RoundRobin,
    metrics::MetricsSink,
    pool::{AdmissionPool, TaskGroup},
};
use bytes::Bytes;
use parhash_core::{Error, Result};
use std::{
    sync::{Arc, OnceLock},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

/// Fans batches out to a fixed backend set.
pub struct Dispatcher<B> {
    backends: Arc<B>,
    cursor: RoundRobin,
    pool: AdmissionPool,
    metrics: Arc<dyn MetricsSink>,
}

impl<B: HashBackend> Dispatcher<B> {
    /// Creates a dispatcher over `backends` running at most `concurrency`
    /// sub-calls at once across all batches.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the backend set is empty or
    /// `concurrency` is zero.
    pub fn new(backends: B, concurrency: usize, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        let cursor = RoundRobin::new(backends.len())?;
        let pool = AdmissionPool::new(concurrency)?;

        Ok(Self {
            backends: Arc::new(backends),
            cursor,
            pool,
            metrics,
        })
    }

    /// Hashes every buffer on its round-robin backend and returns the hashes
    /// in buffer order.
    ///
    /// The call counts towards the request metric even when it fails or the
    /// batch is empty. An empty batch makes no backend calls.
    ///
    /// # Errors
    ///
    /// Returns the first sub-call error ([`Error::Backend`] for a failed
    /// backend call), or [`Error::Cancelled`] if `cancel` fired first.
    #[tracing::instrument(level = "debug", skip_all, fields(buffers = buffers.len()))]
    pub async fn dispatch(
        &self,
        buffers: Vec<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Bytes>> {
        self.metrics.record_request();

        if buffers.is_empty() {
            return Ok(Vec::new());
        }

        let slots: Arc<[OnceLock<Bytes>]> = buffers.iter().map(|_| OnceLock::new()).collect();
        let mut group = self.pool.group(cancel);

        for (index, buffer) in buffers.into_iter().enumerate() {
            if self
                .submit(&mut group, index, buffer, Arc::clone(&slots))
                .await
                .is_err()
            {
                tracing::debug!(index, "batch cancelled, not admitting remaining buffers");
                break;
            }
        }

        if let Err(e) = group.join().await {
            tracing::warn!(error = %e, "batch failed");
            return Err(e);
        }

        slots
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.get().cloned().ok_or_else(|| Error::TaskFailed {
                    context: format!("no hash recorded for buffer {index}"),
                })
            })
            .collect()
    }

    /// Admits one buffer, then claims its backend.
    ///
    /// The claim happens inside the job closure, which [`TaskGroup::submit`]
    /// runs only once a permit is granted, so refused buffers never advance
    /// the cursor. Submits are awaited one at a time, so claims still follow
    /// buffer order.
    async fn submit(
        &self,
        group: &mut TaskGroup,
        index: usize,
        buffer: Bytes,
        slots: Arc<[OnceLock<Bytes>]>,
    ) -> Result<()> {
        let backends = Arc::clone(&self.backends);
        let metrics = Arc::clone(&self.metrics);
        let cursor = &self.cursor;

        group
            .submit(move |cancel| {
                let backend = (!cancel.is_cancelled()).then(|| cursor.claim());
                async move {
                    let Some(backend) = backend else {
                        return Err(Error::Cancelled);
                    };
                    let hash = timed_hash(&*backends, &*metrics, backend, buffer, &cancel).await?;
                    // Each index is submitted exactly once, so the slot is empty.
                    let _ = slots[index].set(hash);
                    Ok(())
                }
            })
            .await
    }

    pub fn backends(&self) -> &B {
        &self.backends
    }

    pub fn cursor(&self) -> &RoundRobin {
        &self.cursor
    }

    pub fn pool(&self) -> &AdmissionPool {
        &self.pool
    }
}

/// Calls backend `index` and records the call's latency.
///
/// A call abandoned before it was issued is not sampled.
async fn timed_hash<B: HashBackend>(
    backends: &B,
    metrics: &dyn MetricsSink,
    index: usize,
    buffer: Bytes,
    cancel: &CancellationToken,
) -> Result<Bytes> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let started = Instant::now();
    let result = backends.hash(index, buffer, cancel).await;
    metrics.record_subquery(backends.address(index), started.elapsed());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use parking_lot::Mutex;
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };
    use tokio::time::sleep;
    use tonic::Status;

    type DelayFn = Box<dyn Fn(&[u8]) -> Duration + Send + Sync>;

    /// Backend set whose "hash" is `"<backend>/<buffer>"`, so results reveal
    /// which backend served which buffer.
    struct MockBackends {
        addresses: Vec<String>,
        delay: DelayFn,
        fail_on: Option<&'static [u8]>,
        served: Vec<AtomicUsize>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MockBackends {
        fn new(len: usize) -> Self {
            Self {
                addresses: (0..len).map(|i| format!("10.0.0.{i}:50061")).collect(),
                delay: Box::new(|_| Duration::ZERO),
                fail_on: None,
                served: (0..len).map(|_| AtomicUsize::new(0)).collect(),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: impl Fn(&[u8]) -> Duration + Send + Sync + 'static) -> Self {
            self.delay = Box::new(delay);
            self
        }

        fn failing_on(mut self, buffer: &'static [u8]) -> Self {
            self.fail_on = Some(buffer);
            self
        }

        fn served(&self) -> Vec<usize> {
            self.served
                .iter()
                .map(|n| n.load(Ordering::SeqCst))
                .collect()
        }
    }

    #[tonic::async_trait]
    impl HashBackend for MockBackends {
        fn len(&self) -> usize {
            self.addresses.len()
        }

        fn address(&self, index: usize) -> &str {
            &self.addresses[index]
        }

        async fn hash(
            &self,
            index: usize,
            buffer: Bytes,
            cancel: &CancellationToken,
        ) -> Result<Bytes> {
            self.served[index].fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let delay = (self.delay)(&buffer);
            let cancelled = tokio::select! {
                () = cancel.cancelled() => true,
                () = sleep(delay) => false,
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if cancelled {
                return Err(Error::Cancelled);
            }
            if self.fail_on == Some(buffer.as_ref()) {
                return Err(Error::Backend {
                    backend: self.addresses[index].clone(),
                    status: Status::internal("disk on fire"),
                });
            }
            Ok(Bytes::from(format!(
                "{index}/{}",
                String::from_utf8_lossy(&buffer)
            )))
        }
    }

    #[derive(Default)]
    struct RecordingMetrics {
        requests: AtomicUsize,
        subqueries: Mutex<HashMap<String, usize>>,
    }

    impl RecordingMetrics {
        fn subqueries(&self, backend: &str) -> usize {
            self.subqueries.lock().get(backend).copied().unwrap_or(0)
        }
    }

    impl MetricsSink for RecordingMetrics {
        fn record_request(&self) {
            self.requests.fetch_add(1, Ordering::SeqCst);
        }

        fn record_subquery(&self, backend: &str, _elapsed: Duration) {
            *self
                .subqueries
                .lock()
                .entry(backend.to_string())
                .or_default() += 1;
        }
    }

    fn dispatcher(
        backends: MockBackends,
        concurrency: usize,
    ) -> (Dispatcher<MockBackends>, Arc<RecordingMetrics>) {
        let metrics = Arc::new(RecordingMetrics::default());
        let dispatcher = Dispatcher::new(backends, concurrency, metrics.clone()).unwrap();
        (dispatcher, metrics)
    }

    fn batch(items: &[&'static str]) -> Vec<Bytes> {
        items.iter().map(|s| Bytes::from_static(s.as_bytes())).collect()
    }

    fn assignments(hashes: &[Bytes]) -> Vec<usize> {
        hashes
            .iter()
            .map(|h| {
                let text = core::str::from_utf8(h).unwrap();
                text.split('/').next().unwrap().parse().unwrap()
            })
            .collect()
    }

    #[test]
    fn rejects_empty_backend_set() {
        let metrics = Arc::new(RecordingMetrics::default());
        let result = Dispatcher::new(MockBackends::new(0), 4, metrics);
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let metrics = Arc::new(RecordingMetrics::default());
        let result = Dispatcher::new(MockBackends::new(2), 0, metrics);
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_call_assigns_consecutive_backends() {
        let (dispatcher, _) = dispatcher(MockBackends::new(4), 8);
        let hashes = dispatcher
            .dispatch(batch(&["a", "b", "c"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(hashes, batch(&["0/a", "1/b", "2/c"]));
        assert_eq!(dispatcher.cursor().peek(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wraps_around_within_a_batch() {
        let (dispatcher, _) = dispatcher(MockBackends::new(2), 8);
        let hashes = dispatcher
            .dispatch(batch(&["a", "b", "c", "d", "e"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(assignments(&hashes), [0, 1, 0, 1, 0]);
        assert_eq!(dispatcher.backends().served(), [3, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cursor_persists_across_calls() {
        let (dispatcher, _) = dispatcher(MockBackends::new(2), 8);
        let cancel = CancellationToken::new();

        let first = dispatcher
            .dispatch(batch(&["a", "b", "c"]), &cancel)
            .await
            .unwrap();
        assert_eq!(assignments(&first), [0, 1, 0]);

        let second = dispatcher
            .dispatch(batch(&["d", "e"]), &cancel)
            .await
            .unwrap();
        assert_eq!(assignments(&second), [1, 0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn results_follow_request_order() {
        // Later buffers finish first.
        let backends = MockBackends::new(3).with_delay(|buffer| {
            let n: u64 = core::str::from_utf8(buffer).unwrap().parse().unwrap();
            Duration::from_millis((16 - n) * 2)
        });
        let (dispatcher, _) = dispatcher(backends, 16);

        let buffers: Vec<Bytes> = (0..16).map(|i| Bytes::from(i.to_string())).collect();
        let hashes = dispatcher
            .dispatch(buffers, &CancellationToken::new())
            .await
            .unwrap();

        for (i, hash) in hashes.iter().enumerate() {
            assert_eq!(hash, &Bytes::from(format!("{}/{i}", i % 3)));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrency_limit_holds_across_calls() {
        let backends = MockBackends::new(3).with_delay(|_| Duration::from_millis(5));
        let (dispatcher, _) = dispatcher(backends, 2);
        let dispatcher = Arc::new(dispatcher);

        let calls = (0..6).map(|_| {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .dispatch(batch(&["a", "b", "c", "d", "e"]), &CancellationToken::new())
                    .await
            })
        });

        for result in futures::future::join_all(calls).await {
            assert_eq!(result.unwrap().unwrap().len(), 5);
        }
        assert!(dispatcher.backends().peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(dispatcher.pool().in_use(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_calls_share_one_rotation() {
        let backends = MockBackends::new(3).with_delay(|_| Duration::from_millis(1));
        let (dispatcher, _) = dispatcher(backends, 4);
        let dispatcher = Arc::new(dispatcher);

        let calls = (0..8).map(|_| {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                let buffers: Vec<Bytes> = (0..10).map(|i| Bytes::from(i.to_string())).collect();
                dispatcher.dispatch(buffers, &CancellationToken::new()).await
            })
        });
        for result in futures::future::join_all(calls).await {
            result.unwrap().unwrap();
        }

        // 80 buffers over 3 backends.
        let mut served = dispatcher.backends().served();
        served.sort_unstable();
        assert_eq!(served, [26, 27, 27]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_failure_fails_the_batch_and_server_stays_usable() {
        let backends = MockBackends::new(2)
            .failing_on(b"bad")
            .with_delay(|buffer| {
                if buffer == b"slow" {
                    Duration::from_secs(30)
                } else {
                    Duration::ZERO
                }
            });
        let (dispatcher, metrics) = dispatcher(backends, 4);

        let result = dispatcher
            .dispatch(batch(&["slow", "bad", "ok"]), &CancellationToken::new())
            .await;
        match result {
            Err(Error::Backend { backend, status }) => {
                assert_eq!(backend, "10.0.0.1:50061");
                assert_eq!(status.message(), "disk on fire");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(dispatcher.pool().in_use(), 0);

        let hashes = dispatcher
            .dispatch(batch(&["x", "y"]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(metrics.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_batch_makes_no_backend_calls() {
        let (dispatcher, metrics) = dispatcher(MockBackends::new(2), 2);
        let hashes = dispatcher
            .dispatch(Vec::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(hashes.is_empty());
        assert_eq!(dispatcher.backends().served(), [0, 0]);
        assert_eq!(dispatcher.cursor().peek(), 0);
        assert_eq!(metrics.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn records_requests_and_per_backend_samples() {
        let (dispatcher, metrics) = dispatcher(MockBackends::new(2).failing_on(b"bad"), 4);
        let cancel = CancellationToken::new();

        dispatcher.dispatch(batch(&["a", "b"]), &cancel).await.unwrap();
        dispatcher
            .dispatch(batch(&["c", "d", "e"]), &cancel)
            .await
            .unwrap();
        dispatcher.dispatch(batch(&["f"]), &cancel).await.unwrap();
        assert_eq!(metrics.requests.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.subqueries("10.0.0.0:50061"), 3);
        assert_eq!(metrics.subqueries("10.0.0.1:50061"), 3);

        // A failed sub-call still produces a sample.
        assert!(dispatcher.dispatch(batch(&["bad"]), &cancel).await.is_err());
        assert_eq!(metrics.requests.load(Ordering::SeqCst), 4);
        assert_eq!(metrics.subqueries("10.0.0.0:50061"), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn caller_cancellation_stops_the_batch() {
        let backends = MockBackends::new(2).with_delay(|_| Duration::from_secs(30));
        let (dispatcher, _) = dispatcher(backends, 1);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.dispatch(batch(&["a", "b", "c"]), &cancel),
        )
        .await
        .expect("cancellation must end the batch promptly");

        assert!(matches!(result, Err(Error::Cancelled)));
        // Only the first buffer was admitted under a limit of one.
        assert_eq!(dispatcher.backends().served(), [1, 0]);
        assert_eq!(dispatcher.cursor().peek(), 1);
        assert_eq!(dispatcher.pool().in_use(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn refused_buffers_do_not_consume_backend_turns() {
        let (dispatcher, _) = dispatcher(MockBackends::new(2).failing_on(b"bad"), 1);
        let cancel = CancellationToken::new();

        for _ in 0..10 {
            let result = dispatcher.dispatch(batch(&["bad", "x"]), &cancel).await;
            assert!(matches!(result, Err(Error::Backend { .. })));
        }

        // "x" waits for the only permit and is refused once "bad" fails, so
        // the failing buffers alone drive the rotation.
        assert_eq!(dispatcher.backends().served(), [5, 5]);
        assert_eq!(dispatcher.cursor().peek(), 0);
    }

    #[tokio::test]
    async fn cancelled_call_leaves_the_cursor_alone() {
        let (dispatcher, metrics) = dispatcher(MockBackends::new(3), 4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = dispatcher.dispatch(batch(&["a", "b"]), &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(dispatcher.cursor().peek(), 0);
        assert_eq!(dispatcher.backends().served(), [0, 0, 0]);
        assert_eq!(metrics.requests.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.subqueries("10.0.0.0:50061"), 0);
    }

    #[tokio::test]
    async fn abandoned_call_is_not_sampled() {
        let backends = MockBackends::new(1);
        let metrics = RecordingMetrics::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = timed_hash(&backends, &metrics, 0, Bytes::from_static(b"a"), &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(backends.served(), [0]);
        assert_eq!(metrics.subqueries("10.0.0.0:50061"), 0);
    }
}
