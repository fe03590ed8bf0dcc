//! gRPC service implementation for batch hashing.
//!
//! This module defines [`ParHashService`], the implementation of the
//! [`ParallelHashSvc`] gRPC service. Each call hands its buffers to the shared
//! [`Dispatcher`] and returns the hashes in request order, or a single error
//! status if any backend call failed.
//!
//! ## Responsibilities
//!
//! - Derive a per-request cancellation token from the service-wide shutdown
//!   token. The token is cancelled when the handler future is dropped, which
//!   tonic does when the client disconnects or its deadline expires, so every
//!   outstanding backend call for that request is abandoned.
//! - Track in-flight requests and refuse new ones during shutdown.
//! - Drain, then cancel, in-flight requests on shutdown.

use crate::server::{backend::HashBackend, dispatch::Dispatcher};
use core::time::Duration;
use parhash_core::{
    Error,
    proto::parhashsvc::{ParHashReq, ParHashResp, parallel_hash_svc_server::ParallelHashSvc},
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

/// Interval at which shutdown re-checks the in-flight count.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The `ParallelHashSvc` endpoint.
///
/// Cheap to clone; clones share the dispatcher and shutdown state.
pub struct ParHashService<B> {
    dispatcher: Arc<Dispatcher<B>>,
    state: Arc<ServiceState>,
    shutdown_timeout: Duration,
}

impl<B> Clone for ParHashService<B> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            state: Arc::clone(&self.state),
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

#[derive(Default)]
struct ServiceState {
    shutdown_token: CancellationToken,
    shutting_down: AtomicBool,
    inflight: AtomicUsize,
}

/// Decrements the in-flight count when a request finishes.
struct InflightGuard<'a>(&'a ServiceState);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ServiceState {
    fn enter(&self) -> InflightGuard<'_> {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        InflightGuard(self)
    }
}

impl<B: HashBackend> ParHashService<B> {
    /// Wraps `dispatcher` into a service. On shutdown, in-flight requests get
    /// `shutdown_timeout` to finish before they are cancelled.
    pub fn new(dispatcher: Dispatcher<B>, shutdown_timeout: Duration) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            state: Arc::new(ServiceState::default()),
            shutdown_timeout,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<B> {
        &self.dispatcher
    }

    /// Number of requests currently being served.
    pub fn inflight(&self) -> usize {
        self.state.inflight.load(Ordering::Acquire)
    }

    /// Stops accepting requests, waits up to the shutdown timeout for
    /// in-flight requests, then cancels whatever is left.
    pub async fn shutdown(&self) {
        // === Phase 0: Stop accepting new requests ===
        tracing::info!("Refusing new requests");
        self.state.shutting_down.store(true, Ordering::Release);

        // === Phase 1: Wait for in-flight requests to drain ===
        tracing::info!("Draining in-flight requests ({} active)", self.inflight());
        let drained = timeout(self.shutdown_timeout, async {
            while self.inflight() > 0 {
                sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;

        match drained {
            Ok(()) => tracing::debug!("All in-flight requests drained"),
            Err(_) => tracing::warn!(
                "Graceful drain timed out ({} requests still active)",
                self.inflight()
            ),
        }

        // === Phase 2: Cancel any remaining work ===
        tracing::debug!("Cancelling remaining work via shutdown token");
        self.state.shutdown_token.cancel();
    }
}

#[tonic::async_trait]
impl<B: HashBackend> ParallelHashSvc for ParHashService<B> {
    /// Hashes a batch of buffers across the backends.
    ///
    /// Returns `UNAVAILABLE` during shutdown and the status of the first
    /// failed backend call if the batch fails.
    #[tracing::instrument(skip_all, fields(buffers = req.get_ref().data.len()))]
    async fn parallel_hash(
        &self,
        req: Request<ParHashReq>,
    ) -> Result<Response<ParHashResp>, Status> {
        let _inflight = self.state.enter();
        if self.state.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ServiceShutdown.into());
        }

        let cancel = self.state.shutdown_token.child_token();
        let _cancel_on_drop = cancel.clone().drop_guard();

        let hashes = self
            .dispatcher
            .dispatch(req.into_inner().data, &cancel)
            .await?;

        Ok(Response::new(ParHashResp { hashes }))
    }
}
