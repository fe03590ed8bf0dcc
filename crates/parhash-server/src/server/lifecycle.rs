//! Serving and shutdown of the gRPC endpoints.
//!
//! Both binaries serve over an arbitrary incoming connection stream so tests
//! can bind ephemeral listeners, and both stop when a caller-supplied future
//! resolves. [`shutdown_signal`] is the future the binaries use.

use crate::server::{
    backend::{HashBackend, Sha256HashService},
    service::ParHashService,
};
use core::future::Future;
use futures::Stream;
use parhash_core::proto::{
    FILE_DESCRIPTOR_SET, hashsvc::hash_svc_server::HashSvcServer,
    parhashsvc::parallel_hash_svc_server::ParallelHashSvcServer,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::signal;
use tonic::transport::server::Connected;
use tonic::{codec::CompressionEncoding, transport::Server};
use tonic_reflection::server::Builder;

/// Wraps `service` in its generated server with zstd, gzip and deflate
/// enabled in both directions.
pub fn build_parhash_service<B: HashBackend>(
    service: ParHashService<B>,
) -> ParallelHashSvcServer<ParHashService<B>> {
    ParallelHashSvcServer::new(service)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Deflate)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Deflate)
}

/// Serves `ParallelHashSvc`, health and reflection on `incoming` until
/// `signal` resolves.
///
/// On shutdown the health status flips to `NOT_SERVING` first, then
/// [`ParHashService::shutdown`] drains and cancels in-flight requests.
pub async fn run_with_incoming<B, I, IO, IE, S>(
    service: ParHashService<B>,
    incoming: I,
    signal: S,
) -> anyhow::Result<()>
where
    B: HashBackend,
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
    S: Future<Output = ()>,
{
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<ParallelHashSvcServer<ParHashService<B>>>()
        .await;

    let reflection = Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let draining = service.clone();
    let shutdown = async move {
        signal.await;
        tracing::info!("Shutdown signal received, terminating gracefully...");

        // 1. Publish the status
        health_reporter
            .set_not_serving::<ParallelHashSvcServer<ParHashService<B>>>()
            .await;

        // 2. Drain, then cancel, in-flight requests
        draining.shutdown().await;
    };

    Server::builder()
        .http2_adaptive_window(Some(true))
        .add_service(health_service)
        .add_service(reflection)
        .add_service(build_parhash_service(service))
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await?;

    tracing::info!("Service shut down successfully");
    Ok(())
}

/// Serves the reference SHA-256 `HashSvc` and health on `incoming` until
/// `signal` resolves.
pub async fn run_backend_with_incoming<I, IO, IE, S>(
    incoming: I,
    signal: S,
) -> anyhow::Result<()>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
    S: Future<Output = ()>,
{
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<HashSvcServer<Sha256HashService>>()
        .await;

    let hash_service = HashSvcServer::new(Sha256HashService)
        .send_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Zstd);

    let shutdown = async move {
        signal.await;
        health_reporter
            .set_not_serving::<HashSvcServer<Sha256HashService>>()
            .await;
    };

    Server::builder()
        .http2_adaptive_window(Some(true))
        .add_service(health_service)
        .add_service(hash_service)
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await?;

    tracing::info!("Backend shut down successfully");
    Ok(())
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
///
/// A handler that cannot be installed is logged and never fires, leaving the
/// other one in charge.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                core::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = core::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            core::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
