//! End-to-end: a `parhash-server` in front of real gRPC backends.

use bytes::Bytes;
use core::time::Duration;
use parhash_core::proto::{
    hashsvc::{HashReq, HashResp, hash_svc_server::HashSvc, hash_svc_server::HashSvcServer},
    parhashsvc::{ParHashReq, parallel_hash_svc_client::ParallelHashSvcClient},
};
use parhash_server::server::{
    backend::GrpcBackends,
    dispatch::Dispatcher,
    lifecycle::{run_backend_with_incoming, run_with_incoming},
    metrics::OtelMetrics,
    service::ParHashService,
};
use sha2::{Digest, Sha256};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Code, Request, Response, Status, transport::Channel};

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn spawn_sha256_backend() -> SocketAddr {
    let (listener, addr) = bind().await;
    tokio::spawn(run_backend_with_incoming(
        TcpListenerStream::new(listener),
        core::future::pending(),
    ));
    addr
}

/// Fails every buffer equal to `b"bad"`, hashes the rest.
struct FlakyBackend;

#[tonic::async_trait]
impl HashSvc for FlakyBackend {
    async fn hash(&self, req: Request<HashReq>) -> Result<Response<HashResp>, Status> {
        let data = req.into_inner().data;
        if data.as_ref() == b"bad" {
            return Err(Status::internal("refusing to hash"));
        }
        Ok(Response::new(HashResp {
            hash: Bytes::copy_from_slice(&Sha256::digest(&data)),
        }))
    }
}

async fn spawn_flaky_backend() -> SocketAddr {
    let (listener, addr) = bind().await;
    tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(HashSvcServer::new(FlakyBackend))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );
    addr
}

struct Harness {
    client: ParallelHashSvcClient<Channel>,
    stop: oneshot::Sender<()>,
    server: JoinHandle<anyhow::Result<()>>,
}

async fn spawn_server(backends: &[SocketAddr], concurrency: usize) -> Harness {
    let addresses: Vec<String> = backends.iter().map(ToString::to_string).collect();
    let backends = GrpcBackends::connect(&addresses, Duration::from_secs(5))
        .await
        .unwrap();
    let dispatcher =
        Dispatcher::new(backends, concurrency, Arc::new(OtelMetrics::global())).unwrap();
    let service = ParHashService::new(dispatcher, Duration::from_secs(1));

    let (listener, addr) = bind().await;
    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(run_with_incoming(
        service,
        TcpListenerStream::new(listener),
        async move {
            let _ = stopped.await;
        },
    ));

    let client = ParallelHashSvcClient::connect(format!("http://{addr}"))
        .await
        .unwrap();
    Harness {
        client,
        stop,
        server,
    }
}

fn batch(items: &[&'static str]) -> ParHashReq {
    ParHashReq {
        data: items.iter().map(|s| Bytes::from_static(s.as_bytes())).collect(),
    }
}

fn sha256(data: &str) -> Bytes {
    Bytes::copy_from_slice(&Sha256::digest(data.as_bytes()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hashes_batches_in_request_order() {
    let backends = [spawn_sha256_backend().await, spawn_sha256_backend().await];
    let mut harness = spawn_server(&backends, 4).await;

    let items = ["alpha", "beta", "gamma", "delta", "epsilon"];
    let resp = harness
        .client
        .parallel_hash(batch(&items))
        .await
        .unwrap()
        .into_inner();

    let expected: Vec<Bytes> = items.iter().map(|s| sha256(s)).collect();
    assert_eq!(resp.hashes, expected);

    harness.stop.send(()).unwrap();
    harness.server.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_batch_returns_no_hashes() {
    let backends = [spawn_sha256_backend().await];
    let mut harness = spawn_server(&backends, 1).await;

    let resp = harness
        .client
        .parallel_hash(batch(&[]))
        .await
        .unwrap()
        .into_inner();
    assert!(resp.hashes.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backend_failure_fails_the_batch_and_server_keeps_serving() {
    let backends = [spawn_flaky_backend().await, spawn_sha256_backend().await];
    let mut harness = spawn_server(&backends, 2).await;

    let status = harness
        .client
        .parallel_hash(batch(&["bad", "ok", "fine"]))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains("refusing to hash"));

    let resp = harness
        .client
        .parallel_hash(batch(&["one", "two", "three"]))
        .await
        .unwrap()
        .into_inner();
    let expected: Vec<Bytes> = ["one", "two", "three"].iter().map(|s| sha256(s)).collect();
    assert_eq!(resp.hashes, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_backend_aborts_startup() {
    let (listener, addr) = bind().await;
    drop(listener);

    let result = GrpcBackends::connect(&[addr.to_string()], Duration::from_millis(500)).await;
    assert!(matches!(
        result,
        Err(parhash_core::Error::Connectivity { .. })
    ));
}
