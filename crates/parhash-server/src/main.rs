use clap::Parser;
use parhash_server::server::{
    backend::GrpcBackends,
    config::{CliArgs, ServerConfig},
    dispatch::Dispatcher,
    lifecycle::{run_with_incoming, shutdown_signal},
    metrics::OtelMetrics,
    service::ParHashService,
    telemetry::init_telemetry,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry("parhash-server")?;

    let backends = GrpcBackends::connect(&config.backends, config.connect_timeout).await?;
    tracing::info!("Connected to {} backends", config.backends.len());

    let dispatcher = Dispatcher::new(
        backends,
        config.concurrency,
        Arc::new(OtelMetrics::global()),
    )?;
    let service = ParHashService::new(dispatcher, config.shutdown_timeout);

    let tcp = TcpListener::bind(config.listen_addr).await?;
    log_startup_info(&config);

    let res = run_with_incoming(service, TcpListenerStream::new(tcp), shutdown_signal()).await;
    providers.shutdown();
    res
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting parhash service on {} with full config: {:#?}",
            config.listen_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting parhash service on {} with {} backends and concurrency {}",
            config.listen_addr,
            config.backends.len(),
            config.concurrency
        );
    }
}
