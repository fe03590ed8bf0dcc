//! Reference hashing backend: serves `HashSvc`, answering each call with the
//! SHA-256 digest of the buffer.

use clap::Parser;
use parhash_server::server::{
    lifecycle::{run_backend_with_incoming, shutdown_signal},
    telemetry::init_telemetry,
};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "parhash-backend", version, about = "SHA-256 hashing backend")]
struct BackendArgs {
    /// Address the `HashSvc` endpoint listens on.
    ///
    /// Environment variable: `LISTEN_ADDR`
    #[arg(long, env = "LISTEN_ADDR", default_value_t = String::from("0.0.0.0:50061"))]
    listen_addr: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = BackendArgs::parse();

    let providers = init_telemetry("parhash-backend")?;

    let tcp = TcpListener::bind(&args.listen_addr).await?;
    tracing::info!("Starting SHA-256 backend on {}", args.listen_addr);

    let res = run_backend_with_incoming(TcpListenerStream::new(tcp), shutdown_signal()).await;
    providers.shutdown();
    res
}
