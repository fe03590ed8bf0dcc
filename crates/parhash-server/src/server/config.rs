use clap::Parser;
use core::time::Duration;
use parhash_core::Error;
use std::net::SocketAddr;

/// Runtime configuration for the `parhash-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a `.env`
/// file is loaded first, if present) and validated into a [`ServerConfig`].
#[derive(Parser, Debug, Clone)]
#[command(
    name = "parhash-server",
    version,
    about = "A gRPC service that fans batches of buffers out to hashing backends"
)]
pub struct CliArgs {
    /// Address the `ParallelHashSvc` endpoint listens on.
    ///
    /// Environment variable: `LISTEN_ADDR`
    #[arg(long, env = "LISTEN_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub listen_addr: String,

    /// Ordered, comma separated list of hashing backend addresses.
    ///
    /// Buffers are assigned to backends in this order, round-robin. Addresses
    /// without a scheme are dialed over plain HTTP/2, e.g. `10.0.0.7:50061`.
    ///
    /// Environment variable: `BACKEND_ADDRS`
    #[arg(long, env = "BACKEND_ADDRS", value_delimiter = ',', num_args = 1..)]
    pub backends: Vec<String>,

    /// Maximum number of backend calls in flight across all requests.
    ///
    /// Environment variable: `CONCURRENCY`
    #[arg(long, env = "CONCURRENCY", default_value_t = 16)]
    pub concurrency: usize,

    /// Seconds to wait for each backend connection at startup.
    ///
    /// Environment variable: `CONNECT_TIMEOUT_SECS`
    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    pub connect_timeout_secs: u64,

    /// Seconds to let in-flight requests drain on shutdown before they are
    /// cancelled.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 3)]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub backends: Vec<String>,
    pub concurrency: usize,
    pub connect_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let listen_addr = args.listen_addr.parse::<SocketAddr>().map_err(|e| {
            Error::invalid_config(format!(
                "LISTEN_ADDR {:?} is not a socket address: {e}",
                args.listen_addr
            ))
        })?;

        let backends: Vec<String> = args
            .backends
            .into_iter()
            .map(|addr| addr.trim().to_string())
            .filter(|addr| !addr.is_empty())
            .collect();
        if backends.is_empty() {
            return Err(Error::invalid_config(
                "BACKEND_ADDRS must name at least one backend",
            ));
        }

        if args.concurrency == 0 {
            return Err(Error::invalid_config("CONCURRENCY must be greater than 0"));
        }

        if args.connect_timeout_secs == 0 {
            return Err(Error::invalid_config(
                "CONNECT_TIMEOUT_SECS must be greater than 0",
            ));
        }

        Ok(Self {
            listen_addr,
            backends,
            concurrency: args.concurrency,
            connect_timeout: Duration::from_secs(args.connect_timeout_secs),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        })
    }
}
