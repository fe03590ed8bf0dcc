//! Server side of the fan-out hashing service.
//!
//! - [`config`] - CLI and environment configuration.
//! - [`backend`] - The backend set the dispatcher calls, and the reference
//!   SHA-256 backend.
//! - [`pool`] - The server-wide concurrency cap and per-batch task groups.
//! - [`dispatch`] - Round-robin assignment and ordered reassembly of batches.
//! - [`metrics`] - Request and sub-call instruments.
//! - [`service`] - The `ParallelHashSvc` handler and its shutdown protocol.
//! - [`lifecycle`] - Serving the gRPC endpoints until a shutdown signal.
//! - [`telemetry`] - Logging and optional OpenTelemetry export.

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod service;
pub mod telemetry;
