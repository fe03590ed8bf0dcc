//! Hashing backends.
//!
//! - [`client`] - The [`HashBackend`](client::HashBackend) trait the dispatcher
//!   calls, and [`GrpcBackends`](client::GrpcBackends), its implementation over
//!   tonic channels.
//! - [`sha256`] - [`Sha256HashService`](sha256::Sha256HashService), a reference
//!   `HashSvc` backend.

pub mod client;
pub mod sha256;

pub use client::{GrpcBackends, HashBackend};
pub use sha256::Sha256HashService;
