//! gRPC service implementation.
//!
//! ## Structure
//!
//! - [`handler`] - gRPC service entry point (`ParHashService`).

pub mod handler;

pub use handler::ParHashService;
