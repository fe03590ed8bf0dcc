//! Types shared by the dispatcher, its backends and their clients.
//!
//! - [`error`] - The service-wide [`Error`](error::Error) type and its mapping
//!   onto `tonic::Status`.
//! - [`proto`] - Generated Protobuf messages, clients and servers.

pub mod error;
pub mod proto;

pub use error::{Error, Result};
