//! gRPC service and message definitions generated from `proto/`.
//!
//! ## Services
//!
//! - [`parhashsvc::parallel_hash_svc_server::ParallelHashSvc`] - The public
//!   fan-out endpoint.
//! - [`hashsvc::hash_svc_server::HashSvc`] - The endpoint every hashing backend
//!   exposes.
//!
//! All `bytes` fields are generated as [`bytes::Bytes`].

/// Backend-facing hashing protocol.
pub mod hashsvc {
    tonic::include_proto!("hashsvc");
}

/// Public batch hashing protocol.
pub mod parhashsvc {
    tonic::include_proto!("parhashsvc");
}

/// Encoded descriptor set for both protocols, registered with gRPC reflection.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("parhash_descriptor");
