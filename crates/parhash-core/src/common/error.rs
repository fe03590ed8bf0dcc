//! Error types for the fan-out hashing service.
//!
//! This module defines the central `Error` enum, which captures every failure
//! the dispatcher can report, from startup validation to individual backend
//! calls. It implements `From<Error>` for `tonic::Status` so a failed batch
//! reaches the client as a single status with an appropriate code.
//!
//! ## Error Cases
//! - `InvalidConfig`: The server was configured with values it cannot run
//!   with (no backends, zero concurrency, unparsable addresses).
//! - `Connectivity`: A channel to a configured backend could not be
//!   established.
//! - `Backend`: A backend call returned an error status.
//! - `Cancelled`: The batch or one of its sub-calls was cancelled.
//! - `TaskFailed`: A sub-task terminated without producing its result.
//! - `ServiceShutdown`: A request arrived while the service was shutting down.

use tonic::{Code, Status};

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the fan-out hashing service.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configuration cannot be used to start the service.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// No channel could be established to a backend.
    #[error("Cannot connect to backend {backend}: {reason}")]
    Connectivity { backend: String, reason: String },

    /// The backend answered a sub-call with an error status.
    #[error("Backend {backend} failed: {}", .status.message())]
    Backend {
        backend: String,
        #[source]
        status: Status,
    },

    /// The batch was cancelled before all of its sub-calls completed.
    #[error("Request cancelled")]
    Cancelled,

    /// A sub-task ended abnormally.
    #[error("Task failed: {context}")]
    TaskFailed { context: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// Shorthand for [`Error::InvalidConfig`].
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidConfig { reason } => Status::failed_precondition(reason),
            Error::Connectivity { backend, reason } => {
                Status::unavailable(format!("Backend {backend} unreachable: {reason}"))
            }
            Error::Backend { backend, status } => {
                // Keep the backend's code, but never report a failure as `Ok`.
                let code = match status.code() {
                    Code::Ok => Code::Unknown,
                    code => code,
                };
                Status::new(code, format!("Backend {backend}: {}", status.message()))
            }
            Error::Cancelled => Status::cancelled("Request was cancelled"),
            Error::TaskFailed { context } => Status::internal(format!("Task failed: {context}")),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}
