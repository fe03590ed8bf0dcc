//! The backend set the dispatcher fans out to.
//!
//! [`HashBackend`] is the boundary between dispatch logic and transport: an
//! ordered, fixed set of backends addressed by ordinal, each able to hash one
//! buffer at a time. [`GrpcBackends`] implements it with one tonic
//! [`Channel`] per configured address.
//!
//! ## Connection policy
//!
//! Channels are established eagerly by [`GrpcBackends::connect`] before the
//! server starts listening, and a backend that cannot be reached aborts
//! startup with [`Error::Connectivity`]. Afterwards tonic reconnects channels
//! on its own; a transport failure during a call surfaces as
//! [`Error::Backend`] for that call only.

use bytes::Bytes;
use core::time::Duration;
use parhash_core::{
    Error, Result,
    proto::hashsvc::{HashReq, hash_svc_client::HashSvcClient},
};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};

/// A fixed, ordered set of hashing backends.
#[tonic::async_trait]
pub trait HashBackend: Send + Sync + 'static {
    /// Number of backends in the set.
    fn len(&self) -> usize;

    /// Configured address of backend `index`, used to label measurements.
    fn address(&self, index: usize) -> &str;

    /// Hashes `buffer` on backend `index`.
    ///
    /// Returns [`Error::Cancelled`] as soon as `cancel` fires, without waiting
    /// for the backend.
    async fn hash(&self, index: usize, buffer: Bytes, cancel: &CancellationToken)
    -> Result<Bytes>;
}

struct Backend {
    address: String,
    client: HashSvcClient<Channel>,
}

/// [`HashBackend`] over tonic `HashSvc` clients.
pub struct GrpcBackends {
    backends: Vec<Backend>,
}

impl GrpcBackends {
    /// Connects to every address, in order, failing if any is unreachable.
    ///
    /// Addresses without a scheme are dialed over plain `http://`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if `addresses` is empty or an address is not
    ///   a valid URI.
    /// - [`Error::Connectivity`] if a backend cannot be reached within
    ///   `connect_timeout`.
    pub async fn connect(addresses: &[String], connect_timeout: Duration) -> Result<Self> {
        if addresses.is_empty() {
            return Err(Error::invalid_config("at least one backend is required"));
        }

        let connects = addresses
            .iter()
            .map(|address| connect_backend(address, connect_timeout));
        let backends = futures::future::try_join_all(connects).await?;

        Ok(Self { backends })
    }
}

async fn connect_backend(address: &str, connect_timeout: Duration) -> Result<Backend> {
    let uri = endpoint_uri(address);
    let endpoint = Endpoint::from_shared(uri)
        .map_err(|e| Error::invalid_config(format!("invalid backend address {address}: {e}")))?
        .connect_timeout(connect_timeout);

    let channel = endpoint.connect().await.map_err(|e| {
        tracing::warn!(backend = %address, error = %e, "failed to connect");
        Error::Connectivity {
            backend: address.to_string(),
            reason: e.to_string(),
        }
    })?;

    tracing::debug!(backend = %address, "connected to backend");
    Ok(Backend {
        address: address.to_string(),
        client: HashSvcClient::new(channel),
    })
}

/// Prefixes `address` with `http://` unless it already names a scheme.
pub fn endpoint_uri(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

#[tonic::async_trait]
impl HashBackend for GrpcBackends {
    fn len(&self) -> usize {
        self.backends.len()
    }

    fn address(&self, index: usize) -> &str {
        &self.backends[index].address
    }

    async fn hash(
        &self,
        index: usize,
        buffer: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let backend = self.backends.get(index).ok_or_else(|| Error::TaskFailed {
            context: format!("backend index {index} out of range"),
        })?;
        // Channels are cheap to clone and multiplex concurrent calls.
        let mut client = backend.client.clone();

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            response = client.hash(HashReq { data: buffer }) => match response {
                Ok(response) => Ok(response.into_inner().hash),
                Err(status) => Err(Error::Backend {
                    backend: backend.address.clone(),
                    status,
                }),
            },
        }
    }
}
