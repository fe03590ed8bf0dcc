use bytes::Bytes;
use parhash_core::proto::hashsvc::{HashReq, HashResp, hash_svc_server::HashSvc};
use sha2::{Digest, Sha256};
use tonic::{Request, Response, Status};

/// Reference hashing backend: answers every `Hash` call with the SHA-256
/// digest of the buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha256HashService;

#[tonic::async_trait]
impl HashSvc for Sha256HashService {
    #[tracing::instrument(level = "trace", skip_all, fields(len = req.get_ref().data.len()))]
    async fn hash(&self, req: Request<HashReq>) -> Result<Response<HashResp>, Status> {
        let digest = Sha256::digest(&req.get_ref().data);
        Ok(Response::new(HashResp {
            hash: Bytes::copy_from_slice(&digest),
        }))
    }
}
