//! The client side of the prover's JSON-RPC API.
//!
//! The proxy only needs two calls from the prover: `prove`, which does the actual (expensive)
//! work, and `spec`, which is cheap and doubles as the readiness probe after the prover instance
//! has been started. Both go through the [`ProverClient`] trait so that the orchestration logic
//! can be exercised without a real prover.
//!
//! A freshly started instance refuses connections until the prover process is up. Whether an
//! error means "not booted yet" is decided by [`ProverClient::is_transient`], and never by
//! looking at the error message.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;

use crate::types::{ProofPayload, ProveRequest, ProverSpec};

mod jsonrpc;

pub use jsonrpc::{JSONRPC_VERSION, RpcError, RpcRequest, RpcResponse};

/// An error talking to the prover.
#[derive(Debug, Error)]
pub enum BackendError {
    /// No connection could be established, the prover is most likely still booting.
    #[error("prover unreachable: {0}")]
    Unreachable(String),
    /// The prover answered with a JSON-RPC error.
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// The prover answered with something that is not a JSON-RPC response.
    #[error("invalid prover response: {0}")]
    InvalidResponse(String),
    /// The request failed after a connection was established.
    #[error("prover request failed: {0}")]
    Transport(String),
}

impl BackendError {
    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unreachable(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }

    /// Converts this error into the JSON-RPC error that is persisted and reported to callers.
    ///
    /// Errors reported by the prover itself keep their code, everything else becomes a
    /// generic server error.
    pub fn into_rpc_error(self) -> RpcError {
        match self {
            Self::Rpc(error) => error,
            other => RpcError::server_error(other.to_string()),
        }
    }
}

/// The calls the proxy makes against a prover listening at `endpoint`.
#[async_trait]
pub trait ProverClient: Send + Sync + 'static {
    /// Generates a proof for the given request.
    async fn prove(
        &self,
        endpoint: &str,
        request: &ProveRequest,
    ) -> Result<ProofPayload, BackendError>;

    /// Queries the prover's capabilities.
    async fn spec(&self, endpoint: &str) -> Result<ProverSpec, BackendError>;

    /// Whether `error` means the prover is not up yet and the call should be retried.
    fn is_transient(&self, error: &BackendError) -> bool {
        matches!(error, BackendError::Unreachable(_))
    }
}

/// A [`ProverClient`] speaking JSON-RPC over HTTP.
#[derive(Debug, Clone)]
pub struct JsonRpcProverClient {
    client: reqwest::Client,
}

impl JsonRpcProverClient {
    /// Creates a new client.
    ///
    /// Only the connect phase has a timeout, generating a proof can take hours.
    pub fn new(connect_timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(BackendError::from_transport)?;
        Ok(Self { client })
    }

    async fn send(&self, endpoint: &str, method: &str, params: Value) -> Result<Value, BackendError> {
        let request = RpcRequest::new(method, params);
        let response = self
            .client
            .post(endpoint)
            .json(&request)
            .send()
            .await
            .map_err(BackendError::from_transport)?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(BackendError::from_transport)?;

        let response: RpcResponse = serde_json::from_slice(&body).map_err(|err| {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                %status,
                body = %String::from_utf8_lossy(&body),
                method,
                "Failed to parse prover response",
            );
            BackendError::InvalidResponse(format!("{err} (status {status})"))
        })?;

        response.into_result()
    }
}

#[async_trait]
impl ProverClient for JsonRpcProverClient {
    async fn prove(
        &self,
        endpoint: &str,
        request: &ProveRequest,
    ) -> Result<ProofPayload, BackendError> {
        self.send(endpoint, "prove", json!([request.trace, request.proof_type]))
            .await
    }

    async fn spec(&self, endpoint: &str) -> Result<ProverSpec, BackendError> {
        self.send(endpoint, "spec", Value::Null).await
    }
}
