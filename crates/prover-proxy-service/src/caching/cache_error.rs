use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::RpcError;
use crate::types::ProofPayload;

/// An error that happens while producing a proof.
///
/// This error enum is intended for persisting in the proof store, except for the
/// [`InternalError`](Self::InternalError) variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProveError {
    /// The prover instance could not be started or described.
    #[error("prover unavailable: {message}")]
    ResourceUnavailable { message: String },
    /// The prover was reached, but failed to produce a proof.
    ///
    /// The attached error is what the prover answered with, or a generic server error
    /// when the prover did not answer with a JSON-RPC error.
    #[error("proof computation failed: {0}")]
    ComputeFailed(RpcError),
    /// An unexpected error in the proxy itself.
    ///
    /// This variant is not intended to be persisted to or read from the store.
    #[error("internal error")]
    InternalError,
}

impl ProveError {
    /// The JSON-RPC error reported to callers for this error.
    pub fn rpc_error(&self) -> RpcError {
        match self {
            Self::ResourceUnavailable { message } => {
                RpcError::new(RpcError::RESOURCE_UNAVAILABLE, message.clone())
            }
            Self::ComputeFailed(error) => error.clone(),
            Self::InternalError => RpcError::new(RpcError::INTERNAL_ERROR, "internal error"),
        }
    }

    /// A [`ResourceUnavailable`](Self::ResourceUnavailable) error carrying `error` along with
    /// its whole source chain, e.g. `StartInstances failed: InsufficientInstanceCapacity`.
    pub fn resource_unavailable(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::ResourceUnavailable { message }
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

/// An entry in the proof store, containing either the proof or the reason it could not be
/// produced.
pub type CacheEntry = Result<ProofPayload, ProveError>;

/// The on-disk representation of a [`CacheEntry`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StoredEntry {
    Result(ProofPayload),
    Error(ProveError),
}

/// Serializes a [`CacheEntry`] for persisting.
///
/// Returns `None` for entries that must not be persisted.
pub(super) fn cache_entry_to_bytes(entry: &CacheEntry) -> Option<serde_json::Result<Vec<u8>>> {
    let stored = match entry {
        Ok(payload) => StoredEntry::Result(payload.clone()),
        Err(ProveError::InternalError) => return None,
        Err(error) => StoredEntry::Error(error.clone()),
    };
    Some(serde_json::to_vec(&stored))
}

/// Parses a [`CacheEntry`] from the contents of a store file.
pub(super) fn cache_entry_from_bytes(bytes: &[u8]) -> serde_json::Result<CacheEntry> {
    let stored: StoredEntry = serde_json::from_slice(bytes)?;
    Ok(match stored {
        StoredEntry::Result(payload) => Ok(payload),
        StoredEntry::Error(error) => Err(error),
    })
}
