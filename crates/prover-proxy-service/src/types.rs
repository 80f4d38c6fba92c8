//! Request and response types shared between the proxy and the prover.

use serde::{Deserialize, Serialize};

/// The proof payload returned by the prover.
///
/// The proxy never looks inside a proof, it only stores and replays it.
pub type ProofPayload = serde_json::Value;

/// The capabilities reported by the prover's `spec` method.
pub type ProverSpec = serde_json::Value;

/// The kind of proof requested from the prover.
///
/// This is forwarded verbatim and does not contribute to the cache key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProofType(pub u32);

/// A request to prove a single execution trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProveRequest {
    /// The raw execution trace, a JSON document in string form.
    pub trace: String,
    /// The kind of proof to generate.
    #[serde(default)]
    pub proof_type: ProofType,
}

impl ProveRequest {
    pub fn new(trace: impl Into<String>, proof_type: ProofType) -> Self {
        Self {
            trace: trace.into(),
            proof_type,
        }
    }

    /// Extracts `header.number` from the trace, used to correlate log lines with blocks.
    ///
    /// Returns `None` if the trace is not JSON or the field is missing or not a string.
    pub fn block_number(&self) -> Option<String> {
        let trace: serde_json::Value = serde_json::from_str(&self.trace).ok()?;
        let number = trace.get("header")?.get("number")?.as_str()?;
        Some(number.to_owned())
    }
}
