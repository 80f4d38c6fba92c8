use std::fmt;

use sha2::{Digest, Sha256};

use crate::types::ProveRequest;

/// The identity of a proof request, both in the store and for request coalescing.
///
/// This is the first 16 bytes of the sha-256 of the raw trace. The proof type is not part of
/// the key, so two requests for the same trace share one proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey([u8; 16]);

impl RequestKey {
    /// Creates the [`RequestKey`] for the given request.
    pub fn for_request(request: &ProveRequest) -> Self {
        Self::from_trace(&request.trace)
    }

    /// Creates the [`RequestKey`] for a raw trace.
    pub fn from_trace(trace: &str) -> Self {
        let digest = Sha256::digest(trace.as_bytes());
        let mut hash = [0; 16];
        hash.copy_from_slice(&digest[..16]);
        Self(hash)
    }

    /// The name of the file holding this key's entry.
    pub fn file_name(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use crate::types::ProofType;

    use super::*;

    #[test]
    fn test_request_key() {
        let key = RequestKey::from_trace("X");
        // sha256("X") = 4b68ab3847feda7d6c62c1fbcbeebfa35eab7351ed5e78f4ddadea5df64b8015
        assert_eq!(key.to_string(), "4b68ab3847feda7d6c62c1fbcbeebfa3");
        assert_eq!(key.file_name(), key.to_string());
    }

    #[test]
    fn test_proof_type_ignored() {
        let a = ProveRequest::new(r#"{"header":{"number":"0x1"}}"#, ProofType(0));
        let b = ProveRequest::new(r#"{"header":{"number":"0x1"}}"#, ProofType(2));
        let c = ProveRequest::new(r#"{"header":{"number":"0x2"}}"#, ProofType(0));

        assert_eq!(RequestKey::for_request(&a), RequestKey::for_request(&b));
        assert_ne!(RequestKey::for_request(&a), RequestKey::for_request(&c));
    }
}
