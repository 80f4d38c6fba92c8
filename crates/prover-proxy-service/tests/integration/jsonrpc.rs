use std::time::Duration;

use prover_proxy_service::backend::{BackendError, JsonRpcProverClient, ProverClient};
use prover_proxy_service::types::{ProofType, ProveRequest};
use prover_proxy_test::MockProver;
use serde_json::json;

fn client() -> JsonRpcProverClient {
    JsonRpcProverClient::new(Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_prove() {
    prover_proxy_test::setup();
    let prover = MockProver::new();

    let request = ProveRequest::new(r#"{"header":{"number":"0x1"}}"#, ProofType(2));
    let proof = client().prove(&prover.endpoint(), &request).await.unwrap();

    assert_eq!(proof, json!({ "proof": r#"{"header":{"number":"0x1"}}"# }));
    assert_eq!(prover.calls("prove"), 1);
    assert_eq!(prover.calls("spec"), 0);
}

#[tokio::test]
async fn test_spec() {
    prover_proxy_test::setup();
    let prover = MockProver::new();

    let spec = client().spec(&prover.endpoint()).await.unwrap();

    assert_eq!(spec, MockProver::spec());
    assert_eq!(prover.calls("spec"), 1);
}

#[tokio::test]
async fn test_rpc_error() {
    prover_proxy_test::setup();
    let prover = MockProver::new();
    let client = client();

    let request = ProveRequest::new("X", ProofType::default());
    let err = client
        .prove(&prover.url("/error"), &request)
        .await
        .unwrap_err();

    assert!(!client.is_transient(&err));
    let error = err.into_rpc_error();
    assert_eq!(error.code, -32099);
    assert_eq!(error.message, "trace rejected");
    assert_eq!(error.data, Some(json!("bad header")));
}

#[tokio::test]
async fn test_invalid_response() {
    prover_proxy_test::setup();
    let prover = MockProver::new();
    let client = client();

    let err = client.spec(&prover.url("/garbage")).await.unwrap_err();

    assert!(matches!(err, BackendError::InvalidResponse(_)), "{err:?}");
    assert!(!client.is_transient(&err));
    assert_eq!(prover.calls("spec"), 0);
}
