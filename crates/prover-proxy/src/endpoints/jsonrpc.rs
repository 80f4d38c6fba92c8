//! The JSON-RPC API of the proxy.
//!
//! The proxy speaks the same protocol as the prover it fronts: `prove` and `spec`, wrapped in a
//! JSON-RPC 2.0 envelope. Every request that makes it past body extraction is answered with
//! HTTP 200, errors included.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::rejection::BytesRejection;
use prover_proxy_service::backend::{JSONRPC_VERSION, RpcError, RpcRequest, RpcResponse};
use prover_proxy_service::services::ProofService;
use prover_proxy_service::types::{ProofType, ProveRequest};
use serde_json::Value;

use super::ResponseError;

pub async fn handle_rpc_request(
    State(service): State<ProofService>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<RpcResponse>, ResponseError> {
    let body = body?;
    Ok(Json(dispatch(&service, &body).await))
}

async fn dispatch(service: &ProofService, body: &[u8]) -> RpcResponse {
    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => {
            let error = RpcError::new(RpcError::PARSE_ERROR, format!("parse error: {err}"));
            return RpcResponse::failure(Value::Null, error);
        }
    };

    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let request = match serde_json::from_value::<RpcRequest>(value) {
        Ok(request) if request.jsonrpc == JSONRPC_VERSION => request,
        Ok(request) => {
            let message = format!("unsupported jsonrpc version: {}", request.jsonrpc);
            return RpcResponse::failure(id, RpcError::new(RpcError::INVALID_REQUEST, message));
        }
        Err(err) => {
            let message = format!("invalid request: {err}");
            return RpcResponse::failure(id, RpcError::new(RpcError::INVALID_REQUEST, message));
        }
    };

    tracing::debug!(method = %request.method, "Handling JSON-RPC request");
    let result = match request.method.as_str() {
        "prove" => match parse_prove_params(request.params) {
            Ok(prove) => service.prove(prove).await.map_err(|err| err.rpc_error()),
            Err(err) => Err(err),
        },
        "spec" => service.spec().await.map_err(|err| err.rpc_error()),
        method => Err(RpcError::new(
            RpcError::METHOD_NOT_FOUND,
            format!("method not found: {method}"),
        )),
    };

    match result {
        Ok(result) => RpcResponse::success(request.id, result),
        Err(error) => RpcResponse::failure(request.id, error),
    }
}

/// Reads `prove` params, given as `[trace, proof_type?]` or `{"trace": .., "proof_type": ..}`.
fn parse_prove_params(params: Value) -> Result<ProveRequest, RpcError> {
    let invalid = |message: String| RpcError::new(RpcError::INVALID_PARAMS, message);

    match params {
        Value::Array(params) => {
            let mut params = params.into_iter();
            let (trace, proof_type) = match (params.next(), params.next(), params.next()) {
                (Some(trace), proof_type, None) => (trace, proof_type),
                _ => return Err(invalid("expected [trace, proof_type]".to_owned())),
            };
            let trace = match trace {
                Value::String(trace) => trace,
                _ => return Err(invalid("trace must be a string".to_owned())),
            };
            let proof_type = match proof_type {
                Some(proof_type) => serde_json::from_value::<ProofType>(proof_type)
                    .map_err(|err| invalid(format!("invalid proof_type: {err}")))?,
                None => ProofType::default(),
            };
            Ok(ProveRequest::new(trace, proof_type))
        }
        params @ Value::Object(_) => serde_json::from_value(params)
            .map_err(|err| invalid(format!("invalid prove params: {err}"))),
        _ => Err(invalid("expected an array or an object".to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use prover_proxy_service::instance::InstanceState;
    use prover_proxy_service::test::FakeProver;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::endpoints::tests::test_app;

    async fn call(app: Router, body: impl Into<Body>) -> Value {
        let request = Request::post("/")
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn rpc(method: &str, params: Value) -> String {
        json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": 7 }).to_string()
    }

    #[test]
    fn test_prove_params() {
        let positional = parse_prove_params(json!(["X", 2])).unwrap();
        assert_eq!(positional, ProveRequest::new("X", ProofType(2)));

        let trace_only = parse_prove_params(json!(["X"])).unwrap();
        assert_eq!(trace_only, ProveRequest::new("X", ProofType(0)));

        let named = parse_prove_params(json!({ "trace": "X", "proof_type": 3 })).unwrap();
        assert_eq!(named, ProveRequest::new("X", ProofType(3)));
    }

    #[test]
    fn test_invalid_prove_params() {
        for params in [
            json!([]),
            json!(["X", 1, 2]),
            json!([1]),
            json!(["X", "one"]),
            json!({ "proof_type": 1 }),
            json!("X"),
            Value::Null,
        ] {
            let err = parse_prove_params(params.clone()).unwrap_err();
            assert_eq!(err.code, RpcError::INVALID_PARAMS, "{params}");
        }
    }

    #[tokio::test]
    async fn test_prove() {
        let t = test_app(InstanceState::Stopped).await;

        let response = call(t.app.clone(), rpc("prove", json!(["X", 1]))).await;
        assert_eq!(
            response,
            json!({ "jsonrpc": "2.0", "result": FakeProver::proof_for("X"), "id": 7 })
        );

        // Served from the store the second time.
        let again = call(t.app, rpc("prove", json!({ "trace": "X" }))).await;
        assert_eq!(again, response);
        assert_eq!(t.prover.prove_calls(), 1);
        assert_eq!(t.cloud.starts(), 1);
        assert_eq!(t.cloud.stops(), 1);
    }

    #[tokio::test]
    async fn test_prove_failure() {
        let t = test_app(InstanceState::Running).await;
        t.prover
            .set_prove_error(Some(RpcError::new(-32099, "trace rejected")));

        let response = call(t.app, rpc("prove", json!(["X", 1]))).await;
        assert_eq!(
            response,
            json!({
                "jsonrpc": "2.0",
                "error": { "code": -32099, "message": "trace rejected" },
                "id": 7,
            })
        );
    }

    #[tokio::test]
    async fn test_resource_unavailable() {
        let t = test_app(InstanceState::Stopped).await;
        t.cloud.fail_start(true);

        let response = call(t.app, rpc("prove", json!(["X", 1]))).await;
        assert_eq!(response["error"]["code"], json!(RpcError::RESOURCE_UNAVAILABLE));
        assert_eq!(t.prover.prove_calls(), 0);
    }

    #[tokio::test]
    async fn test_spec() {
        let t = test_app(InstanceState::Running).await;

        let response = call(t.app, rpc("spec", Value::Null)).await;
        assert_eq!(
            response,
            json!({ "jsonrpc": "2.0", "result": FakeProver::spec_payload(), "id": 7 })
        );
        assert_eq!(t.prover.spec_calls(), 1);
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let t = test_app(InstanceState::Stopped).await;

        let parse = call(t.app.clone(), "{not json").await;
        assert_eq!(parse["error"]["code"], json!(RpcError::PARSE_ERROR));
        assert_eq!(parse["id"], Value::Null);

        let version = json!({ "jsonrpc": "1.0", "method": "spec", "id": 1 }).to_string();
        let version = call(t.app.clone(), version).await;
        assert_eq!(version["error"]["code"], json!(RpcError::INVALID_REQUEST));
        assert_eq!(version["id"], json!(1));

        let no_method = json!({ "jsonrpc": "2.0", "id": 2 }).to_string();
        let no_method = call(t.app.clone(), no_method).await;
        assert_eq!(no_method["error"]["code"], json!(RpcError::INVALID_REQUEST));
        assert_eq!(no_method["id"], json!(2));

        let unknown = call(t.app.clone(), rpc("mine", Value::Null)).await;
        assert_eq!(unknown["error"]["code"], json!(RpcError::METHOD_NOT_FOUND));

        let params = call(t.app, rpc("prove", json!([]))).await;
        assert_eq!(params["error"]["code"], json!(RpcError::INVALID_PARAMS));

        assert_eq!(t.prover.spec_calls(), 0);
        assert_eq!(t.prover.prove_calls(), 0);
        assert_eq!(t.cloud.starts(), 0);
    }
}
