use axum::Json;
use axum::extract::State;
use prover_proxy_service::services::ProofService;
use serde::Serialize;

/// A snapshot of the proxy's state.
#[derive(Debug, Serialize)]
pub struct Status {
    /// Whether the prover instance is believed to be running.
    running: bool,
    /// Number of proofs currently being computed.
    in_flight: usize,
}

pub async fn get_status(State(service): State<ProofService>) -> Json<Status> {
    Json(Status {
        running: service.is_running(),
        in_flight: service.in_flight_count(),
    })
}
