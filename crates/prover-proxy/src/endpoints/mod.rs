use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use prover_proxy_service::metric;
use prover_proxy_service::services::ProofService;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

mod error;
mod jsonrpc;
mod metrics;
mod status;

pub use error::ResponseError;
use metrics::MetricsLayer;

use jsonrpc::handle_rpc_request as jsonrpc;
use status::get_status as status;

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: ProofService) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer)
        // Traces of large blocks run into tens of megabytes.
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024));
    Router::new()
        .route("/", post(jsonrpc))
        .route("/status", get(status))
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
