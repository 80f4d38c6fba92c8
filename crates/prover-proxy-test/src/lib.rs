//! Helpers for testing the proxy and its services.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the directory is deleted while the
//!    proof store still uses it.
//!
//!  - When using [`MockProver`], make sure that the server is held until all requests to
//!    it have been made. The server stops serving when dropped.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the proxy crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new(
            "prover_proxy_service=trace,prover_proxy=trace",
        ))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.port(), path)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

type Calls = Arc<Mutex<BTreeMap<String, usize>>>;

/// A JSON-RPC prover that answers instantly.
///
/// The routes are:
///  - `POST /`: answers `spec` with [`MockProver::spec`], and `prove` with
///    `{"proof": <trace>}`. Other methods get a "method not found" error.
///  - `POST /error`: answers every call with a JSON-RPC error with code `-32099`.
///  - `POST /garbage`: answers with a body that is not JSON.
pub struct MockProver {
    server: Server,
    calls: Calls,
}

impl MockProver {
    pub fn new() -> Self {
        let calls = Calls::default();

        let router = Router::new()
            .route("/", post(answer))
            .route("/error", post(reject))
            .route("/garbage", post(|| async { "this is not json" }))
            .with_state(calls.clone());

        Self {
            server: Server::with_router(router),
            calls,
        }
    }

    /// The spec reported by this prover.
    pub fn spec() -> Value {
        json!({ "degree": 21, "chain_id": 901 })
    }

    /// The URL of the well-behaved prover endpoint.
    pub fn endpoint(&self) -> String {
        self.server.url("")
    }

    pub fn url(&self, path: &str) -> String {
        self.server.url(path)
    }

    /// Number of calls of `method`, across all routes.
    pub fn calls(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(method)
            .copied()
            .unwrap_or_default()
    }
}

impl Default for MockProver {
    fn default() -> Self {
        Self::new()
    }
}

fn count(calls: &Calls, request: &Value) -> (String, Value) {
    let method = request["method"].as_str().unwrap_or_default().to_owned();
    *calls.lock().unwrap().entry(method.clone()).or_default() += 1;
    (method, request["id"].clone())
}

async fn answer(State(calls): State<Calls>, Json(request): Json<Value>) -> Json<Value> {
    let (method, id) = count(&calls, &request);
    let response = match method.as_str() {
        "spec" => json!({ "jsonrpc": "2.0", "result": MockProver::spec(), "id": id }),
        "prove" => json!({
            "jsonrpc": "2.0",
            "result": { "proof": request["params"][0] },
            "id": id,
        }),
        _ => json!({
            "jsonrpc": "2.0",
            "error": { "code": -32601, "message": "Method not found" },
            "id": id,
        }),
    };
    Json(response)
}

async fn reject(State(calls): State<Calls>, Json(request): Json<Value>) -> Json<Value> {
    let (_, id) = count(&calls, &request);
    Json(json!({
        "jsonrpc": "2.0",
        "error": { "code": -32099, "message": "trace rejected", "data": "bad header" },
        "id": id,
    }))
}
