//! Coalescing of proof requests.
//!
//! Every request is identified by its [`RequestKey`]. A request whose proof is already in the
//! [`ProofStore`] is answered from there. Otherwise, exactly one producer task is spawned per
//! key, and all concurrent requests for the same key wait on its completion. The producer
//! brings up the prover instance, waits for the prover to accept requests, computes the proof
//! and persists the outcome. Only after the outcome is persisted are waiters woken up, and they
//! receive it through the completion channel, so a sweep of the store in between does not
//! affect them.
//!
//! Once the last in-flight computation finishes, the prover instance is stopped again.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::{self, FutureExt as _};
use sentry::SentryFutureExt;

use crate::backend::ProverClient;
use crate::caching::{CacheEntry, ProofStore, ProveError, RequestKey};
use crate::instance::InstanceController;
use crate::types::{ProveRequest, ProverSpec};
use crate::utils::defer::defer;

/// Resolves to the outcome of a key once its producer has persisted it.
type CompletionChannel = future::Shared<oneshot::Receiver<CacheEntry>>;

type InFlightMap = Mutex<HashMap<RequestKey, CompletionChannel>>;

struct Inner {
    store: Arc<ProofStore>,
    controller: Arc<InstanceController>,
    client: Arc<dyn ProverClient>,
    readiness_poll_interval: Duration,

    /// Keys with a running producer.
    in_flight: InFlightMap,
    /// Number of running `spec` calls, which need the instance as well.
    passthrough: AtomicUsize,
}

/// Answers proof requests from the store, or computes them on the prover instance.
#[derive(Clone)]
pub struct ProofService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProofService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofService")
            .field("controller", &self.inner.controller)
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}

enum Registration {
    /// Another task is already producing the proof.
    Joined(CompletionChannel),
    /// The caller needs to spawn the producer, which sends the outcome when done.
    Created(oneshot::Sender<CacheEntry>, CompletionChannel),
}

impl ProofService {
    /// Creates the service and starts the background sweep of the store.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        store: Arc<ProofStore>,
        controller: Arc<InstanceController>,
        client: Arc<dyn ProverClient>,
        readiness_poll_interval: Duration,
    ) -> Self {
        store.spawn_sweeper();
        Self {
            inner: Arc::new(Inner {
                store,
                controller,
                client,
                readiness_poll_interval,
                in_flight: Mutex::new(HashMap::new()),
                passthrough: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns the proof for `request`, computing it if it is not stored yet.
    ///
    /// Concurrent calls for the same trace share one computation.
    pub async fn prove(&self, request: ProveRequest) -> CacheEntry {
        let key = RequestKey::for_request(&request);
        let block_number = request.block_number();
        metric!(counter("proofs.access") += 1);

        if let Some(entry) = self.inner.store.find(&key).await {
            metric!(counter("proofs.cache.hit") += 1);
            tracing::debug!(
                key = %key,
                block_number = block_number.as_deref(),
                "Proof served from store",
            );
            return entry;
        }

        let channel = match self.inner.register(key) {
            Registration::Joined(channel) => {
                metric!(counter("proofs.coalesced") += 1);
                tracing::debug!(
                    key = %key,
                    block_number = block_number.as_deref(),
                    "Joining in-flight proof",
                );
                channel
            }
            Registration::Created(sender, channel) => {
                let inner = Arc::clone(&self.inner);
                let producer = async move { inner.produce(key, request, sender).await }
                    .bind_hub(sentry::Hub::new_from_top(sentry::Hub::current()));
                tokio::spawn(producer);
                channel
            }
        };

        match channel.await {
            Ok(entry) => entry,
            Err(_) => {
                tracing::error!(
                    key = %key,
                    block_number = block_number.as_deref(),
                    "Proof producer went away",
                );
                Err(ProveError::InternalError)
            }
        }
    }

    /// Queries the prover's spec, starting the instance if needed.
    ///
    /// This is neither cached nor coalesced, but keeps the instance from being stopped while
    /// it runs.
    pub async fn spec(&self) -> Result<ProverSpec, ProveError> {
        let inner = Arc::clone(&self.inner);
        inner.passthrough.fetch_add(1, Ordering::SeqCst);

        let task = async move {
            let result = AssertUnwindSafe(inner.wait_until_ready())
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    tracing::error!("Prover spec request panicked");
                    Err(ProveError::InternalError)
                });
            inner.passthrough.fetch_sub(1, Ordering::SeqCst);
            inner.release_if_idle().await;
            result.map(|(_, spec)| spec)
        }
        .bind_hub(sentry::Hub::new_from_top(sentry::Hub::current()));

        tokio::spawn(task)
            .await
            .unwrap_or_else(|err| Err(ProveError::from_std_error(err)))
    }

    /// Whether the prover instance is believed to be running.
    pub fn is_running(&self) -> bool {
        self.inner.controller.is_running()
    }

    /// Number of proofs currently being computed.
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock_in_flight().len()
    }

    /// Stops the background sweep of the store.
    pub fn close(&self) {
        self.inner.store.close();
    }
}

impl Inner {
    fn lock_in_flight(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<RequestKey, CompletionChannel>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, key: RequestKey) -> Registration {
        let mut in_flight = self.lock_in_flight();
        if let Some(channel) = in_flight.get(&key) {
            return Registration::Joined(channel.clone());
        }

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        in_flight.insert(key, channel.clone());
        metric!(gauge("proofs.in_flight") = in_flight.len() as u64);
        Registration::Created(sender, channel)
    }

    fn deregister(&self, key: &RequestKey) {
        let mut in_flight = self.lock_in_flight();
        in_flight.remove(key);
        metric!(gauge("proofs.in_flight") = in_flight.len() as u64);
    }

    fn is_idle(&self) -> bool {
        self.lock_in_flight().is_empty() && self.passthrough.load(Ordering::SeqCst) == 0
    }

    /// Stops the instance if nothing needs it anymore.
    async fn release_if_idle(&self) {
        if self.is_idle() {
            self.controller.stop_if(|| self.is_idle()).await;
        }
    }

    /// Produces and persists the entry for `key`, then wakes up all waiters.
    async fn produce(
        &self,
        key: RequestKey,
        request: ProveRequest,
        sender: oneshot::Sender<CacheEntry>,
    ) {
        // Runs on every exit, so a key can never be stuck in flight.
        let deregister = defer(|| self.deregister(&key));

        // The previous producer of this key may have finished between our lookup and
        // registration.
        let entry = match self.store.find(&key).await {
            Some(entry) => entry,
            None => {
                let entry = AssertUnwindSafe(self.compute(&key, &request))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        tracing::error!(key = %key, "Proof computation panicked");
                        Err(ProveError::InternalError)
                    });

                if let Err(err) = self.store.save(&key, &entry).await {
                    let dynerr: &dyn std::error::Error = &err;
                    tracing::error!(error = dynerr, key = %key, "Failed to persist proof");
                }
                entry
            }
        };

        drop(deregister);
        self.release_if_idle().await;
        sender.send(entry).ok();
    }

    async fn compute(&self, key: &RequestKey, request: &ProveRequest) -> CacheEntry {
        let block_number = request.block_number();
        metric!(counter("proofs.computation") += 1);
        tracing::info!(key = %key, block_number = block_number.as_deref(), "Proof requested");

        let (endpoint, _) = self.wait_until_ready().await.inspect_err(|err| {
            let dynerr: &dyn std::error::Error = err;
            tracing::error!(
                error = dynerr,
                key = %key,
                block_number = block_number.as_deref(),
                "Prover not available",
            );
        })?;

        let start = Instant::now();
        let result = self.client.prove(&endpoint, request).await;
        metric!(timer("proofs.compute.duration") = start.elapsed());

        match result {
            Ok(proof) => {
                tracing::info!(
                    key = %key,
                    block_number = block_number.as_deref(),
                    "Proof generated",
                );
                Ok(proof)
            }
            Err(err) => {
                let dynerr: &dyn std::error::Error = &err;
                tracing::error!(
                    error = dynerr,
                    key = %key,
                    block_number = block_number.as_deref(),
                    "Proof failed",
                );
                Err(ProveError::ComputeFailed(err.into_rpc_error()))
            }
        }
    }

    /// Brings up the instance and polls the prover until it answers.
    ///
    /// Returns the prover endpoint along with its spec, which doubles as the readiness probe.
    async fn wait_until_ready(&self) -> Result<(Arc<str>, ProverSpec), ProveError> {
        loop {
            // The instance may have been stopped while we were polling.
            if let Err(err) = self.controller.ensure_running().await {
                let dynerr: &dyn std::error::Error = &err;
                tracing::error!(error = dynerr, "Failed to bring up prover instance");
                return Err(ProveError::resource_unavailable(&err));
            }

            let Some(endpoint) = self.controller.address() else {
                tracing::debug!("Prover address not assigned yet");
                tokio::time::sleep(self.readiness_poll_interval).await;
                continue;
            };
            match self.client.spec(&endpoint).await {
                Ok(spec) => return Ok((endpoint, spec)),
                Err(err) if self.client.is_transient(&err) => {
                    tracing::debug!(error = %err, %endpoint, "Prover not ready yet");
                    tokio::time::sleep(self.readiness_poll_interval).await;
                }
                Err(err) => return Err(ProveError::ComputeFailed(err.into_rpc_error())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::RpcError;
    use crate::config::{AddressType, CacheConfig, ProverConfig};
    use crate::instance::InstanceState;
    use crate::test::{FakeCloud, FakeProver};
    use crate::types::ProofType;

    use super::*;

    struct TestService {
        service: ProofService,
        store: Arc<ProofStore>,
        cloud: Arc<FakeCloud>,
        prover: Arc<FakeProver>,
        _dir: prover_proxy_test::TempDir,
    }

    fn prover_config() -> ProverConfig {
        ProverConfig {
            instance_id: "i-prover".to_owned(),
            state_poll_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    async fn setup(state: InstanceState) -> TestService {
        setup_with(FakeCloud::new(state), prover_config()).await
    }

    async fn setup_with(cloud: FakeCloud, config: ProverConfig) -> TestService {
        prover_proxy_test::setup();
        let dir = prover_proxy_test::tempdir();
        let store = Arc::new(
            ProofStore::open(dir.path().to_owned(), CacheConfig::default()).unwrap(),
        );
        let cloud = Arc::new(cloud);
        let controller = Arc::new(
            InstanceController::new(cloud.clone(), &config)
                .await
                .unwrap(),
        );
        let prover = Arc::new(FakeProver::new());
        let service = ProofService::new(
            store.clone(),
            controller,
            prover.clone(),
            Duration::from_millis(10),
        );

        TestService {
            service,
            store,
            cloud,
            prover,
            _dir: dir,
        }
    }

    fn request(trace: &str) -> ProveRequest {
        ProveRequest::new(trace, ProofType(0))
    }

    #[tokio::test]
    async fn test_prove_scenario() {
        let t = setup(InstanceState::Stopped).await;
        t.prover.unreachable_for(2);

        let entry = t.service.prove(request("X")).await;
        assert_eq!(entry, Ok(FakeProver::proof_for("X")));

        // Two refused probes and one that got through.
        assert_eq!(t.prover.spec_calls(), 3);
        assert_eq!(t.prover.prove_calls(), 1);
        assert_eq!(t.prover.endpoints(), vec!["http://10.0.0.1:3030".to_owned()]);
        assert_eq!(t.cloud.starts(), 1);

        let key = RequestKey::from_trace("X");
        assert_eq!(t.store.find(&key).await, Some(entry.clone()));
        assert!(
            t.store
                .cache_dir()
                .join("4b68ab3847feda7d6c62c1fbcbeebfa3")
                .exists()
        );

        // Idle again, so the instance was released.
        assert_eq!(t.cloud.stops(), 1);
        assert!(!t.service.is_running());

        // The second call is served from the store.
        let describes = t.cloud.describes();
        let again = t.service.prove(request("X")).await;
        assert_eq!(again, entry);
        assert_eq!(t.prover.prove_calls(), 1);
        assert_eq!(t.prover.spec_calls(), 3);
        assert_eq!(t.cloud.describes(), describes);
        assert_eq!(t.cloud.starts(), 1);
    }

    #[tokio::test]
    async fn test_proof_type_shares_entry() {
        let t = setup(InstanceState::Running).await;

        let first = t.service.prove(ProveRequest::new("X", ProofType(1))).await;
        let second = t.service.prove(ProveRequest::new("X", ProofType(2))).await;
        assert_eq!(first, second);
        assert_eq!(t.prover.prove_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_coalesced() {
        let t = setup(InstanceState::Stopped).await;
        t.prover.set_delay(Duration::from_millis(200));

        let requests = (0..10).map(|_| {
            let service = t.service.clone();
            tokio::spawn(async move { service.prove(request("X")).await })
        });
        let results = futures::future::join_all(requests).await;

        for result in results {
            assert_eq!(result.unwrap(), Ok(FakeProver::proof_for("X")));
        }
        assert_eq!(t.prover.prove_calls(), 1);
        assert_eq!(t.cloud.starts(), 1);
        assert_eq!(t.cloud.stops(), 1);
        assert_eq!(t.service.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_release_once() {
        let t = setup(InstanceState::Stopped).await;
        t.prover.set_delay(Duration::from_millis(100));

        let a = {
            let service = t.service.clone();
            tokio::spawn(async move { service.prove(request("A")).await })
        };
        let b = {
            let service = t.service.clone();
            tokio::spawn(async move { service.prove(request("B")).await })
        };

        assert_eq!(a.await.unwrap(), Ok(FakeProver::proof_for("A")));
        assert_eq!(b.await.unwrap(), Ok(FakeProver::proof_for("B")));

        assert_eq!(t.prover.prove_calls(), 2);
        assert_eq!(t.cloud.starts(), 1);
        assert_eq!(t.cloud.stops(), 1);
        assert_eq!(t.cloud.state(), InstanceState::Stopped);
    }

    #[tokio::test]
    async fn test_failure_recomputed_after_sweep() {
        let t = setup(InstanceState::Running).await;
        t.prover
            .set_prove_error(Some(RpcError::new(-32099, "trace too large")));

        let failed = Err(ProveError::ComputeFailed(RpcError::new(
            -32099,
            "trace too large",
        )));
        assert_eq!(t.service.prove(request("X")).await, failed);

        // Until the next sweep, the failure is served from the store.
        assert_eq!(t.service.prove(request("X")).await, failed);
        assert_eq!(t.prover.prove_calls(), 1);

        let stats = t.store.cleanup(false).unwrap();
        assert_eq!(stats.removed_files, 1);

        t.prover.set_prove_error(None);
        assert_eq!(
            t.service.prove(request("X")).await,
            Ok(FakeProver::proof_for("X"))
        );
        assert_eq!(t.prover.prove_calls(), 2);
    }

    #[tokio::test]
    async fn test_resource_unavailable() {
        let t = setup(InstanceState::Stopped).await;
        t.cloud.fail_start(true);

        let entry = t.service.prove(request("X")).await;
        let Err(ProveError::ResourceUnavailable { message }) = &entry else {
            panic!("unexpected entry: {entry:?}");
        };
        assert_eq!(message, "StartInstances failed: InsufficientInstanceCapacity");
        assert_eq!(t.prover.spec_calls(), 0);
        assert_eq!(t.prover.prove_calls(), 0);

        // The failure is persisted like any other.
        let key = RequestKey::from_trace("X");
        assert_eq!(t.store.find(&key).await, Some(entry));
        assert!(!t.service.is_running());
    }

    #[tokio::test]
    async fn test_readiness_fatal_error() {
        let t = setup(InstanceState::Stopped).await;
        t.prover.fail_spec(true);

        let entry = t.service.prove(request("X")).await;
        let Err(ProveError::ComputeFailed(error)) = &entry else {
            panic!("unexpected entry: {entry:?}");
        };
        assert_eq!(error.code, RpcError::SERVER_ERROR);
        assert_eq!(
            error.message,
            "invalid prover response: expected value at line 1 column 1"
        );

        // Not retried, and the prover was never asked for the proof.
        assert_eq!(t.prover.spec_calls(), 1);
        assert_eq!(t.prover.prove_calls(), 0);

        let key = RequestKey::from_trace("X");
        assert_eq!(t.store.find(&key).await, Some(entry));
        assert_eq!(t.cloud.starts(), 1);
        assert_eq!(t.cloud.stops(), 1);
        assert!(!t.service.is_running());
    }

    #[tokio::test]
    async fn test_public_address_assigned_late() {
        let cloud = FakeCloud::new(InstanceState::Stopped);
        cloud.set_public_ip(None);
        let config = ProverConfig {
            address_type: AddressType::Public,
            ..prover_config()
        };
        let t = setup_with(cloud, config).await;

        let assign = {
            let cloud = t.cloud.clone();
            tokio::spawn(async move {
                while cloud.starts() == 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                tokio::time::sleep(Duration::from_millis(30)).await;
                cloud.set_public_ip(Some("4.4.4.4"));
            })
        };

        let entry = t.service.prove(request("X")).await;
        assign.await.unwrap();
        assert_eq!(entry, Ok(FakeProver::proof_for("X")));

        // Nothing was sent anywhere before the address was known.
        assert_eq!(t.prover.spec_calls(), 1);
        assert_eq!(t.prover.endpoints(), vec!["http://4.4.4.4:3030".to_owned()]);
        assert_eq!(t.cloud.starts(), 1);
    }

    #[tokio::test]
    async fn test_failure_swept_before_waiters_woken() {
        let t = setup(InstanceState::Running).await;
        t.prover
            .set_prove_error(Some(RpcError::new(-32099, "trace too large")));
        t.cloud.set_stop_delay(Duration::from_millis(200));

        let proof = {
            let service = t.service.clone();
            tokio::spawn(async move { service.prove(request("X")).await })
        };

        // The failure is persisted and the producer is busy stopping the instance.
        while t.cloud.stop_requests() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stats = t.store.cleanup(false).unwrap();
        assert_eq!(stats.removed_files, 1);

        assert_eq!(
            proof.await.unwrap(),
            Err(ProveError::ComputeFailed(RpcError::new(
                -32099,
                "trace too large"
            )))
        );
        assert_eq!(t.cloud.stops(), 1);
    }

    #[tokio::test]
    async fn test_producer_panic() {
        let t = setup(InstanceState::Running).await;
        t.prover.panic_on_prove(true);

        assert_eq!(
            t.service.prove(request("X")).await,
            Err(ProveError::InternalError)
        );
        assert_eq!(t.service.in_flight_count(), 0);
        // Internal errors are not persisted, so the next call computes again.
        assert_eq!(t.store.find(&RequestKey::from_trace("X")).await, None);

        t.prover.panic_on_prove(false);
        assert_eq!(
            t.service.prove(request("X")).await,
            Ok(FakeProver::proof_for("X"))
        );
        assert_eq!(t.prover.prove_calls(), 2);
    }

    #[tokio::test]
    async fn test_spec_passthrough() {
        let t = setup(InstanceState::Stopped).await;
        t.prover.unreachable_for(1);

        assert_eq!(t.service.spec().await, Ok(FakeProver::spec_payload()));
        assert_eq!(t.cloud.starts(), 1);
        assert_eq!(t.cloud.stops(), 1);

        // Not cached.
        assert_eq!(t.service.spec().await, Ok(FakeProver::spec_payload()));
        assert_eq!(t.prover.spec_calls(), 3);
        assert_eq!(t.prover.prove_calls(), 0);
        assert_eq!(t.cloud.starts(), 2);
    }

    #[tokio::test]
    async fn test_spec_keeps_instance_for_proof() {
        let t = setup(InstanceState::Running).await;
        t.prover.set_delay(Duration::from_millis(100));

        let proof = {
            let service = t.service.clone();
            tokio::spawn(async move { service.prove(request("X")).await })
        };
        // The proof is in flight while the spec call finishes.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(t.service.in_flight_count(), 1);
        assert_eq!(t.service.spec().await, Ok(FakeProver::spec_payload()));
        assert_eq!(t.cloud.stops(), 0);
        assert!(t.service.is_running());

        assert_eq!(proof.await.unwrap(), Ok(FakeProver::proof_for("X")));
        assert_eq!(t.cloud.stops(), 1);
    }

    #[tokio::test]
    async fn test_close() {
        let t = setup(InstanceState::Running).await;
        t.service.close();
        t.service.close();
        assert!(t.store.is_closed());
    }
}
