//! Provides the [`ProofService`] and a way to initialize it from the [`Config`].
//!
//! The service is wired up from three independent parts: the [`ProofStore`] persisting results,
//! the [`InstanceController`] managing the prover instance, and the [`ProverClient`] talking to
//! the prover itself.
//!
//! [`ProverClient`]: crate::backend::ProverClient

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::backend::JsonRpcProverClient;
use crate::caching::ProofStore;
use crate::config::Config;
use crate::instance::{Ec2CloudControl, InstanceController};

mod proof;

pub use proof::ProofService;

/// Creates the [`ProofService`] backed by EC2 and the prover's JSON-RPC API.
///
/// Must be called within a tokio runtime.
pub async fn create_service(config: &Config) -> Result<ProofService> {
    let store = ProofStore::from_config(config).context("failed to create proof store")?;
    store
        .clear_tmp()
        .context("failed to clear tmp directory")?;

    let cloud = Arc::new(Ec2CloudControl::new(&config.prover.region).await);
    let controller = InstanceController::new(cloud, &config.prover)
        .await
        .context("failed to resolve prover instance")?;

    let client = JsonRpcProverClient::new(config.prover.connect_timeout)
        .context("failed to create prover client")?;

    Ok(ProofService::new(
        Arc::new(store),
        Arc::new(controller),
        Arc::new(client),
        config.prover.readiness_poll_interval,
    ))
}
