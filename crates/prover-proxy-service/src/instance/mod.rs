//! Lifecycle of the cloud instance the prover runs on.
//!
//! The prover needs a large machine, which is only kept running while there is work for it.
//! The [`InstanceController`] starts the instance on demand and stops it again once the proxy
//! is idle. It also tracks the endpoint the prover is reachable at, as the address of an
//! instance may change across a stop and start.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{AddressType, ProverConfig};

mod ec2;

pub use ec2::{Ec2CloudControl, Ec2Error};

/// The lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    /// A state this proxy does not know about.
    Unknown,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// One address assigned to a network interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub private_ip: Option<String>,
    /// The public IP associated with the private one, if any.
    pub public_ip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInterface {
    pub addresses: Vec<InterfaceAddress>,
}

/// What the cloud reports about an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    pub state: InstanceState,
    pub network_interfaces: Vec<NetworkInterface>,
}

impl InstanceDescription {
    /// The first address of the requested type, in interface order.
    pub fn ip(&self, address_type: AddressType) -> Option<&str> {
        self.network_interfaces
            .iter()
            .flat_map(|interface| &interface.addresses)
            .find_map(|address| match address_type {
                AddressType::Private => address.private_ip.as_deref(),
                AddressType::Public => address.public_ip.as_deref(),
            })
    }
}

/// A failed call to the cloud API.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CloudError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl CloudError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// The calls the controller makes against the cloud.
#[async_trait]
pub trait CloudControl: Send + Sync + 'static {
    /// Describes the instance, or returns `None` if it does not exist.
    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceDescription>, CloudError>;

    async fn start_instance(&self, instance_id: &str) -> Result<(), CloudError>;

    async fn stop_instance(&self, instance_id: &str) -> Result<(), CloudError>;
}

/// An error bringing up the prover instance.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error("instance `{0}` does not exist")]
    NotFound(String),
    #[error("instance `{instance_id}` is {state}")]
    Unusable {
        instance_id: String,
        state: InstanceState,
    },
    #[error("instance `{instance_id}` has no {address_type} address")]
    NoAddress {
        instance_id: String,
        address_type: AddressType,
    },
}

/// Starts and stops the prover instance, and tracks where the prover is reachable.
pub struct InstanceController {
    cloud: Arc<dyn CloudControl>,
    instance_id: String,
    address_type: AddressType,
    scheme: String,
    port: u16,
    state_poll_interval: Duration,

    /// Whether the instance is believed to be running.
    running: AtomicBool,
    /// The prover endpoint, `None` until the current run of the instance has an address.
    address: RwLock<Option<Arc<str>>>,
    /// Serializes all start and stop transitions.
    transition: tokio::sync::Mutex<()>,
}

impl fmt::Debug for InstanceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceController")
            .field("instance_id", &self.instance_id)
            .field("running", &self.is_running())
            .field("address", &self.address())
            .finish()
    }
}

impl InstanceController {
    /// Creates a controller for the configured instance.
    ///
    /// This describes the instance once, to resolve the prover endpoint and to learn whether
    /// the instance is already up. A running instance without an address of the configured
    /// type is an error, a stopped one gets its address on the next start.
    pub async fn new(
        cloud: Arc<dyn CloudControl>,
        config: &ProverConfig,
    ) -> Result<Self, InstanceError> {
        let instance_id = config.instance_id.clone();
        let description = cloud
            .describe_instance(&instance_id)
            .await?
            .ok_or_else(|| InstanceError::NotFound(instance_id.clone()))?;

        let controller = Self {
            cloud,
            instance_id,
            address_type: config.address_type,
            scheme: config.scheme.clone(),
            port: config.port,
            state_poll_interval: config.state_poll_interval,
            running: AtomicBool::new(matches!(
                description.state,
                InstanceState::Running | InstanceState::Pending
            )),
            address: RwLock::new(None),
            transition: tokio::sync::Mutex::new(()),
        };
        if !controller.refresh_address(&description) && description.state == InstanceState::Running
        {
            return Err(InstanceError::NoAddress {
                instance_id: controller.instance_id,
                address_type: controller.address_type,
            });
        }

        tracing::info!(
            instance_id = %controller.instance_id,
            state = %description.state,
            address = controller.address().as_deref(),
            "Prover instance resolved",
        );
        Ok(controller)
    }

    /// Whether the instance is believed to be running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The endpoint of the prover, `scheme://ip:port`.
    ///
    /// Returns `None` while the instance has no address of the configured type, e.g. right
    /// after a start before a public IP is assigned.
    pub fn address(&self) -> Option<Arc<str>> {
        self.address
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_address(&self, address: Option<Arc<str>>) {
        *self.address.write().unwrap_or_else(PoisonError::into_inner) = address;
    }

    /// Resolves the endpoint from `description`, returning whether it has one.
    fn refresh_address(&self, description: &InstanceDescription) -> bool {
        let address = description
            .ip(self.address_type)
            .map(|ip| Arc::from(resolve_address(&self.scheme, ip, self.port)));
        let resolved = address.is_some();
        self.set_address(address);
        resolved
    }

    async fn describe(&self) -> Result<InstanceDescription, InstanceError> {
        self.cloud
            .describe_instance(&self.instance_id)
            .await?
            .ok_or_else(|| InstanceError::NotFound(self.instance_id.clone()))
    }

    /// Makes sure the instance is running, starting it if needed.
    ///
    /// This does not wait for the prover on the instance to come up. If the instance is
    /// running but has no address yet, it is described again, so calling this repeatedly
    /// eventually resolves [`address`](Self::address).
    pub async fn ensure_running(&self) -> Result<(), InstanceError> {
        if self.is_running() && self.address().is_some() {
            return Ok(());
        }

        let _guard = self.transition.lock().await;
        if self.is_running() {
            if self.address().is_none() {
                let description = self.describe().await?;
                if !self.refresh_address(&description) {
                    tracing::debug!(
                        instance_id = %self.instance_id,
                        address_type = %self.address_type,
                        "Prover address not assigned yet",
                    );
                }
            }
            return Ok(());
        }

        loop {
            let description = self.describe().await?;

            match description.state {
                InstanceState::Running | InstanceState::Pending => {
                    self.running.store(true, Ordering::SeqCst);
                    self.refresh_address(&description);
                    return Ok(());
                }
                InstanceState::Stopped => break,
                InstanceState::Stopping => {
                    tracing::debug!(
                        instance_id = %self.instance_id,
                        "Waiting for prover instance to stop",
                    );
                    tokio::time::sleep(self.state_poll_interval).await;
                }
                state => {
                    return Err(InstanceError::Unusable {
                        instance_id: self.instance_id.clone(),
                        state,
                    });
                }
            }
        }

        tracing::info!(instance_id = %self.instance_id, "Starting prover instance");
        self.cloud.start_instance(&self.instance_id).await?;
        // The address from before the stop may have been released.
        self.set_address(None);
        self.running.store(true, Ordering::SeqCst);
        metric!(counter("instance.start") += 1);

        let description = self.describe().await?;
        self.refresh_address(&description);

        tracing::info!(
            instance_id = %self.instance_id,
            address = self.address().as_deref(),
            "Prover instance started",
        );
        Ok(())
    }

    /// Stops the instance if it is running and `idle` holds.
    ///
    /// `idle` is checked while holding the transition lock, so it sees every registration
    /// that happened before. Returns whether the instance was stopped.
    pub async fn stop_if(&self, idle: impl FnOnce() -> bool) -> bool {
        let _guard = self.transition.lock().await;
        if !self.is_running() || !idle() {
            return false;
        }

        // Clear the flag first so concurrent callers of `ensure_running` wait for this stop
        // and start the instance again afterwards.
        self.running.store(false, Ordering::SeqCst);
        tracing::info!(instance_id = %self.instance_id, "Stopping idle prover instance");

        match self.cloud.stop_instance(&self.instance_id).await {
            Ok(()) => {
                metric!(counter("instance.stop") += 1);
                true
            }
            Err(err) => {
                let dynerr: &dyn std::error::Error = &err;
                tracing::error!(
                    error = dynerr,
                    instance_id = %self.instance_id,
                    "Failed to stop prover instance",
                );
                self.running.store(true, Ordering::SeqCst);
                false
            }
        }
    }

    /// Stops the instance if it is running.
    pub async fn stop_if_running(&self) -> bool {
        self.stop_if(|| true).await
    }
}

/// Formats the prover endpoint.
pub fn resolve_address(scheme: &str, ip: &str, port: u16) -> String {
    format!("{scheme}://{ip}:{port}")
}
