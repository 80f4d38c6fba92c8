//! [`CloudControl`] backed by the EC2 API.

use std::fmt;

use async_trait::async_trait;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::config::Region;
use aws_sdk_ec2::error::SdkError;
use aws_sdk_ec2::types::InstanceStateName;

use super::{
    CloudControl, CloudError, InstanceDescription, InstanceState, InterfaceAddress,
    NetworkInterface,
};

pub use aws_sdk_ec2::Error as Ec2Error;

/// Controls EC2 instances in a single region.
///
/// Credentials are resolved from the environment, the way all AWS tooling does.
pub struct Ec2CloudControl {
    client: Client,
}

impl fmt::Debug for Ec2CloudControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ec2CloudControl").finish_non_exhaustive()
    }
}

impl Ec2CloudControl {
    pub async fn new(region: &str) -> Self {
        let config = aws_config::from_env()
            .region(Region::new(region.to_owned()))
            .load()
            .await;
        Self {
            client: Client::new(&config),
        }
    }
}

fn cloud_error<E, R>(operation: &'static str, err: SdkError<E, R>) -> CloudError
where
    Ec2Error: From<SdkError<E, R>>,
{
    let err = Ec2Error::from(err);
    tracing::debug!(
        error = &err as &dyn std::error::Error,
        operation,
        "EC2 request failed",
    );
    CloudError::with_source(format!("{operation} failed"), err)
}

fn convert_state(name: &InstanceStateName) -> InstanceState {
    match name {
        InstanceStateName::Pending => InstanceState::Pending,
        InstanceStateName::Running => InstanceState::Running,
        InstanceStateName::ShuttingDown => InstanceState::ShuttingDown,
        InstanceStateName::Terminated => InstanceState::Terminated,
        InstanceStateName::Stopping => InstanceState::Stopping,
        InstanceStateName::Stopped => InstanceState::Stopped,
        _ => InstanceState::Unknown,
    }
}

#[async_trait]
impl CloudControl for Ec2CloudControl {
    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceDescription>, CloudError> {
        let output = self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|err| cloud_error("DescribeInstances", err))?;

        let Some(instance) = output
            .reservations()
            .iter()
            .flat_map(|reservation| reservation.instances())
            .find(|instance| instance.instance_id() == Some(instance_id))
        else {
            return Ok(None);
        };

        let state = instance
            .state()
            .and_then(|state| state.name())
            .map(convert_state)
            .unwrap_or(InstanceState::Unknown);

        let network_interfaces = instance
            .network_interfaces()
            .iter()
            .map(|interface| NetworkInterface {
                addresses: interface
                    .private_ip_addresses()
                    .iter()
                    .map(|address| InterfaceAddress {
                        private_ip: address.private_ip_address().map(str::to_owned),
                        public_ip: address
                            .association()
                            .and_then(|association| association.public_ip())
                            .map(str::to_owned),
                    })
                    .collect(),
            })
            .collect();

        Ok(Some(InstanceDescription {
            state,
            network_interfaces,
        }))
    }

    async fn start_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        self.client
            .start_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|err| cloud_error("StartInstances", err))?;
        Ok(())
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        self.client
            .stop_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|err| cloud_error("StopInstances", err))?;
        Ok(())
    }
}
