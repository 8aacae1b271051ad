// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! AWS EC2 provider, driven through the official SDK with static
//! credentials from the harness configuration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_ec2::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_ec2::types::{
    BlockDeviceMapping, EbsBlockDevice, Filter, Instance, InstanceType,
    ResourceType, Tag, TagSpecification, VolumeType,
};
use base64::Engine;
use tokio::time::sleep;
use tracing::{debug, info};

use super::{
    name_matches, ComputeError, NodeDetails, Provider, ProviderKind,
    ProvisionSpec, CLEANUP_STAGGER, CREATE_TIMEOUT, DELETE_TIMEOUT,
};
use crate::config::AwsCredentials;
use crate::parallel::Parallel;

/// EC2 state transitions are slow; poll at half the rate of the other
/// providers.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Data volumes map to /dev/sdf onward, which leaves this many letters.
const MAX_DATA_VOLUMES: u32 = 21;

const NOT_FOUND_CODE: &str = "InvalidInstanceID.NotFound";

#[derive(Clone)]
pub struct AwsEc2 {
    inner: Arc<Inner>,
}

struct Inner {
    client: aws_sdk_ec2::Client,
    creds: AwsCredentials,
}

impl AwsEc2 {
    pub async fn new(creds: AwsCredentials) -> Self {
        let provider = Credentials::new(
            creds.access_key.clone(),
            creds.access_secret.clone(),
            None,
            None,
            "cephci-config",
        );
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(creds.region.clone()))
            .credentials_provider(provider)
            .load()
            .await;
        let client = aws_sdk_ec2::Client::new(&config);

        Self { inner: Arc::new(Inner { client, creds }) }
    }
}

impl Inner {
    /// Fetches the instance's current state name, flattening the nested
    /// reservation structure.
    async fn instance_state(
        &self,
        instance_id: &str,
    ) -> Result<Option<(String, Instance)>, ComputeError> {
        let resp = self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await;

        let resp = match resp {
            Ok(resp) => resp,
            Err(e) if e.code() == Some(NOT_FOUND_CODE) => return Ok(None),
            Err(e) => {
                return Err(ComputeError::NodeError(format!(
                    "describe of {instance_id} failed: {}",
                    DisplayErrorContext(&e)
                )))
            }
        };

        let Some(instance) = resp
            .reservations()
            .first()
            .and_then(|r| r.instances().first())
        else {
            return Ok(None);
        };

        let state = instance
            .state()
            .and_then(|s| s.name())
            .map(|name| name.as_str().to_string())
            .unwrap_or_default();
        Ok(Some((state, instance.clone())))
    }

    async fn wait_for_state(
        &self,
        instance_id: &str,
        node_name: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<Option<Instance>, ComputeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            sleep(POLL_INTERVAL).await;
            match self.instance_state(instance_id).await? {
                None => return Ok(None),
                Some((state, instance)) if state == target => {
                    return Ok(Some(instance));
                }
                Some((state, _)) => {
                    // Reaching terminated while waiting for running means
                    // EC2 reaped the instance underneath us.
                    if target == "running"
                        && (state == "terminated" || state == "shutting-down")
                    {
                        return Err(ComputeError::NodeError(format!(
                            "{node_name} went to {state} during provisioning"
                        )));
                    }
                    debug!(node = node_name, state = %state, "still waiting");
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ComputeError::NodeError(format!(
                    "{node_name} did not reach {target} within {timeout:?}"
                )));
            }
        }
    }

    async fn subnet_cidr(&self) -> Result<String, ComputeError> {
        let resp = self
            .client
            .describe_subnets()
            .subnet_ids(&self.creds.subnet_id)
            .send()
            .await
            .map_err(|e| {
                ComputeError::NetworkOpFailure(format!(
                    "subnet lookup failed: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(resp
            .subnets()
            .first()
            .and_then(|s| s.cidr_block())
            .unwrap_or_default()
            .to_string())
    }

    async fn list_matching(
        &self,
        pattern: &str,
    ) -> Result<Vec<NodeDetails>, ComputeError> {
        let state_filter = Filter::builder()
            .name("instance-state-name")
            .values("pending")
            .values("running")
            .values("stopping")
            .values("stopped")
            .build();

        let mut matches = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut request =
                self.client.describe_instances().filters(state_filter.clone());
            if let Some(t) = &token {
                request = request.next_token(t);
            }
            let resp = request.send().await.map_err(|e| {
                ComputeError::NodeError(format!(
                    "instance listing failed: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

            for reservation in resp.reservations() {
                for instance in reservation.instances() {
                    let Some(name) = name_tag(instance) else { continue };
                    if !name_matches(name, pattern) {
                        continue;
                    }
                    let Some(id) = instance.instance_id() else { continue };

                    matches.push(details_from_instance(
                        id,
                        name,
                        instance,
                        String::new(),
                        0,
                    ));
                }
            }

            match resp.next_token() {
                Some(t) => token = Some(t.to_string()),
                None => break,
            }
        }

        Ok(matches)
    }
}

#[async_trait]
impl Provider for AwsEc2 {
    fn node_type(&self) -> ProviderKind {
        ProviderKind::Aws
    }

    async fn create(
        &self,
        spec: &ProvisionSpec,
    ) -> Result<NodeDetails, ComputeError> {
        let inner = &self.inner;
        let creds = &inner.creds;

        validate_security_groups(&creds.security_group_ids)?;
        if spec.volume_count > MAX_DATA_VOLUMES {
            return Err(ComputeError::VolumeOpFailure(format!(
                "{} data volumes requested, at most {MAX_DATA_VOLUMES} fit \
                 the device map",
                spec.volume_count
            )));
        }

        info!(
            node = %spec.node_name,
            image = %spec.image,
            instance_type = %spec.size,
            "launching instance"
        );

        let mut request = inner
            .client
            .run_instances()
            .image_id(&spec.image)
            .instance_type(InstanceType::from(spec.size.as_str()))
            .min_count(1)
            .max_count(1)
            .subnet_id(&creds.subnet_id)
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Instance)
                    .tags(
                        Tag::builder()
                            .key("Name")
                            .value(&spec.node_name)
                            .build(),
                    )
                    .build(),
            );
        for group in &creds.security_group_ids {
            request = request.security_group_ids(group);
        }
        if let Some(key_name) = &creds.key_name {
            request = request.key_name(key_name);
        }
        if let Some(userdata) = &spec.userdata {
            request = request.user_data(
                base64::engine::general_purpose::STANDARD.encode(userdata),
            );
        }
        for index in 0..spec.volume_count {
            request = request.block_device_mappings(
                BlockDeviceMapping::builder()
                    .device_name(device_name(index))
                    .ebs(
                        EbsBlockDevice::builder()
                            .volume_size(spec.volume_size_gib as i32)
                            .volume_type(VolumeType::Gp3)
                            .delete_on_termination(true)
                            .build(),
                    )
                    .build(),
            );
        }

        let resp = request.send().await.map_err(|e| {
            ComputeError::NodeError(format!(
                "launch of {} failed: {}",
                spec.node_name,
                DisplayErrorContext(&e)
            ))
        })?;
        let instance_id = resp
            .instances()
            .first()
            .and_then(|i| i.instance_id())
            .map(str::to_string)
            .ok_or_else(|| {
                ComputeError::NodeError(format!(
                    "launch of {} returned no instance",
                    spec.node_name
                ))
            })?;

        let instance = inner
            .wait_for_state(
                &instance_id,
                &spec.node_name,
                "running",
                CREATE_TIMEOUT,
            )
            .await?
            .ok_or_else(|| {
                ComputeError::NodeError(format!(
                    "{} disappeared while provisioning",
                    spec.node_name
                ))
            })?;

        let subnet = inner.subnet_cidr().await.unwrap_or_default();
        let details = details_from_instance(
            &instance_id,
            &spec.node_name,
            &instance,
            subnet,
            spec.volume_count,
        );

        info!(node = %spec.node_name, ip = %details.ip_address, "instance is running");
        Ok(details)
    }

    async fn destroy(&self, node: &NodeDetails) -> Result<(), ComputeError> {
        let inner = &self.inner;

        info!(node = %node.name, "terminating instance");
        let result = inner
            .client
            .terminate_instances()
            .instance_ids(&node.id)
            .send()
            .await;
        match result {
            Ok(_) => {}
            Err(e) if e.code() == Some(NOT_FOUND_CODE) => {
                info!(node = %node.name, "already gone");
                return Ok(());
            }
            Err(e) => {
                return Err(ComputeError::NodeDeleteFailure(format!(
                    "terminate of {} failed: {}",
                    node.name,
                    DisplayErrorContext(&e)
                )))
            }
        }

        inner
            .wait_for_state(&node.id, &node.name, "terminated", DELETE_TIMEOUT)
            .await
            .map_err(|e| {
                ComputeError::NodeDeleteFailure(format!(
                    "{} did not terminate: {e}",
                    node.name
                ))
            })?;

        info!(node = %node.name, "terminated");
        Ok(())
    }

    async fn cleanup(&self, pattern: &str) -> Result<usize, ComputeError> {
        let matches = self.inner.list_matching(pattern).await?;

        info!(pattern, count = matches.len(), "cleaning up instances");

        let mut group = Parallel::new();
        let total = matches.len();
        for node in matches {
            let provider = self.clone();
            group.spawn(async move {
                provider.destroy(&node).await?;
                Ok(())
            });
            sleep(CLEANUP_STAGGER).await;
        }
        group.join_all().await.map_err(|e| {
            ComputeError::NodeDeleteFailure(format!("cleanup failed: {e}"))
        })?;

        Ok(total)
    }
}

fn validate_security_groups(groups: &[String]) -> Result<(), ComputeError> {
    if groups.is_empty() {
        return Err(ComputeError::NetworkOpFailure(
            "no security groups configured".to_string(),
        ));
    }
    for group in groups {
        if !group.starts_with("sg-") {
            return Err(ComputeError::NetworkOpFailure(format!(
                "{group} is not a security group id"
            )));
        }
    }
    Ok(())
}

/// Device names for data volumes: /dev/sdf, /dev/sdg, ...
fn device_name(index: u32) -> String {
    let letter = (b'f' + index as u8) as char;
    format!("/dev/sd{letter}")
}

fn name_tag(instance: &Instance) -> Option<&str> {
    instance
        .tags()
        .iter()
        .find(|tag| tag.key() == Some("Name"))
        .and_then(|tag| tag.value())
}

fn details_from_instance(
    id: &str,
    name: &str,
    instance: &Instance,
    subnet: String,
    volume_count: u32,
) -> NodeDetails {
    let private_ip =
        instance.private_ip_address().unwrap_or_default().to_string();
    let floating_ips = instance
        .public_ip_address()
        .map(|ip| vec![ip.to_string()])
        .unwrap_or_default();
    let hostname = instance
        .private_dns_name()
        .filter(|dns| !dns.is_empty())
        .unwrap_or(name)
        .to_string();

    NodeDetails {
        id: id.to_string(),
        name: name.to_string(),
        ip_address: private_ip,
        floating_ips,
        hostname,
        subnet,
        volume_count,
        node_type: ProviderKind::Aws,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn data_volumes_map_from_sdf() {
        assert_eq!(device_name(0), "/dev/sdf");
        assert_eq!(device_name(1), "/dev/sdg");
        assert_eq!(device_name(20), "/dev/sdz");
    }

    #[test]
    fn security_groups_must_be_ids() {
        assert!(validate_security_groups(&["sg-0abc".to_string()]).is_ok());
        assert!(matches!(
            validate_security_groups(&[]),
            Err(ComputeError::NetworkOpFailure(_))
        ));
        assert!(matches!(
            validate_security_groups(&["default".to_string()]),
            Err(ComputeError::NetworkOpFailure(_))
        ));
    }

    #[test]
    fn name_tag_is_extracted_from_instance_tags() {
        let instance = Instance::builder()
            .set_tags(Some(vec![
                Tag::builder().key("owner").value("qe").build(),
                Tag::builder().key("Name").value("ceph-test-node1").build(),
            ]))
            .build();
        assert_eq!(name_tag(&instance), Some("ceph-test-node1"));

        let untagged = Instance::builder().build();
        assert_eq!(name_tag(&untagged), None);
    }
}
