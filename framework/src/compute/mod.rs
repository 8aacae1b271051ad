// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provider-agnostic node provisioning.
//!
//! Each provider turns a [`ProvisionSpec`] into a reachable node and back
//! again: create the machine, poll its state to running with a deadline,
//! attach data volumes, and register any addressing the environment needs;
//! teardown is the mirror image. Providers differ only in the API driven
//! underneath.

pub mod aws;
pub mod baremetal;
pub mod ibm_vpc;
pub mod openstack;
mod rest;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ProviderCredentials;
use crate::ssh;

pub use aws::AwsEc2;
pub use baremetal::Baremetal;
pub use ibm_vpc::IbmVpc;
pub use openstack::OpenStack;

/// How long a node may take to reach its running state.
pub(crate) const CREATE_TIMEOUT: Duration = Duration::from_secs(1200);
pub(crate) const CREATE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How long a deleted node may take to disappear from the provider.
pub(crate) const DELETE_TIMEOUT: Duration = Duration::from_secs(600);
pub(crate) const DELETE_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) const VOLUME_POLL_TRIES: u32 = 10;
pub(crate) const VOLUME_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Gap between concurrent destroy launches during pattern cleanup, to avoid
/// hammering provider rate limits.
pub(crate) const CLEANUP_STAGGER: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("node operation failed: {0}")]
    NodeError(String),

    #[error("volume operation failed: {0}")]
    VolumeOpFailure(String),

    #[error("network operation failed: {0}")]
    NetworkOpFailure(String),

    #[error("node deletion failed: {0}")]
    NodeDeleteFailure(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("expected exactly one match for {0}")]
    ExactMatchFailed(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Ssh(#[from] ssh::Error),
}

/// The provider backing a run. The string forms are the `node_type` values
/// recorded on provisioned nodes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openstack,
    #[strum(serialize = "ibmc")]
    #[serde(rename = "ibmc")]
    Ibmc,
    Aws,
    Baremetal,
}

/// Everything a provider needs to materialise one node.
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    pub node_name: String,

    /// Image name, or an image id where the provider accepts one directly.
    pub image: String,

    /// Flavor / profile / instance type, per provider vocabulary.
    pub size: String,

    /// Candidate networks (OpenStack) or subnet names (IBM). Unused by
    /// providers with fixed network configuration.
    pub networks: Vec<String>,

    pub volume_count: u32,
    pub volume_size_gib: u32,

    /// cloud-init payload.
    pub userdata: Option<String>,

    /// Role strings riding along for provider-side tagging.
    pub roles: Vec<String>,
}

/// What a provisioned node looks like to the rest of the harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDetails {
    /// Provider-side identifier.
    pub id: String,
    pub name: String,
    pub ip_address: String,
    pub floating_ips: Vec<String>,
    pub hostname: String,

    /// CIDR of the subnet the primary address lives in, when known.
    pub subnet: String,

    pub volume_count: u32,
    pub node_type: ProviderKind,
}

impl NodeDetails {
    /// The hostname up to the first dot.
    pub fn shortname(&self) -> &str {
        self.hostname.split('.').next().unwrap_or(&self.hostname)
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn node_type(&self) -> ProviderKind;

    async fn create(
        &self,
        spec: &ProvisionSpec,
    ) -> Result<NodeDetails, ComputeError>;

    async fn destroy(&self, node: &NodeDetails) -> Result<(), ComputeError>;

    /// Destroys every node whose name matches `pattern`
    /// (case-insensitively). Returns how many were destroyed.
    async fn cleanup(&self, pattern: &str) -> Result<usize, ComputeError>;
}

/// Builds the provider selected for this run from the credentials file.
pub async fn build_provider(
    kind: ProviderKind,
    creds: &ProviderCredentials,
) -> anyhow::Result<Arc<dyn Provider>> {
    Ok(match kind {
        ProviderKind::Openstack => {
            let creds = creds
                .openstack
                .clone()
                .context("no openstack credentials configured")?;
            Arc::new(OpenStack::new(creds)?)
        }
        ProviderKind::Ibmc => {
            let creds =
                creds.ibm.clone().context("no ibm credentials configured")?;
            Arc::new(IbmVpc::new(creds)?)
        }
        ProviderKind::Aws => {
            let creds =
                creds.aws.clone().context("no aws credentials configured")?;
            Arc::new(AwsEc2::new(creds).await)
        }
        ProviderKind::Baremetal => {
            let creds = creds
                .baremetal
                .clone()
                .context("no baremetal credentials configured")?;
            Arc::new(Baremetal::new(creds))
        }
    })
}

/// Case-insensitive containment match used by every provider's cleanup.
pub(crate) fn name_matches(name: &str, pattern: &str) -> bool {
    name.to_lowercase().contains(&pattern.to_lowercase())
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::{name_matches, NodeDetails, ProviderKind};

    #[test]
    fn provider_kinds_parse_their_node_type_strings() {
        assert_eq!(
            ProviderKind::from_str("openstack").unwrap(),
            ProviderKind::Openstack
        );
        assert_eq!(ProviderKind::from_str("ibmc").unwrap(), ProviderKind::Ibmc);
        assert_eq!(ProviderKind::from_str("aws").unwrap(), ProviderKind::Aws);
        assert_eq!(ProviderKind::Ibmc.to_string(), "ibmc");
        assert!(ProviderKind::from_str("gcp").is_err());
    }

    #[test]
    fn shortname_stops_at_the_first_dot() {
        let details = NodeDetails {
            id: "abc".into(),
            name: "ceph-ci-1-node1-mon".into(),
            ip_address: "10.0.0.4".into(),
            floating_ips: vec![],
            hostname: "ceph-ci-1-node1-mon.example.com".into(),
            subnet: "10.0.0.0/24".into(),
            volume_count: 0,
            node_type: ProviderKind::Openstack,
        };
        assert_eq!(details.shortname(), "ceph-ci-1-node1-mon");
    }

    #[test]
    fn cleanup_matching_ignores_case() {
        assert!(name_matches("Ceph-Jenkins-42-node1", "-jenkins-"));
        assert!(!name_matches("ceph-manual-node1", "-jenkins-"));
    }
}
