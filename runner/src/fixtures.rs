// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Run-level fixtures: provision (or reload) the cluster and deploy Ceph
//! before any test runs, check health and the crash ledger around every
//! test, and tear the nodes down at the end.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use camino::Utf8Path;
use cephci_framework::cephadm::{BootstrapConfig, DeploymentPlan};
use cephci_framework::compute::{
    self, NodeDetails, Provider, ProviderKind, ProvisionSpec,
};
use cephci_framework::config::{
    load_layout, load_yaml, node_name, ClusterConf, CredentialsFile,
    InventoryFile, ProviderCredentials,
};
use cephci_framework::rados::RadosOrchestrator;
use cephci_framework::ssh;
use cephci_framework::{
    Cluster, Framework, FrameworkParameters, Node, Parallel, Role,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RunOptions;

/// Account every cluster node is driven through.
const NODE_USER: &str = "cephuser";

/// Data volume size when the layout names no disk-size.
const DEFAULT_VOLUME_GIB: u32 = 20;

/// Deadline for a freshly deployed cluster to settle into HEALTH_OK.
const DEPLOY_HEALTH_TIMEOUT: Duration = Duration::from_secs(600);

/// Deadline for the cluster to be healthy again before the next test.
const TEST_HEALTH_TIMEOUT: Duration = Duration::from_secs(300);

/// Gap between concurrent destroy launches at teardown.
const TEARDOWN_STAGGER: Duration = Duration::from_secs(3);

/// Provisions the cluster (or reloads it from a `--reuse` state file),
/// deploys Ceph onto it, and hands back the context tests run against plus
/// the fixtures the worker drives around each test.
pub async fn execution_setup(
    run_opts: &RunOptions,
) -> anyhow::Result<(Arc<Framework>, TestFixtures)> {
    let credentials: CredentialsFile = load_yaml(&run_opts.credentials)?;
    let inventory: InventoryFile = load_yaml(&run_opts.inventory)?;
    let layout =
        load_layout(&run_opts.cluster_conf, run_opts.overrides.as_deref())?;
    let conf = layout
        .clusters()
        .next()
        .context("cluster layout defines no ceph-cluster")?;
    if layout.clusters().count() > 1 {
        warn!("layout defines several clusters; only the first is provisioned");
    }

    let provider =
        compute::build_provider(run_opts.provider, &credentials.globals)
            .await?;
    let auth = node_auth(run_opts.provider, &credentials.globals);

    let mut run_id = Uuid::new_v4().simple().to_string();
    run_id.truncate(8);

    let cluster = match &run_opts.reuse {
        Some(path) => {
            info!(state = %path, "reusing stored cluster");
            load_cluster_state(path, &auth)?
        }
        None => {
            let cluster = provision_cluster(
                &provider,
                conf,
                &inventory,
                &run_opts.tag,
                &run_id,
                &auth,
            )
            .await?;

            // Written before deployment so that a failed deploy still
            // leaves state to reuse or clean up by hand.
            if let Some(path) = &run_opts.store {
                store_cluster_state(path, &cluster).with_context(|| {
                    format!("writing cluster state to {path}")
                })?;
                info!(state = %path, "stored cluster state");
            }
            cluster
        }
    };

    let params = FrameworkParameters {
        run_id,
        provider: run_opts.provider,
        build_image: run_opts.build_image.clone(),
        test_timeout: Duration::from_secs(run_opts.test_timeout_secs),
        tmp_directory: run_opts.tmp_directory.clone(),
    };
    let ctx = Arc::new(Framework::new(params, cluster));

    if run_opts.reuse.is_none() {
        deploy_ceph(&ctx, run_opts).await?;
    }

    let node_details =
        ctx.cluster().nodes().map(|node| node.details.clone()).collect();
    let fixtures = TestFixtures {
        ctx: ctx.clone(),
        provider,
        node_details,
        keep_alive: run_opts.keep_alive,
        crash_baseline: Vec::new(),
    };

    Ok((ctx, fixtures))
}

/// Creates every node the layout names, concurrently, and assembles the
/// [`Cluster`].
async fn provision_cluster(
    provider: &Arc<dyn Provider>,
    conf: &ClusterConf,
    inventory: &InventoryFile,
    tag: &str,
    run_id: &str,
    auth: &ssh::Auth,
) -> anyhow::Result<Cluster> {
    let create = &inventory.instance.create;
    let userdata = inventory
        .instance
        .setup
        .as_ref()
        .and_then(|setup| setup.userdata.clone());

    let mut group = Parallel::new();
    for (key, node_conf) in conf.node_confs()? {
        let roles = node_conf.roles();

        // Baremetal machines are addressed by the hostname the layout
        // names; there is nothing to generate.
        let name = match provider.node_type() {
            ProviderKind::Baremetal => node_conf
                .hostname
                .clone()
                .with_context(|| format!("{key} names no hostname"))?,
            _ => node_name(&conf.name, tag, run_id, &key, &roles),
        };

        let spec = ProvisionSpec {
            node_name: name,
            image: node_conf
                .image_name
                .clone()
                .unwrap_or_else(|| create.image_name.clone()),
            size: node_conf
                .vm_size
                .clone()
                .unwrap_or_else(|| create.vm_size.clone()),
            networks: node_conf
                .networks
                .clone()
                .or_else(|| create.networks.clone())
                .unwrap_or_default(),
            volume_count: node_conf.no_of_volumes.unwrap_or(0),
            volume_size_gib: node_conf.disk_size.unwrap_or(DEFAULT_VOLUME_GIB),
            userdata: userdata.clone(),
            roles: roles.clone(),
        };

        let provider = provider.clone();
        group.spawn(async move {
            let details = provider
                .create(&spec)
                .await
                .with_context(|| format!("provisioning {}", spec.node_name))?;
            Ok((details, roles))
        });
    }

    if group.is_empty() {
        bail!("cluster layout defines no nodes");
    }

    info!(cluster = %conf.name, nodes = group.len(), "provisioning nodes");
    let provisioned = group.join_all().await?;

    let nodes = provisioned
        .into_iter()
        .map(|(details, roles)| {
            Node::new(
                details,
                roles.iter().map(|role| Role::from(role.as_str())).collect(),
                NODE_USER,
                auth.clone(),
            )
        })
        .collect();

    Ok(Cluster::new(conf.name.clone(), nodes))
}

/// Pre-flight on the raw nodes, then the full cephadm rollout, then a wait
/// for the cluster to report healthy.
async fn deploy_ceph(ctx: &Framework, run_opts: &RunOptions) -> anyhow::Result<()> {
    let cluster = ctx.cluster();
    cluster
        .distribute_ssh_keys(NODE_USER)
        .await
        .context("distributing cluster ssh keys")?;
    cluster.write_hosts_file().await.context("writing /etc/hosts entries")?;

    let plan = DeploymentPlan {
        tool_repo: run_opts.tool_repo.clone(),
        bootstrap: BootstrapConfig {
            image: run_opts.build_image.clone(),
            registry: run_opts.registry(),
            registry_json: run_opts.registry_json,
            ..Default::default()
        },
    };

    let mut cephadm = ctx.cephadm();
    cephadm.deploy(&plan).await.context("ceph deployment failed")?;

    let rados = RadosOrchestrator::new(&cephadm);
    rados.wait_until_healthy(DEPLOY_HEALTH_TIMEOUT).await?;
    Ok(())
}

/// Cloud nodes get the local default key via cloud-init userdata;
/// baremetal nodes use the key the credentials name, when present.
fn node_auth(kind: ProviderKind, creds: &ProviderCredentials) -> ssh::Auth {
    match kind {
        ProviderKind::Baremetal => match creds
            .baremetal
            .as_ref()
            .and_then(|baremetal| baremetal.ssh_key_path.clone())
        {
            Some(path) => {
                ssh::Auth::Key { key_path: path.into(), passphrase: None }
            }
            None => ssh::Auth::Auto,
        },
        _ => ssh::Auth::Auto,
    }
}

/// What `--store` writes and `--reuse` reads back: enough to rebuild the
/// [`Cluster`] without touching the provider.
#[derive(Debug, Serialize, Deserialize)]
struct StoredCluster {
    name: String,
    user: String,
    nodes: Vec<StoredNode>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredNode {
    details: NodeDetails,
    roles: Vec<String>,
}

fn store_cluster_state(path: &Utf8Path, cluster: &Cluster) -> anyhow::Result<()> {
    let stored = StoredCluster {
        name: cluster.name.clone(),
        user: NODE_USER.to_string(),
        nodes: cluster
            .nodes()
            .map(|node| StoredNode {
                details: node.details.clone(),
                roles: node.roles.iter().map(|role| role.to_string()).collect(),
            })
            .collect(),
    };

    let text = serde_json::to_string_pretty(&stored)?;
    std::fs::write(path, text)?;
    Ok(())
}

fn load_cluster_state(
    path: &Utf8Path,
    auth: &ssh::Auth,
) -> anyhow::Result<Cluster> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {path}"))?;
    let stored: StoredCluster = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse cluster state {path}"))?;

    let StoredCluster { name, user, nodes } = stored;
    let nodes = nodes
        .into_iter()
        .map(|node| {
            Node::new(
                node.details,
                node.roles
                    .iter()
                    .map(|role| Role::from(role.as_str()))
                    .collect(),
                user.clone(),
                auth.clone(),
            )
        })
        .collect();

    Ok(Cluster::new(name, nodes))
}

/// Fixtures the worker drives around each test and at the end of the run.
pub struct TestFixtures {
    ctx: Arc<Framework>,
    provider: Arc<dyn Provider>,
    node_details: Vec<NodeDetails>,
    keep_alive: bool,
    crash_baseline: Vec<String>,
}

impl TestFixtures {
    /// Requires a healthy cluster before the test starts and records the
    /// crash ledger as the baseline the post-test check diffs against.
    pub async fn test_setup(&mut self) -> anyhow::Result<()> {
        let cephadm = self.ctx.cephadm();
        let rados = RadosOrchestrator::new(&cephadm);
        rados.wait_until_healthy(TEST_HEALTH_TIMEOUT).await?;
        self.crash_baseline = rados.list_crashes().await?;
        Ok(())
    }

    /// Logs the cluster's health detail and fails if any daemon crashed
    /// while the test ran.
    pub async fn test_cleanup(&mut self) -> anyhow::Result<()> {
        let cephadm = self.ctx.cephadm();
        let rados = RadosOrchestrator::new(&cephadm);
        rados.log_cluster_health().await?;

        let new = rados.new_crashes_since(&self.crash_baseline).await?;
        if !new.is_empty() {
            bail!("daemons crashed during the test: {}", new.join(", "));
        }
        Ok(())
    }

    /// Destroys every node, unless the run asked to keep the cluster.
    /// Individual failures are logged and do not stop the rest.
    pub async fn execution_cleanup(self) -> anyhow::Result<()> {
        let TestFixtures { provider, node_details, keep_alive, .. } = self;

        if keep_alive {
            info!("--keep-alive set, leaving the cluster up");
            return Ok(());
        }

        info!(nodes = node_details.len(), "tearing the cluster down");
        let mut group = Parallel::new();
        for (i, details) in node_details.into_iter().enumerate() {
            let provider = provider.clone();
            group.spawn(async move {
                tokio::time::sleep(TEARDOWN_STAGGER * i as u32).await;
                provider
                    .destroy(&details)
                    .await
                    .with_context(|| format!("destroying {}", details.name))
            });
        }

        for result in group.join_all_settled().await {
            if let Err(e) = result {
                warn!(error = %e, "teardown failure");
            }
        }
        Ok(())
    }
}
