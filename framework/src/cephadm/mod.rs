// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for `cephadm`, the containerized Ceph deployment tool.
//!
//! Every command funnels through the cluster's installer node: one-shot
//! invocations run inside `cephadm shell`, so nothing but the `cephadm`
//! binary itself has to be installed on the hosts. The orchestrator is
//! eventually consistent, so mutations are confirmed by polling the
//! matching `ceph orch ... -f json` read-back instead of trusting the
//! apply's exit status.

mod bootstrap;

pub use bootstrap::{BootstrapConfig, Registry};

use std::time::Duration;

use anyhow::{bail, Context};
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, Node, Role};
use crate::ssh;

/// Timeout for a one-shot `cephadm shell` invocation.
const SHELL_TIMEOUT: Duration = Duration::from_secs(300);

/// How often orchestrator read-backs are retried.
const ORCH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Deadline for a core service (mon, mgr, osd, mds, rgw) to converge.
const SERVICE_TIMEOUT: Duration = Duration::from_secs(600);

/// The monitoring stack pulls additional images and routinely takes
/// longer than the core daemons.
const MONITORING_TIMEOUT: Duration = Duration::from_secs(900);

/// Everything `deploy` rolls out on top of a provisioned cluster.
#[derive(Debug, Clone, Default)]
pub struct DeploymentPlan {
    /// Yum repo holding the `cephadm` RPM. When unset the package is
    /// assumed to be preinstalled on the installer node.
    pub tool_repo: Option<String>,
    pub bootstrap: BootstrapConfig,
}

/// Handle for driving `cephadm` against one cluster.
pub struct CephAdm<'c> {
    cluster: &'c Cluster,
    image: Option<String>,
}

impl<'c> CephAdm<'c> {
    pub fn new(cluster: &'c Cluster, image: Option<String>) -> Self {
        Self { cluster, image }
    }

    pub fn cluster(&self) -> &'c Cluster {
        self.cluster
    }

    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    /// Runs `args` inside a one-shot `cephadm shell` on the installer.
    pub async fn shell(&self, args: &str) -> anyhow::Result<ssh::Output> {
        self.shell_timeout(args, SHELL_TIMEOUT).await
    }

    /// [`CephAdm::shell`] with a caller-chosen timeout, for commands
    /// that legitimately run long (benchmarks, reweights).
    pub async fn shell_timeout(
        &self,
        args: &str,
        timeout: Duration,
    ) -> anyhow::Result<ssh::Output> {
        let installer = self.cluster.installer()?;
        let cmd = match &self.image {
            Some(image) => {
                format!("sudo cephadm -v --image {image} shell -- {args}")
            }
            None => format!("sudo cephadm -v shell -- {args}"),
        };
        debug!(node = %installer.shortname(), %cmd, "cephadm shell");
        Ok(installer.check_exec_timeout(&cmd, timeout).await?)
    }

    /// Runs a `ceph` CLI command inside the shell.
    pub async fn ceph(&self, args: &str) -> anyhow::Result<ssh::Output> {
        self.shell(&format!("ceph {args}")).await
    }

    /// Runs a `ceph` command with `-f json` and parses the output. Some
    /// commands print nothing on success; that maps to an empty object.
    pub async fn ceph_json(&self, args: &str) -> anyhow::Result<Value> {
        let out = self.ceph(&format!("{args} -f json")).await?;
        let trimmed = out.stdout.trim();
        if trimmed.is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(trimmed)
            .with_context(|| format!("unparseable json from `ceph {args}`"))
    }

    /// Enables `tool_repo` on the installer and installs the `cephadm`
    /// RPM from it.
    pub async fn install(&self, tool_repo: &str) -> anyhow::Result<()> {
        let installer = self.cluster.installer()?;
        info!(node = %installer.shortname(), repo = %tool_repo, "installing cephadm");
        installer
            .check_exec_sudo(&format!("dnf config-manager --add-repo {tool_repo}"))
            .await?;
        installer
            .check_exec_sudo("dnf install -y --nogpgcheck cephadm")
            .await?;
        let out = installer.check_exec("rpm -q cephadm").await?;
        info!(package = %out.stdout.trim(), "cephadm installed");
        Ok(())
    }

    /// Registers every node with the orchestrator. Bootstrap already
    /// covers the installer itself; the others need the cluster public
    /// key in root's `authorized_keys` before `ceph orch host add` can
    /// reach them.
    pub async fn add_hosts(&self) -> anyhow::Result<()> {
        let installer = self.cluster.installer()?;
        let pubkey = installer
            .check_exec_sudo("cat /etc/ceph/ceph.pub")
            .await
            .context("reading the cephadm public key")?;
        let pubkey = pubkey.stdout.trim().to_string();

        for node in self.cluster.nodes() {
            if node.hostname() == installer.hostname() {
                continue;
            }
            node.check_exec_sudo(&format!(
                "sh -c 'install -d -m 700 /root/.ssh && \
                 touch /root/.ssh/authorized_keys && \
                 grep -qxF \"{pubkey}\" /root/.ssh/authorized_keys || \
                 echo \"{pubkey}\" >> /root/.ssh/authorized_keys'"
            ))
            .await
            .with_context(|| {
                format!("authorizing the cephadm key on {}", node.shortname())
            })?;
            self.ceph(&format!(
                "orch host add {} {}",
                node.shortname(),
                node.ip_address()
            ))
            .await?;
        }

        let wanted: Vec<&str> =
            self.cluster.nodes().map(Node::shortname).collect();
        let deadline = Instant::now() + SERVICE_TIMEOUT;
        loop {
            let listed = self.ceph_json("orch host ls").await?;
            let known = listed_hostnames(&listed);
            let missing: Vec<&str> = wanted
                .iter()
                .copied()
                .filter(|w| !known.iter().any(|k| k == w))
                .collect();
            if missing.is_empty() {
                info!(hosts = wanted.len(), "all hosts registered with the orchestrator");
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "hosts [{}] never appeared in `ceph orch host ls`",
                    missing.join(", ")
                );
            }
            debug!(missing = %missing.join(", "), "waiting for orchestrator host list");
            sleep(ORCH_POLL_INTERVAL).await;
        }
    }

    /// Adds an orchestrator label to a host and waits for it to show up
    /// in the host listing.
    pub async fn label_host(&self, host: &str, label: &str) -> anyhow::Result<()> {
        self.ceph(&format!("orch host label add {host} {label}")).await?;

        let deadline = Instant::now() + SERVICE_TIMEOUT;
        loop {
            let listed = self.ceph_json("orch host ls").await?;
            if host_labels(&listed, host).iter().any(|l| l == label) {
                debug!(%host, %label, "label visible");
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("label {label} never appeared on host {host}");
            }
            sleep(ORCH_POLL_INTERVAL).await;
        }
    }

    /// Applies a service spec with a `{count};host1;host2` placement and
    /// waits until the orchestrator lists the service.
    pub async fn apply(&self, service: &str, placement: &str) -> anyhow::Result<()> {
        info!(%service, %placement, "applying service");
        self.ceph(&format!("orch apply {service} '{placement}'")).await?;

        let name = service_name(service);
        let deadline = Instant::now() + SERVICE_TIMEOUT;
        loop {
            let listed = self.ceph_json("orch ls").await?;
            if has_service(&listed, &name) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("service {name} never appeared in `ceph orch ls`");
            }
            sleep(ORCH_POLL_INTERVAL).await;
        }
    }

    /// Turns every unused disk on `node` into an OSD. Returns how many
    /// were added; callers pair this with [`CephAdm::wait_for_daemons`].
    pub async fn add_osds(&self, node: &Node) -> anyhow::Result<usize> {
        let source = node.check_exec("findmnt -v -n -T / -o SOURCE").await?;
        let boot = parent_disk(source.stdout.trim());
        let listing = node.check_exec("lsblk -np -r -o NAME,TYPE").await?;
        let disks = data_disks(&listing.stdout, &boot);
        info!(
            host = %node.shortname(),
            boot = %boot,
            disks = disks.len(),
            "adding osds"
        );
        for disk in &disks {
            self.ceph(&format!(
                "orch device zap {} {disk} --force",
                node.shortname()
            ))
            .await?;
            self.ceph(&format!(
                "orch daemon add osd {}:{disk}",
                node.shortname()
            ))
            .await?;
        }
        Ok(disks.len())
    }

    /// Creates a CephX client identity for `node` and installs its
    /// keyring and `ceph.conf` under `/etc/ceph`.
    pub async fn add_client(&self, node: &Node) -> anyhow::Result<()> {
        let name = format!("client.{}", node.shortname());
        let keyring = self
            .ceph(&format!(
                "auth get-or-create {name} \
                 mon 'allow *' osd 'allow *' mds 'allow *' mgr 'allow *'"
            ))
            .await?;

        node.check_exec_sudo("mkdir -p /etc/ceph").await?;
        node.check_exec_sudo("chmod 777 /etc/ceph").await?;

        let path = format!("/etc/ceph/ceph.{name}.keyring");
        node.write_file(&path, keyring.stdout.as_bytes()).await?;
        node.check_exec_sudo(&format!("chmod 0644 {path}")).await?;

        let installer = self.cluster.installer()?;
        let conf = installer.check_exec_sudo("cat /etc/ceph/ceph.conf").await?;
        node.write_file("/etc/ceph/ceph.conf", conf.stdout.as_bytes())
            .await?;
        node.check_exec_sudo("chmod 0644 /etc/ceph/ceph.conf").await?;
        info!(host = %node.shortname(), %name, "client configured");
        Ok(())
    }

    /// Polls `ceph orch ps` until at least `expected` daemons of
    /// `daemon_type` report `running`.
    pub async fn wait_for_daemons(
        &self,
        daemon_type: &str,
        expected: usize,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let ps = self.ceph_json("orch ps").await?;
            let running = running_daemons(&ps, daemon_type);
            if running >= expected {
                info!(%daemon_type, running, "daemons running");
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "{running}/{expected} {daemon_type} daemons running after {}s",
                    timeout.as_secs()
                );
            }
            debug!(%daemon_type, running, expected, "waiting for daemons");
            sleep(ORCH_POLL_INTERVAL).await;
        }
    }

    /// Reads back the container image the bootstrapped daemons run, from
    /// `cephadm ls` on the installer.
    pub async fn fetch_image(&self) -> anyhow::Result<String> {
        let installer = self.cluster.installer()?;
        let out = installer.check_exec_sudo("cephadm ls").await?;
        let listed: Value = serde_json::from_str(out.stdout.trim())
            .context("unparseable output of `cephadm ls`")?;
        first_image(&listed).context("no deployed daemon reports a container image")
    }

    /// Full rollout: install, bootstrap, register and label hosts, apply
    /// one service per role, create OSDs and clients.
    pub async fn deploy(&mut self, plan: &DeploymentPlan) -> anyhow::Result<()> {
        if let Some(repo) = &plan.tool_repo {
            self.install(repo).await?;
        }
        self.bootstrap(&plan.bootstrap).await?;
        if self.image.is_none() {
            self.image = Some(self.fetch_image().await?);
        }
        self.add_hosts().await?;

        for node in self.cluster.nodes() {
            for role in &node.roles {
                self.label_host(node.shortname(), &role.to_string()).await?;
            }
        }

        self.apply_role_services().await?;

        let mut disks = 0;
        for node in self.cluster.nodes_with_role(&Role::Osd) {
            disks += self.add_osds(node).await?;
        }
        if disks > 0 {
            self.wait_for_daemons("osd", disks, SERVICE_TIMEOUT).await?;
        }

        for node in self.cluster.nodes_with_role(&Role::Client) {
            self.add_client(node).await?;
        }

        info!(cluster = %self.cluster.name, "deployment complete");
        Ok(())
    }

    async fn apply_role_services(&self) -> anyhow::Result<()> {
        let mons = self.role_hosts(&Role::Mon);
        if !mons.is_empty() {
            self.apply("mon", &placement(mons.len(), &mons)).await?;
            self.wait_for_daemons("mon", mons.len(), SERVICE_TIMEOUT).await?;
        }

        let mgrs = self.role_hosts(&Role::Mgr);
        if !mgrs.is_empty() {
            self.apply("mgr", &placement(mgrs.len(), &mgrs)).await?;
            self.wait_for_daemons("mgr", mgrs.len(), SERVICE_TIMEOUT).await?;
        }

        let mdss = self.role_hosts(&Role::Mds);
        if !mdss.is_empty() {
            // Harmless when the volume already exists.
            if let Err(e) = self.ceph("fs volume create cephfs").await {
                warn!(error = %e, "fs volume create reported failure");
            }
            self.apply("mds cephfs", &placement(mdss.len(), &mdss)).await?;
            self.wait_for_daemons("mds", mdss.len(), SERVICE_TIMEOUT).await?;
        }

        let rgws = self.role_hosts(&Role::Rgw);
        if !rgws.is_empty() {
            self.apply("rgw rgw", &placement(rgws.len(), &rgws)).await?;
            self.wait_for_daemons("rgw", rgws.len(), SERVICE_TIMEOUT).await?;
        }

        for (service, role) in [
            ("grafana", Role::Grafana),
            ("alertmanager", Role::Alertmanager),
            ("node-exporter", Role::NodeExporter),
        ] {
            let hosts = self.role_hosts(&role);
            if !hosts.is_empty() {
                self.apply(service, &placement(hosts.len(), &hosts)).await?;
                self.wait_for_daemons(service, hosts.len(), MONITORING_TIMEOUT)
                    .await?;
            }
        }

        Ok(())
    }

    fn role_hosts(&self, role: &Role) -> Vec<String> {
        self.cluster
            .nodes_with_role(role)
            .map(|n| n.shortname().to_string())
            .collect()
    }
}

/// Placement string in the `{count};host1;host2` form the orchestrator
/// accepts.
pub fn placement(count: usize, hosts: &[String]) -> String {
    format!("{count};{}", hosts.join(";"))
}

/// `orch apply mds cephfs` creates a service named `mds.cephfs`.
fn service_name(service: &str) -> String {
    service.split_whitespace().collect::<Vec<_>>().join(".")
}

fn has_service(ls: &Value, name: &str) -> bool {
    ls.as_array()
        .into_iter()
        .flatten()
        .any(|s| s["service_name"].as_str() == Some(name))
}

fn listed_hostnames(hosts: &Value) -> Vec<String> {
    hosts
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|h| h["hostname"].as_str())
        .map(String::from)
        .collect()
}

fn host_labels(hosts: &Value, host: &str) -> Vec<String> {
    hosts
        .as_array()
        .into_iter()
        .flatten()
        .filter(|h| h["hostname"].as_str() == Some(host))
        .flat_map(|h| h["labels"].as_array().into_iter().flatten())
        .filter_map(|l| l.as_str())
        .map(String::from)
        .collect()
}

fn running_daemons(ps: &Value, daemon_type: &str) -> usize {
    ps.as_array()
        .into_iter()
        .flatten()
        .filter(|d| d["daemon_type"].as_str() == Some(daemon_type))
        .filter(|d| d["status_desc"].as_str() == Some("running"))
        .count()
}

fn first_image(ls: &Value) -> Option<String> {
    ls.as_array()?.iter().find_map(|d| {
        d["container_image_name"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(String::from)
    })
}

/// Maps a partition back to its disk: `/dev/sda1` came from `/dev/sda`,
/// `/dev/nvme0n1p1` from `/dev/nvme0n1`.
fn parent_disk(source: &str) -> String {
    let base = source.trim_end_matches(|c: char| c.is_ascii_digit());
    match base.strip_suffix('p') {
        Some(prefix) if prefix.ends_with(|c: char| c.is_ascii_digit()) => {
            prefix.to_string()
        }
        _ => base.to_string(),
    }
}

fn data_disks(listing: &str, boot_disk: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            Some((parts.next()?, parts.next()?))
        })
        .filter(|(name, kind)| {
            *kind == "disk"
                && (boot_disk.is_empty() || !name.starts_with(boot_disk))
        })
        .map(|(name, _)| name.to_string())
        .collect()
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn placement_joins_hosts_with_semicolons() {
        let hosts = vec!["ceph-a".to_string(), "ceph-b".to_string()];
        assert_eq!(placement(2, &hosts), "2;ceph-a;ceph-b");
    }

    #[test]
    fn service_name_joins_spec_words() {
        assert_eq!(service_name("mon"), "mon");
        assert_eq!(service_name("mds cephfs"), "mds.cephfs");
    }

    #[test]
    fn running_daemons_counts_only_matching_running_entries() {
        let ps = json!([
            {"daemon_type": "mon", "status_desc": "running"},
            {"daemon_type": "mon", "status_desc": "starting"},
            {"daemon_type": "mgr", "status_desc": "running"},
            {"daemon_type": "mon", "status_desc": "running"},
        ]);
        assert_eq!(running_daemons(&ps, "mon"), 2);
        assert_eq!(running_daemons(&ps, "mgr"), 1);
        assert_eq!(running_daemons(&ps, "osd"), 0);
    }

    #[test]
    fn host_listing_exposes_hostnames_and_labels() {
        let ls = json!([
            {"hostname": "ceph-a", "addr": "10.0.0.4", "labels": ["mon", "mgr"]},
            {"hostname": "ceph-b", "addr": "10.0.0.5", "labels": []},
        ]);
        assert_eq!(listed_hostnames(&ls), vec!["ceph-a", "ceph-b"]);
        assert_eq!(host_labels(&ls, "ceph-a"), vec!["mon", "mgr"]);
        assert!(host_labels(&ls, "ceph-b").is_empty());
        assert!(host_labels(&ls, "ceph-c").is_empty());
    }

    #[test]
    fn first_image_skips_daemons_without_one() {
        let ls = json!([
            {"name": "osd.0", "container_image_name": ""},
            {"name": "mon.a", "container_image_name": "quay.io/ceph/ceph:v18"},
        ]);
        assert_eq!(
            first_image(&ls).as_deref(),
            Some("quay.io/ceph/ceph:v18")
        );
        assert_eq!(first_image(&json!([])), None);
    }

    #[test]
    fn parent_disk_strips_partition_suffixes() {
        assert_eq!(parent_disk("/dev/sda1"), "/dev/sda");
        assert_eq!(parent_disk("/dev/vdb"), "/dev/vdb");
        assert_eq!(parent_disk("/dev/nvme0n1p1"), "/dev/nvme0n1");
        assert_eq!(parent_disk("/dev/mapper/rhel-root"), "/dev/mapper/rhel-root");
    }

    #[test]
    fn data_disks_skip_the_boot_device() {
        let listing = "/dev/sda disk\n\
                       /dev/sda1 part\n\
                       /dev/sdb disk\n\
                       /dev/sdc disk\n\
                       /dev/sr0 rom\n";
        assert_eq!(
            data_disks(listing, "/dev/sda"),
            vec!["/dev/sdb", "/dev/sdc"]
        );
        assert_eq!(data_disks(listing, "").len(), 3);
    }
}
