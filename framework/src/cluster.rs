// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The in-memory model of a provisioned test cluster: typed Ceph roles,
//! nodes with cached SSH sessions, and cluster-wide lookups.

use std::time::Duration;

use anyhow::{bail, Context};
use tracing::debug;

use crate::compute::NodeDetails;
use crate::ssh;

const SSH_PORT: u16 = 22;

/// A service role a node carries, as written in the cluster layout.
#[derive(
    Debug, Clone, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Role {
    Mon,
    Mgr,
    Osd,
    Mds,
    Rgw,
    Iscsi,
    Client,
    Installer,
    Grafana,
    Alertmanager,
    NodeExporter,

    /// Anything the layout names that we have no special handling for.
    #[strum(default)]
    Other(String),
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        s.parse().unwrap_or_else(|_| Role::Other(s.to_string()))
    }
}

/// One provisioned machine. The SSH session is established lazily and
/// cached; a command that fails on a cached session is retried once on a
/// fresh connection.
pub struct Node {
    pub details: NodeDetails,
    pub roles: Vec<Role>,
    user: String,
    auth: ssh::Auth,
    session: tokio::sync::Mutex<Option<ssh::Session>>,
}

impl Node {
    pub fn new(
        details: NodeDetails,
        roles: Vec<Role>,
        user: impl Into<String>,
        auth: ssh::Auth,
    ) -> Self {
        Self {
            details,
            roles,
            user: user.into(),
            auth,
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.details.hostname
    }

    pub fn shortname(&self) -> &str {
        self.details.shortname()
    }

    pub fn ip_address(&self) -> &str {
        &self.details.ip_address
    }

    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }

    async fn connect(&self) -> Result<ssh::Session, ssh::Error> {
        ssh::connect(
            &self.details.ip_address,
            SSH_PORT,
            &self.user,
            &self.auth,
        )
        .await
    }

    async fn run(
        &self,
        cmd: &str,
        timeout: Option<Duration>,
    ) -> Result<ssh::Output, ssh::Error> {
        let mut guard = self.session.lock().await;

        if let Some(session) = guard.as_mut() {
            let result = match timeout {
                Some(t) => session.exec_timeout(cmd, t).await,
                None => session.exec(cmd).await,
            };
            match result {
                Ok(out) => return Ok(out),
                // The remote command may still be running; reconnecting
                // and rerunning it would double-execute.
                Err(e @ ssh::Error::CommandTimeout(..)) => return Err(e),
                Err(e) => {
                    debug!(
                        host = %self.details.ip_address,
                        error = %e,
                        "cached session failed, reconnecting"
                    );
                    *guard = None;
                }
            }
        }

        let mut session = self.connect().await?;
        let out = match timeout {
            Some(t) => session.exec_timeout(cmd, t).await?,
            None => session.exec(cmd).await?,
        };
        *guard = Some(session);
        Ok(out)
    }

    pub async fn exec(&self, cmd: &str) -> Result<ssh::Output, ssh::Error> {
        self.run(cmd, None).await
    }

    pub async fn exec_sudo(
        &self,
        cmd: &str,
    ) -> Result<ssh::Output, ssh::Error> {
        self.run(&format!("sudo {cmd}"), None).await
    }

    pub async fn exec_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<ssh::Output, ssh::Error> {
        self.run(cmd, Some(timeout)).await
    }

    /// Like [`exec`](Self::exec), but a nonzero exit status is an error.
    pub async fn check_exec(
        &self,
        cmd: &str,
    ) -> Result<ssh::Output, ssh::Error> {
        check(cmd, self.run(cmd, None).await?)
    }

    pub async fn check_exec_sudo(
        &self,
        cmd: &str,
    ) -> Result<ssh::Output, ssh::Error> {
        let cmd = format!("sudo {cmd}");
        check(&cmd, self.run(&cmd, None).await?)
    }

    pub async fn check_exec_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<ssh::Output, ssh::Error> {
        check(cmd, self.run(cmd, Some(timeout)).await?)
    }

    /// Writes `contents` to `path` on the node as the connecting user.
    pub async fn write_file(
        &self,
        path: &str,
        contents: &[u8],
    ) -> Result<(), ssh::Error> {
        let mut guard = self.session.lock().await;

        if let Some(session) = guard.as_mut() {
            match session.write_remote_file(path, contents).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(
                        host = %self.details.ip_address,
                        error = %e,
                        "cached session failed, reconnecting"
                    );
                    *guard = None;
                }
            }
        }

        let mut session = self.connect().await?;
        session.write_remote_file(path, contents).await?;
        *guard = Some(session);
        Ok(())
    }
}

fn check(cmd: &str, out: ssh::Output) -> Result<ssh::Output, ssh::Error> {
    if out.success() {
        Ok(out)
    } else {
        Err(ssh::Error::FailedCmd {
            cmd: cmd.to_string(),
            code: out.exit_status.unwrap_or(1),
            stderr: if out.stderr.is_empty() { out.stdout } else { out.stderr },
        })
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.details.name)
            .field("ip", &self.details.ip_address)
            .field("roles", &self.roles)
            .finish()
    }
}

/// A named set of nodes forming one Ceph cluster under test.
#[derive(Debug)]
pub struct Cluster {
    pub name: String,
    nodes: Vec<Node>,
}

impl Cluster {
    pub fn new(name: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self { name: name.into(), nodes }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes_with_role<'c>(
        &'c self,
        role: &Role,
    ) -> impl Iterator<Item = &'c Node> + 'c {
        let role = role.clone();
        self.nodes.iter().filter(move |node| node.has_role(&role))
    }

    pub fn first_with_role(&self, role: &Role) -> anyhow::Result<&Node> {
        self.nodes_with_role(role)
            .next()
            .with_context(|| format!("no node carries the {role} role"))
    }

    /// The node deployment commands run on: the one labelled `installer`,
    /// or the first mon when the layout names none.
    pub fn installer(&self) -> anyhow::Result<&Node> {
        if let Some(node) =
            self.nodes_with_role(&Role::Installer).next()
        {
            return Ok(node);
        }
        if let Some(node) = self.nodes_with_role(&Role::Mon).next() {
            return Ok(node);
        }
        bail!("cluster {} has neither an installer nor a mon node", self.name)
    }

    /// Looks a node up by its full hostname or its shortname.
    pub fn node_by_hostname(&self, hostname: &str) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| n.hostname() == hostname || n.shortname() == hostname)
    }

    /// Generates a keypair for `user` on the installer (if none exists)
    /// and appends its public key to `user`'s authorized_keys on every
    /// node, enabling passwordless SSH across the cluster.
    pub async fn distribute_ssh_keys(&self, user: &str) -> anyhow::Result<()> {
        let installer = self.installer()?;
        let home = format!("/home/{user}");

        installer
            .check_exec_sudo(&format!(
                "sh -c '[ -f {home}/.ssh/id_rsa ] || \
                 (install -d -m 700 -o {user} -g {user} {home}/.ssh && \
                 ssh-keygen -t rsa -N \"\" -q -f {home}/.ssh/id_rsa && \
                 chown {user}:{user} {home}/.ssh/id_rsa {home}/.ssh/id_rsa.pub)'"
            ))
            .await
            .context("generating cluster keypair")?;

        let pubkey = installer
            .check_exec_sudo(&format!("cat {home}/.ssh/id_rsa.pub"))
            .await
            .context("reading cluster public key")?;
        let pubkey = pubkey.stdout.trim().to_string();

        for node in &self.nodes {
            node.check_exec_sudo(&format!(
                "sh -c 'install -d -m 700 -o {user} -g {user} {home}/.ssh && \
                 touch {home}/.ssh/authorized_keys && \
                 grep -qxF \"{pubkey}\" {home}/.ssh/authorized_keys || \
                 echo \"{pubkey}\" >> {home}/.ssh/authorized_keys && \
                 chown {user}:{user} {home}/.ssh/authorized_keys'"
            ))
            .await
            .with_context(|| {
                format!("installing cluster key on {}", node.hostname())
            })?;
        }

        Ok(())
    }

    /// Appends an /etc/hosts entry for every cluster member on every node,
    /// for environments without working DNS.
    pub async fn write_hosts_file(&self) -> anyhow::Result<()> {
        let mut entries = Vec::new();
        for node in &self.nodes {
            let mut line = format!(
                "{} {}",
                node.ip_address(),
                node.hostname()
            );
            if node.shortname() != node.hostname() {
                line.push(' ');
                line.push_str(node.shortname());
            }
            entries.push(line);
        }

        for node in &self.nodes {
            for line in &entries {
                node.check_exec_sudo(&format!(
                    "sh -c 'grep -qxF \"{line}\" /etc/hosts || \
                     echo \"{line}\" >> /etc/hosts'"
                ))
                .await
                .with_context(|| {
                    format!("writing hosts entries on {}", node.hostname())
                })?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compute::ProviderKind;

    fn node(name: &str, hostname: &str, roles: &[&str]) -> Node {
        Node::new(
            NodeDetails {
                id: name.to_string(),
                name: name.to_string(),
                ip_address: "10.0.0.1".to_string(),
                floating_ips: Vec::new(),
                hostname: hostname.to_string(),
                subnet: String::new(),
                volume_count: 0,
                node_type: ProviderKind::Openstack,
            },
            roles.iter().map(|r| Role::from(*r)).collect(),
            "cephuser",
            ssh::Auth::Auto,
        )
    }

    #[test]
    fn role_strings_map_to_variants() {
        assert_eq!(Role::from("mon"), Role::Mon);
        assert_eq!(Role::from("node-exporter"), Role::NodeExporter);
        assert_eq!(
            Role::from("rbd-mirror"),
            Role::Other("rbd-mirror".to_string())
        );

        assert_eq!(Role::NodeExporter.to_string(), "node-exporter");
        assert_eq!(Role::Other("rbd-mirror".to_string()).to_string(), "rbd-mirror");
    }

    #[test]
    fn installer_falls_back_to_the_first_mon() {
        let cluster = Cluster::new(
            "ceph",
            vec![
                node("n1", "n1.example.com", &["osd"]),
                node("n2", "n2.example.com", &["mon", "mgr"]),
            ],
        );
        assert_eq!(cluster.installer().unwrap().hostname(), "n2.example.com");

        let explicit = Cluster::new(
            "ceph",
            vec![
                node("n1", "n1.example.com", &["mon"]),
                node("n2", "n2.example.com", &["installer", "mon"]),
            ],
        );
        assert_eq!(explicit.installer().unwrap().hostname(), "n2.example.com");

        let empty = Cluster::new("ceph", vec![node("n1", "n1", &["client"])]);
        assert!(empty.installer().is_err());
    }

    #[test]
    fn hostname_lookup_accepts_shortnames() {
        let cluster = Cluster::new(
            "ceph",
            vec![node("n1", "host1.lab.example.com", &["mon"])],
        );
        assert!(cluster.node_by_hostname("host1.lab.example.com").is_some());
        assert!(cluster.node_by_hostname("host1").is_some());
        assert!(cluster.node_by_hostname("host2").is_none());
    }

    #[test]
    fn role_filters_count_matches() {
        let cluster = Cluster::new(
            "ceph",
            vec![
                node("n1", "n1", &["mon", "osd"]),
                node("n2", "n2", &["osd"]),
                node("n3", "n3", &["client"]),
            ],
        );
        assert_eq!(cluster.nodes_with_role(&Role::Osd).count(), 2);
        assert_eq!(cluster.nodes_with_role(&Role::Mon).count(), 1);
        assert!(cluster.first_with_role(&Role::Mgr).is_err());
    }
}
