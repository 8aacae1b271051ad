// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `cephadm bootstrap` invocation and its option surface.

use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tracing::info;

use super::CephAdm;
use crate::cluster::Role;

/// Bootstrap pulls the release image and starts the first mon and mgr;
/// slow registries dominate the runtime.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(1800);

/// Where the registry credential file lands on the installer.
const REGISTRY_JSON_PATH: &str = "/tmp/registry.json";

/// Login for a container registry that requires authentication before
/// the release image can be pulled.
#[derive(Debug, Clone)]
pub struct Registry {
    pub url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Image to bootstrap from. Falls back to the image the [`CephAdm`]
    /// handle was created with; when both are unset cephadm picks its
    /// packaged default.
    pub image: Option<String>,
    pub registry: Option<Registry>,
    /// Pass the registry as a `--registry-json` file instead of inline
    /// flags.
    pub registry_json: bool,
    /// Node whose address becomes `--mon-ip`. The first mon node when
    /// unset.
    pub mon_node: Option<String>,
    pub fsid: Option<String>,
    pub skip_monitoring_stack: bool,
    pub orphan_initial_daemons: bool,
    pub extra_args: Vec<String>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        // Monitoring and the initial daemon set are rolled out later
        // with explicit placements, so bootstrap skips both.
        Self {
            image: None,
            registry: None,
            registry_json: false,
            mon_node: None,
            fsid: None,
            skip_monitoring_stack: true,
            orphan_initial_daemons: true,
            extra_args: Vec::new(),
        }
    }
}

impl CephAdm<'_> {
    /// Bootstraps the cluster on the installer node.
    pub async fn bootstrap(&self, config: &BootstrapConfig) -> anyhow::Result<()> {
        let installer = self.cluster.installer()?;

        // Test users read and write keyrings under /etc/ceph.
        installer.check_exec_sudo("mkdir -p /etc/ceph").await?;
        installer.check_exec_sudo("chmod 777 /etc/ceph").await?;

        let registry_file = match &config.registry {
            Some(registry) if config.registry_json => {
                let payload = json!({
                    "url": registry.url,
                    "username": registry.username,
                    "password": registry.password,
                });
                installer
                    .write_file(REGISTRY_JSON_PATH, payload.to_string().as_bytes())
                    .await
                    .context("writing the registry credential file")?;
                Some(REGISTRY_JSON_PATH)
            }
            _ => None,
        };

        let mon_ip = self.mon_ip(config)?;
        let image = config.image.as_deref().or(self.image.as_deref());
        let cmd = compose_command(image, config, registry_file, &mon_ip);

        info!(node = %installer.shortname(), %mon_ip, "bootstrapping ceph");
        installer.check_exec_timeout(&cmd, BOOTSTRAP_TIMEOUT).await?;

        // The exit status alone does not prove the mon answers.
        self.ceph("-s")
            .await
            .context("cluster unreachable after bootstrap")?;
        info!("bootstrap complete");
        Ok(())
    }

    fn mon_ip(&self, config: &BootstrapConfig) -> anyhow::Result<String> {
        let node = match &config.mon_node {
            Some(name) => self.cluster.node_by_hostname(name).with_context(|| {
                format!("mon node {name} is not part of the cluster")
            })?,
            None => self.cluster.first_with_role(&Role::Mon)?,
        };
        Ok(node.ip_address().to_string())
    }
}

fn compose_command(
    image: Option<&str>,
    config: &BootstrapConfig,
    registry_file: Option<&str>,
    mon_ip: &str,
) -> String {
    let mut cmd = String::from("sudo cephadm -v");
    if let Some(image) = image {
        cmd.push_str(" --image ");
        cmd.push_str(image);
    }
    cmd.push_str(" bootstrap");

    if let Some(path) = registry_file {
        cmd.push_str(" --registry-json ");
        cmd.push_str(path);
    } else if let Some(registry) = &config.registry {
        cmd.push_str(&format!(
            " --registry-url {} --registry-username {} --registry-password {}",
            registry.url, registry.username, registry.password
        ));
    }

    if config.orphan_initial_daemons {
        cmd.push_str(" --orphan-initial-daemons");
    }
    if config.skip_monitoring_stack {
        cmd.push_str(" --skip-monitoring-stack");
    }
    if let Some(fsid) = &config.fsid {
        cmd.push_str(" --fsid ");
        cmd.push_str(fsid);
    }
    for arg in &config.extra_args {
        cmd.push(' ');
        cmd.push_str(arg);
    }

    cmd.push_str(" --mon-ip ");
    cmd.push_str(mon_ip);
    cmd
}

#[cfg(test)]
mod test {
    use super::*;

    fn registry() -> Registry {
        Registry {
            url: "registry.example.com".to_string(),
            username: "svc-pull".to_string(),
            password: "hunter2".to_string(),
        }
    }

    #[test]
    fn command_carries_inline_registry_flags() {
        let config = BootstrapConfig {
            registry: Some(registry()),
            ..Default::default()
        };
        let cmd = compose_command(
            Some("quay.io/ceph/ceph:v18"),
            &config,
            None,
            "10.0.0.5",
        );
        assert!(
            cmd.starts_with("sudo cephadm -v --image quay.io/ceph/ceph:v18 bootstrap"),
            "{cmd}"
        );
        assert!(cmd.contains("--registry-url registry.example.com"));
        assert!(cmd.contains("--registry-username svc-pull"));
        assert!(cmd.contains("--registry-password hunter2"));
        assert!(cmd.contains("--orphan-initial-daemons"));
        assert!(cmd.contains("--skip-monitoring-stack"));
        assert!(cmd.ends_with("--mon-ip 10.0.0.5"), "{cmd}");
    }

    #[test]
    fn registry_file_replaces_inline_flags() {
        let config = BootstrapConfig {
            registry: Some(registry()),
            registry_json: true,
            ..Default::default()
        };
        let cmd =
            compose_command(None, &config, Some("/tmp/registry.json"), "10.0.0.5");
        assert!(cmd.contains("--registry-json /tmp/registry.json"));
        assert!(!cmd.contains("--registry-url"));
        assert!(!cmd.contains("--image"));
    }

    #[test]
    fn optional_flags_are_omitted_when_unset() {
        let config = BootstrapConfig {
            skip_monitoring_stack: false,
            orphan_initial_daemons: false,
            fsid: Some("f64f341c-c2a4-44d4-b1d8-cbe1ea34cf7c".to_string()),
            extra_args: vec!["--allow-fqdn-hostname".to_string()],
            ..Default::default()
        };
        let cmd = compose_command(None, &config, None, "192.168.1.10");
        assert!(!cmd.contains("--skip-monitoring-stack"));
        assert!(!cmd.contains("--orphan-initial-daemons"));
        assert!(!cmd.contains("--registry"));
        assert!(cmd.contains("--fsid f64f341c-c2a4-44d4-b1d8-cbe1ea34cf7c"));
        assert!(cmd.contains(" --allow-fqdn-hostname "));
    }
}
