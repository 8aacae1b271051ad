// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Baremetal provider. There is no cloud API here; machines are reserved
//! through a teuthology lock server and prepared for testing over SSH:
//! reimage, root login, disk wipe, reboot, test user.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{
    name_matches, ComputeError, NodeDetails, Provider, ProviderKind,
    ProvisionSpec,
};
use crate::config::BaremetalCredentials;
use crate::ssh;

/// A reimage reinstalls the OS from scratch; give it ample time.
const REIMAGE_TIMEOUT: Duration = Duration::from_secs(40 * 60);

const RECONNECT_TIMEOUT: Duration = Duration::from_secs(600);
const RECONNECT_INTERVAL: Duration = Duration::from_secs(20);

/// Hard reboots take at least this long before sshd could be back.
const REBOOT_GRACE: Duration = Duration::from_secs(60);

const TEST_USER: &str = "cephuser";
const READY_MARKER: &str = "/ceph-qa-ready";

#[derive(Clone)]
pub struct Baremetal {
    inner: Arc<Inner>,
}

struct Inner {
    creds: BaremetalCredentials,
}

#[derive(Debug, PartialEq)]
struct LockStatus {
    locked: bool,
    locked_by: Option<String>,
}

impl Baremetal {
    pub fn new(creds: BaremetalCredentials) -> Self {
        Self { inner: Arc::new(Inner { creds }) }
    }
}

impl Inner {
    fn auth(&self) -> ssh::Auth {
        match &self.creds.ssh_key_path {
            Some(path) => ssh::Auth::Key {
                key_path: Utf8PathBuf::from(path.clone()),
                passphrase: None,
            },
            None => ssh::Auth::Auto,
        }
    }

    /// Teuthology lives in a virtualenv on some lock servers.
    fn teuthology_cmd(&self, cmd: &str) -> String {
        match &self.creds.venv_path {
            Some(venv) => format!("source {venv}/bin/activate && {cmd}"),
            None => cmd.to_string(),
        }
    }

    async fn lock_status(
        &self,
        server: &mut ssh::Session,
        machine: &str,
    ) -> Result<LockStatus, ComputeError> {
        let cmd = self.teuthology_cmd(&format!("teuthology-lock --list {machine}"));
        let out = server.check_exec(&cmd).await?;
        parse_lock_status(&out.stdout, machine)
    }

    /// Reserves the machine under the configured owner. A machine held by
    /// someone else is never stolen.
    async fn lock_machine(
        &self,
        server: &mut ssh::Session,
        machine: &str,
    ) -> Result<(), ComputeError> {
        let owner = &self.creds.owner;

        let status = self.lock_status(server, machine).await?;
        if status.locked {
            let holder = status.locked_by.unwrap_or_default();
            if holder == *owner {
                debug!(machine, "already locked by us");
                return Ok(());
            }
            return Err(ComputeError::NodeError(format!(
                "{machine} is locked by {holder}"
            )));
        }

        let cmd = self.teuthology_cmd(&format!(
            "teuthology-lock --lock --owner {owner} {machine}"
        ));
        server.check_exec(&cmd).await?;

        let status = self.lock_status(server, machine).await?;
        if !(status.locked && status.locked_by.as_deref() == Some(owner)) {
            return Err(ComputeError::NodeError(format!(
                "lock of {machine} for {owner} did not take"
            )));
        }

        info!(machine, owner = %owner, "locked");
        Ok(())
    }

    /// Appends PermitRootLogin to sshd_config and copies the provisioning
    /// user's authorized keys to root, so the rest of the preparation can
    /// run as root directly.
    async fn enable_root_login(
        &self,
        provision: &mut ssh::Session,
    ) -> Result<(), ComputeError> {
        let user = &self.creds.provision_user;
        let cmd = format!(
            "sudo sh -c 'grep -qxF \"PermitRootLogin yes\" /etc/ssh/sshd_config || \
             echo \"PermitRootLogin yes\" >> /etc/ssh/sshd_config; \
             install -d -m 700 /root/.ssh; \
             install -m 600 /home/{user}/.ssh/authorized_keys /root/.ssh/authorized_keys; \
             systemctl restart sshd'"
        );
        provision.check_exec(&cmd).await?;
        Ok(())
    }

    /// Wipes every disk except the one the root filesystem lives on.
    async fn wipe_disks(
        &self,
        root: &mut ssh::Session,
        machine: &str,
    ) -> Result<(), ComputeError> {
        let disks = root.check_exec("lsblk -o NAME -d -n").await?;
        let root_source =
            root.check_exec("findmnt -v -n -T / -o SOURCE").await?;
        let root_parent = root
            .check_exec(
                r#"lsblk -o MOUNTPOINT,PKNAME -rn | awk '$1 == "/" { print $2 }'"#,
            )
            .await?;

        let root_source = root_source.stdout.trim().to_string();
        let parents: Vec<&str> =
            root_parent.stdout.split_whitespace().collect();

        for disk in disks.stdout.split_whitespace() {
            if root_source.contains(disk) || parents.contains(&disk) {
                debug!(machine, disk, "skipping root disk");
                continue;
            }
            match root.check_exec(&format!("wipefs -a --force /dev/{disk}")).await
            {
                Ok(_) => info!(machine, disk, "wiped"),
                Err(e) => warn!(machine, disk, error = %e, "wipefs failed"),
            }
        }
        Ok(())
    }

    async fn prepare_test_user(
        &self,
        root: &mut ssh::Session,
    ) -> Result<(), ComputeError> {
        let exists = root.exec(&format!("id -u {TEST_USER}")).await?;
        if !exists.success() {
            root.check_exec(&format!("useradd -m {TEST_USER}")).await?;
            root.check_exec(&format!(
                "install -d -m 700 -o {TEST_USER} -g {TEST_USER} \
                 /home/{TEST_USER}/.ssh"
            ))
            .await?;
            root.check_exec(&format!(
                "install -m 600 -o {TEST_USER} -g {TEST_USER} \
                 /root/.ssh/authorized_keys /home/{TEST_USER}/.ssh/authorized_keys"
            ))
            .await?;
        } else {
            debug!("reusing existing {TEST_USER} account");
        }

        root.check_exec(&format!(
            "echo '{TEST_USER} ALL=(ALL) NOPASSWD:ALL' > /etc/sudoers.d/{TEST_USER}"
        ))
        .await?;
        root.check_exec(&format!("touch {READY_MARKER}")).await?;
        Ok(())
    }
}

#[async_trait]
impl Provider for Baremetal {
    fn node_type(&self) -> ProviderKind {
        ProviderKind::Baremetal
    }

    async fn create(
        &self,
        spec: &ProvisionSpec,
    ) -> Result<NodeDetails, ComputeError> {
        let inner = &self.inner;
        let creds = &inner.creds;
        let machine = spec.node_name.clone();
        let (os_type, os_version) = split_os_image(&spec.image)?;
        let auth = inner.auth();

        let mut lock_server =
            ssh::connect(&creds.server, 22, &creds.user, &auth).await?;
        inner.lock_machine(&mut lock_server, &machine).await?;

        info!(machine = %machine, os_type, os_version, "reimaging");
        let reimage = inner.teuthology_cmd(&format!(
            "teuthology-reimage --os-type {os_type} --os-version {os_version} \
             {machine}"
        ));
        // teuthology-reimage is known to report retry exhaustion even after
        // a successful reimage, so the exit status is advisory; the
        // os-release check below is what counts.
        let out = lock_server.exec_timeout(&reimage, REIMAGE_TIMEOUT).await?;
        if !out.success() {
            warn!(
                machine = %machine,
                stderr = %out.stderr.trim(),
                "reimage exited nonzero, verifying os anyway"
            );
        }

        let mut provision = ssh::wait_for_reconnect(
            &machine,
            22,
            &creds.provision_user,
            &auth,
            RECONNECT_TIMEOUT,
            RECONNECT_INTERVAL,
        )
        .await?;

        let release = provision
            .check_exec("grep ^VERSION_ID= /etc/os-release")
            .await?;
        match os_release_version(&release.stdout) {
            Some(found) if found == os_version => {}
            found => {
                return Err(ComputeError::NodeError(format!(
                    "{machine} runs {found:?} after reimage, wanted {os_version}"
                )))
            }
        }

        inner.enable_root_login(&mut provision).await?;
        let mut root = ssh::connect(&machine, 22, "root", &auth).await?;
        inner.wipe_disks(&mut root, &machine).await?;

        // The reboot kills the channel mid-command; any error here is
        // expected.
        let _ = root.exec("/sbin/reboot -f > /dev/null 2>&1 &").await;
        info!(machine = %machine, "rebooting");
        sleep(REBOOT_GRACE).await;
        let mut root = ssh::wait_for_reconnect(
            &machine,
            22,
            "root",
            &auth,
            RECONNECT_TIMEOUT,
            RECONNECT_INTERVAL,
        )
        .await?;

        let leftover = root.exec("lsblk | grep ceph").await?;
        if !leftover.stdout.trim().is_empty() {
            return Err(ComputeError::NodeError(format!(
                "{machine} still has ceph disk entries after wipefs"
            )));
        }

        inner.prepare_test_user(&mut root).await?;

        let ip_address = root
            .check_exec("hostname -I")
            .await
            .ok()
            .and_then(|out| {
                out.stdout.split_whitespace().next().map(str::to_string)
            })
            .unwrap_or_else(|| machine.clone());

        info!(machine = %machine, ip = %ip_address, "machine is ready");

        Ok(NodeDetails {
            id: machine.clone(),
            name: machine.clone(),
            ip_address,
            floating_ips: Vec::new(),
            hostname: machine,
            subnet: String::new(),
            volume_count: spec.volume_count,
            node_type: ProviderKind::Baremetal,
        })
    }

    async fn destroy(&self, node: &NodeDetails) -> Result<(), ComputeError> {
        let inner = &self.inner;
        let creds = &inner.creds;
        let auth = inner.auth();

        let mut server =
            ssh::connect(&creds.server, 22, &creds.user, &auth).await?;
        let cmd = inner.teuthology_cmd(&format!(
            "teuthology-lock --unlock --owner {} {}",
            creds.owner, node.name
        ));
        server.check_exec(&cmd).await.map_err(|e| {
            ComputeError::NodeDeleteFailure(format!(
                "unlock of {} failed: {e}",
                node.name
            ))
        })?;

        info!(machine = %node.name, "unlocked");
        Ok(())
    }

    async fn cleanup(&self, pattern: &str) -> Result<usize, ComputeError> {
        let inner = &self.inner;
        let creds = &inner.creds;
        let auth = inner.auth();

        let mut server =
            ssh::connect(&creds.server, 22, &creds.user, &auth).await?;
        let list = server
            .check_exec(&inner.teuthology_cmd(&format!(
                "teuthology-lock --list --owner {}",
                creds.owner
            )))
            .await?;
        let entries: Vec<serde_json::Value> = serde_json::from_str(
            &list.stdout,
        )
        .map_err(|e| {
            ComputeError::NodeError(format!(
                "unparseable teuthology-lock listing: {e}"
            ))
        })?;

        let mut released = 0;
        for entry in &entries {
            let Some(name) = entry["name"].as_str() else { continue };
            if !name_matches(name, pattern) {
                continue;
            }

            let cmd = inner.teuthology_cmd(&format!(
                "teuthology-lock --unlock --owner {} {name}",
                creds.owner
            ));
            match server.check_exec(&cmd).await {
                Ok(_) => {
                    info!(machine = name, "unlocked");
                    released += 1;
                }
                Err(e) => warn!(machine = name, error = %e, "unlock failed"),
            }
        }

        Ok(released)
    }
}

/// Splits an image like `rhel-9.2` into os type and version.
fn split_os_image(image: &str) -> Result<(&str, &str), ComputeError> {
    image
        .rsplit_once('-')
        .filter(|(os_type, version)| {
            !os_type.is_empty() && !version.is_empty()
        })
        .ok_or_else(|| {
            ComputeError::NodeError(format!(
                "{image} is not an os/version pair like rhel-9.2"
            ))
        })
}

fn os_release_version(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.strip_prefix("VERSION_ID="))
        .map(|version| version.trim().trim_matches('"').to_string())
}

fn parse_lock_status(
    raw: &str,
    machine: &str,
) -> Result<LockStatus, ComputeError> {
    let entries: Vec<serde_json::Value> =
        serde_json::from_str(raw).map_err(|e| {
            ComputeError::NodeError(format!(
                "unparseable lock status for {machine}: {e}"
            ))
        })?;

    let Some(entry) = entries.first() else {
        return Err(ComputeError::ResourceNotFound(format!(
            "{machine} is not in the lock database"
        )));
    };

    Ok(LockStatus {
        locked: entry["locked"].as_bool().unwrap_or(false),
        locked_by: entry["locked_by"].as_str().map(str::to_string),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn image_splits_at_the_last_dash() {
        assert_eq!(split_os_image("rhel-9.2").unwrap(), ("rhel", "9.2"));
        assert_eq!(
            split_os_image("centos-stream-9").unwrap(),
            ("centos-stream", "9")
        );
        assert!(split_os_image("rhel").is_err());
        assert!(split_os_image("-9.2").is_err());
    }

    #[test]
    fn version_id_is_unquoted() {
        let text = "NAME=\"Red Hat Enterprise Linux\"\nVERSION_ID=\"9.2\"\n";
        assert_eq!(os_release_version(text).as_deref(), Some("9.2"));
        assert_eq!(os_release_version("NAME=x\n"), None);
    }

    #[test]
    fn lock_listing_reports_holder() {
        let raw = r#"[{"name": "argo026.ceph.example.com",
                       "locked": true,
                       "locked_by": "qe@magna002"}]"#;
        let status = parse_lock_status(raw, "argo026").unwrap();
        assert_eq!(
            status,
            LockStatus {
                locked: true,
                locked_by: Some("qe@magna002".to_string())
            }
        );

        let free = r#"[{"name": "argo027", "locked": false}]"#;
        let status = parse_lock_status(free, "argo027").unwrap();
        assert!(!status.locked);
        assert!(status.locked_by.is_none());

        assert!(matches!(
            parse_lock_status("[]", "argo028"),
            Err(ComputeError::ResourceNotFound(_))
        ));
    }
}
