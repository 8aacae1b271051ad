// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Monitor daemon workflows: quorum inspection and moving mons between
//! hosts. Daemon-level mon surgery requires the orchestrator to stop
//! managing the mon service first, otherwise it undoes the change.

use std::time::Duration;

use anyhow::{bail, Context};
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::cephadm::{placement, CephAdm};
use crate::cluster::{Node, Role};

/// How long a mon add or remove may take to land in the mon dump.
const MON_CHANGE_TIMEOUT: Duration = Duration::from_secs(120);

const MON_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct MonitorWorkflows<'c> {
    ceph: &'c CephAdm<'c>,
}

impl<'c> MonitorWorkflows<'c> {
    pub fn new(ceph: &'c CephAdm<'c>) -> Self {
        Self { ceph }
    }

    /// Hands mon placement control to the caller (`managed = false`) or
    /// back to the orchestrator by re-applying the mon spec over the
    /// cluster's mon hosts.
    pub async fn set_mon_service_managed(&self, managed: bool) -> anyhow::Result<()> {
        if managed {
            let hosts: Vec<String> = self
                .ceph
                .cluster()
                .nodes_with_role(&Role::Mon)
                .map(|n| n.shortname().to_string())
                .collect();
            if hosts.is_empty() {
                bail!("no mon hosts to re-apply the mon service over");
            }
            self.ceph.apply("mon", &placement(hosts.len(), &hosts)).await?;
        } else {
            self.ceph.ceph("orch set-unmanaged mon").await?;
        }
        info!(managed, "mon service management changed");
        Ok(())
    }

    /// Adds a mon daemon on `node` and waits for it to join the monmap.
    pub async fn add_mon(&self, node: &Node) -> anyhow::Result<()> {
        self.ceph
            .ceph(&format!(
                "orch daemon add mon {}:{}",
                node.shortname(),
                node.ip_address()
            ))
            .await?;

        let deadline = Instant::now() + MON_CHANGE_TIMEOUT;
        loop {
            if self.mon_in_dump(node.shortname()).await? {
                info!(mon = %node.shortname(), "mon joined the monmap");
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "mon.{} never appeared in the mon dump",
                    node.shortname()
                );
            }
            debug!(mon = %node.shortname(), "waiting for mon to join");
            sleep(MON_POLL_INTERVAL).await;
        }
    }

    /// Removes the mon daemon on `node` and waits for it to leave the
    /// monmap.
    pub async fn remove_mon(&self, node: &Node) -> anyhow::Result<()> {
        self.ceph
            .ceph(&format!("orch daemon rm mon.{} --force", node.shortname()))
            .await?;

        let deadline = Instant::now() + MON_CHANGE_TIMEOUT;
        loop {
            if !self.mon_in_dump(node.shortname()).await? {
                info!(mon = %node.shortname(), "mon removed from the monmap");
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("mon.{} still in the mon dump", node.shortname());
            }
            debug!(mon = %node.shortname(), "waiting for mon removal");
            sleep(MON_POLL_INTERVAL).await;
        }
    }

    pub async fn quorum_leader(&self) -> anyhow::Result<String> {
        let status = self.ceph.ceph_json("quorum_status").await?;
        status["quorum_leader_name"]
            .as_str()
            .map(String::from)
            .context("quorum status reports no leader")
    }

    pub async fn quorum_hosts(&self) -> anyhow::Result<Vec<String>> {
        let status = self.ceph.ceph_json("quorum_status").await?;
        Ok(quorum_names(&status))
    }

    /// Nominates `node` as the stretch-mode tiebreaker and verifies the
    /// monmap picked it up.
    pub async fn set_tiebreaker(&self, node: &Node) -> anyhow::Result<()> {
        self.ceph
            .ceph(&format!("mon set_new_tiebreaker {}", node.shortname()))
            .await?;

        let dump = self.ceph.ceph_json("mon dump").await?;
        match dump["tiebreaker_mon"].as_str() {
            Some(current) if current == node.shortname() => {
                info!(mon = %node.shortname(), "tiebreaker mon set");
                Ok(())
            }
            current => bail!(
                "tiebreaker mon is {current:?} after nominating {}",
                node.shortname()
            ),
        }
    }

    pub async fn mon_exists_on_host(&self, host: &str) -> anyhow::Result<bool> {
        let ps = self.ceph.ceph_json("orch ps --daemon_type mon").await?;
        Ok(ps
            .as_array()
            .into_iter()
            .flatten()
            .any(|d| d["hostname"].as_str() == Some(host)))
    }

    async fn mon_in_dump(&self, name: &str) -> anyhow::Result<bool> {
        let dump = self.ceph.ceph_json("mon dump").await?;
        Ok(mon_names(&dump).iter().any(|m| m == name))
    }
}

fn mon_names(dump: &Value) -> Vec<String> {
    dump["mons"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|m| m["name"].as_str())
        .map(String::from)
        .collect()
}

fn quorum_names(status: &Value) -> Vec<String> {
    status["quorum_names"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn mon_dump_names_are_extracted() {
        let dump = json!({
            "epoch": 5,
            "mons": [
                {"rank": 0, "name": "ceph-a"},
                {"rank": 1, "name": "ceph-b"},
                {"rank": 2, "name": "ceph-c"},
            ],
        });
        assert_eq!(mon_names(&dump), vec!["ceph-a", "ceph-b", "ceph-c"]);
        assert!(mon_names(&json!({})).is_empty());
    }

    #[test]
    fn quorum_status_lists_member_names() {
        let status = json!({
            "quorum_leader_name": "ceph-a",
            "quorum_names": ["ceph-a", "ceph-c"],
        });
        assert_eq!(quorum_names(&status), vec!["ceph-a", "ceph-c"]);
    }
}
