// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrappers over the `ceph` CLI for driving and inspecting a running
//! cluster. [`RadosOrchestrator`] covers pools, health, placement
//! groups, daemons and cluster configuration; monitor-specific and
//! object-level workflows live in [`mon`] and [`pool`].

pub mod mon;
pub mod pool;

pub use mon::MonitorWorkflows;
pub use pool::PoolFunctions;

use std::time::Duration;

use anyhow::{bail, Context};
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::cephadm::CephAdm;
use crate::cluster::Node;

/// Cadence of cluster state polls (health, PG states).
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Pool property changes take a moment to land in the osdmap.
const PROPERTY_SETTLE: Duration = Duration::from_secs(2);

/// The balancer evaluates the cluster on its own schedule after being
/// switched on.
const BALANCER_SETTLE: Duration = Duration::from_secs(10);

/// Options for [`RadosOrchestrator::create_pool`].
#[derive(Debug, Clone)]
pub struct PoolOpts {
    pub pg_num: u32,
    pub pg_num_max: Option<u32>,
    /// Erasure-code profile name; `None` creates a replicated pool.
    pub ec_profile: Option<String>,
    /// Application tag enabled on the pool after creation.
    pub app: String,
    pub size: Option<u32>,
}

impl Default for PoolOpts {
    fn default() -> Self {
        Self {
            pg_num: 64,
            pg_num_max: None,
            ec_profile: None,
            app: "rados".to_string(),
            size: None,
        }
    }
}

/// Snapshot of `ceph health detail`.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// `HEALTH_OK`, `HEALTH_WARN` or `HEALTH_ERR`.
    pub status: String,
    /// One `CODE: message` entry per active health check.
    pub checks: Vec<String>,
}

impl HealthStatus {
    pub fn is_ok(&self) -> bool {
        self.status == "HEALTH_OK"
    }
}

/// Command layer for a deployed cluster.
pub struct RadosOrchestrator<'c> {
    ceph: &'c CephAdm<'c>,
}

impl<'c> RadosOrchestrator<'c> {
    pub fn new(ceph: &'c CephAdm<'c>) -> Self {
        Self { ceph }
    }

    pub fn ceph(&self) -> &'c CephAdm<'c> {
        self.ceph
    }

    /// Runs `ceph {cmd} -f json` and parses the output.
    pub async fn run(&self, cmd: &str) -> anyhow::Result<Value> {
        self.ceph.ceph_json(cmd).await
    }

    pub async fn create_pool(&self, name: &str, opts: &PoolOpts) -> anyhow::Result<()> {
        let mut cmd = format!(
            "osd pool create {name} {pg} {pg}",
            pg = opts.pg_num
        );
        if let Some(profile) = &opts.ec_profile {
            cmd.push_str(&format!(" erasure {profile}"));
        }
        self.ceph.ceph(&cmd).await?;
        self.ceph
            .ceph(&format!(
                "osd pool application enable {name} {}",
                opts.app
            ))
            .await?;

        if let Some(size) = opts.size {
            self.set_pool_property(name, "size", &size.to_string()).await?;
        }
        if let Some(max) = opts.pg_num_max {
            self.set_pool_property(name, "pg_num_max", &max.to_string())
                .await?;
        }

        if !self.list_pools().await?.iter().any(|p| p == name) {
            bail!("pool {name} missing from `ceph df` after create");
        }
        info!(pool = %name, pg_num = opts.pg_num, "pool created");
        Ok(())
    }

    /// Deletes a pool. Pool deletion is disabled by default on the mons,
    /// so the guard config is switched on first.
    pub async fn delete_pool(&self, name: &str) -> anyhow::Result<()> {
        self.set_config("mon", "mon_allow_pool_delete", "true").await?;
        self.ceph
            .ceph(&format!(
                "osd pool delete {name} {name} --yes-i-really-really-mean-it"
            ))
            .await?;

        if self.list_pools().await?.iter().any(|p| p == name) {
            bail!("pool {name} still listed after delete");
        }
        info!(pool = %name, "pool deleted");
        Ok(())
    }

    pub async fn list_pools(&self) -> anyhow::Result<Vec<String>> {
        let df = self.run("df").await?;
        Ok(pool_names(&df))
    }

    pub async fn get_pool_property(
        &self,
        pool: &str,
        prop: &str,
    ) -> anyhow::Result<Value> {
        let out = self.run(&format!("osd pool get {pool} {prop}")).await?;
        Ok(out[prop].clone())
    }

    pub async fn set_pool_property(
        &self,
        pool: &str,
        prop: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        self.ceph
            .ceph(&format!("osd pool set {pool} {prop} {value}"))
            .await?;
        sleep(PROPERTY_SETTLE).await;
        Ok(())
    }

    /// Usage statistics for one pool from `ceph df detail`.
    pub async fn pool_stats(&self, pool: &str) -> anyhow::Result<Value> {
        let df = self.run("df detail").await?;
        df["pools"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|p| p["name"].as_str() == Some(pool))
            .cloned()
            .with_context(|| format!("pool {pool} not present in `ceph df detail`"))
    }

    pub async fn cluster_health(&self) -> anyhow::Result<HealthStatus> {
        let detail = self.run("health detail").await?;
        Ok(parse_health(&detail))
    }

    /// Logs the full health detail and returns the status string.
    pub async fn log_cluster_health(&self) -> anyhow::Result<String> {
        let health = self.cluster_health().await?;
        if health.checks.is_empty() {
            info!(status = %health.status, "cluster health");
        } else {
            info!(
                status = %health.status,
                checks = %health.checks.join("; "),
                "cluster health"
            );
        }
        Ok(health.status)
    }

    pub async fn wait_until_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let health = self.cluster_health().await?;
            if health.is_ok() {
                info!("cluster is HEALTH_OK");
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "cluster still {} after {}s: {}",
                    health.status,
                    timeout.as_secs(),
                    health.checks.join("; ")
                );
            }
            debug!(status = %health.status, "waiting for HEALTH_OK");
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Acting set of the object's PG, or of the pool's first PG when no
    /// object is given.
    pub async fn pg_acting_set(
        &self,
        pool: &str,
        object: Option<&str>,
    ) -> anyhow::Result<Vec<u32>> {
        let pgid = match object {
            Some(obj) => {
                let map = self.run(&format!("osd map {pool} {obj}")).await?;
                map["pgid"]
                    .as_str()
                    .map(String::from)
                    .context("`ceph osd map` reported no pgid")?
            }
            None => {
                let dump = self.run("osd dump").await?;
                let id = dump["pools"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .find(|p| p["pool_name"].as_str() == Some(pool))
                    .and_then(|p| p["pool"].as_u64())
                    .with_context(|| format!("pool {pool} not in `ceph osd dump`"))?;
                format!("{id}.0")
            }
        };
        let map = self.run(&format!("pg map {pgid}")).await?;
        Ok(map["up"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_u64)
            .map(|osd| osd as u32)
            .collect())
    }

    /// Polls `ceph pg stat` until every PG reports `active+clean`.
    pub async fn wait_for_clean_pgs(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let stat = self.run("pg stat").await?;
            if pgs_all_clean(&stat) {
                info!("all pgs active+clean");
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("placement groups not clean after {}s", timeout.as_secs());
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn run_scrub(&self, pool: &str) -> anyhow::Result<()> {
        self.ceph.ceph(&format!("osd pool scrub {pool}")).await?;
        Ok(())
    }

    pub async fn run_deep_scrub(&self, pool: &str) -> anyhow::Result<()> {
        self.ceph.ceph(&format!("osd pool deep-scrub {pool}")).await?;
        Ok(())
    }

    pub async fn restart_daemon(&self, daemon_type: &str, id: &str) -> anyhow::Result<()> {
        self.daemon_action("restart", daemon_type, id).await
    }

    pub async fn stop_daemon(&self, daemon_type: &str, id: &str) -> anyhow::Result<()> {
        self.daemon_action("stop", daemon_type, id).await
    }

    pub async fn start_daemon(&self, daemon_type: &str, id: &str) -> anyhow::Result<()> {
        self.daemon_action("start", daemon_type, id).await
    }

    async fn daemon_action(
        &self,
        action: &str,
        daemon_type: &str,
        id: &str,
    ) -> anyhow::Result<()> {
        info!(daemon = %format!("{daemon_type}.{id}"), %action, "daemon action");
        self.ceph
            .ceph(&format!("orch daemon {action} {daemon_type}.{id}"))
            .await?;
        Ok(())
    }

    /// Resolves the cluster node a daemon runs on.
    pub async fn fetch_host_node(
        &self,
        daemon_type: &str,
        daemon_id: &str,
    ) -> anyhow::Result<&'c Node> {
        let ps = self
            .run(&format!(
                "orch ps --daemon_type {daemon_type} --daemon_id {daemon_id}"
            ))
            .await?;
        let hostname = ps
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|d| d["hostname"].as_str())
            .next()
            .with_context(|| {
                format!("no {daemon_type}.{daemon_id} daemon in `ceph orch ps`")
            })?;
        self.ceph
            .cluster()
            .node_by_hostname(hostname)
            .with_context(|| {
                format!("daemon host {hostname} is not part of the cluster")
            })
    }

    pub async fn list_crashes(&self) -> anyhow::Result<Vec<String>> {
        let crashes = self.run("crash ls").await?;
        Ok(crash_ids(&crashes))
    }

    /// Crash ids present now but absent from `baseline`. Tests snapshot
    /// the ledger before running and fail on anything new.
    pub async fn new_crashes_since(
        &self,
        baseline: &[String],
    ) -> anyhow::Result<Vec<String>> {
        let current = self.list_crashes().await?;
        Ok(current
            .into_iter()
            .filter(|id| !baseline.contains(id))
            .collect())
    }

    pub async fn set_config(
        &self,
        section: &str,
        name: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        self.ceph
            .ceph(&format!("config set {section} {name} {value}"))
            .await?;
        Ok(())
    }

    pub async fn remove_config(&self, section: &str, name: &str) -> anyhow::Result<()> {
        self.ceph.ceph(&format!("config rm {section} {name}")).await?;
        Ok(())
    }

    pub async fn get_config(&self, section: &str, name: &str) -> anyhow::Result<String> {
        let out = self.ceph.ceph(&format!("config get {section} {name}")).await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Wall-clock time on the installer, for correlating test events
    /// with cluster logs.
    pub async fn get_cluster_date(&self) -> anyhow::Result<String> {
        let installer = self.ceph.cluster().installer()?;
        let out = installer.check_exec("date +%Y-%m-%dT%H:%M:%S").await?;
        Ok(out.stdout.trim().to_string())
    }

    pub async fn balancer_status(&self) -> anyhow::Result<Value> {
        self.run("balancer status").await
    }

    /// Switches the balancer on in the given mode (`upmap` or
    /// `crush-compat`) and confirms it reports active.
    pub async fn enable_balancer(&self, mode: &str) -> anyhow::Result<()> {
        self.ceph.ceph(&format!("balancer mode {mode}")).await?;
        self.ceph.ceph("balancer on").await?;
        sleep(BALANCER_SETTLE).await;

        let status = self.balancer_status().await?;
        if status["active"].as_bool() != Some(true) {
            bail!("balancer inactive after enabling mode {mode}");
        }
        info!(%mode, "balancer enabled");
        Ok(())
    }

    pub async fn configure_pg_autoscaler(
        &self,
        pool: &str,
        mode: &str,
    ) -> anyhow::Result<()> {
        let modules = self.run("mgr module ls").await?;
        if !module_enabled(&modules, "pg_autoscaler") {
            self.ceph.ceph("mgr module enable pg_autoscaler").await?;
        }
        self.set_pool_property(pool, "pg_autoscale_mode", mode).await?;
        info!(pool = %pool, %mode, "pg autoscaler configured");
        Ok(())
    }
}

fn pool_names(df: &Value) -> Vec<String> {
    df["pools"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|p| p["name"].as_str())
        .map(String::from)
        .collect()
}

fn parse_health(detail: &Value) -> HealthStatus {
    let status = detail["status"]
        .as_str()
        .unwrap_or("HEALTH_UNKNOWN")
        .to_string();
    let checks = detail["checks"]
        .as_object()
        .map(|checks| {
            checks
                .iter()
                .map(|(code, check)| {
                    match check["summary"]["message"].as_str() {
                        Some(msg) => format!("{code}: {msg}"),
                        None => code.clone(),
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    HealthStatus { status, checks }
}

fn pgs_all_clean(stat: &Value) -> bool {
    let summary = &stat["pg_summary"];
    let total = match summary["num_pgs"].as_u64() {
        Some(total) if total > 0 => total,
        _ => return false,
    };
    let clean: u64 = summary["num_pg_by_state"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|s| s["name"].as_str() == Some("active+clean"))
        .filter_map(|s| s["num"].as_u64())
        .sum();
    clean == total
}

fn crash_ids(crashes: &Value) -> Vec<String> {
    crashes
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|c| c["crash_id"].as_str())
        .map(String::from)
        .collect()
}

fn module_enabled(modules: &Value, name: &str) -> bool {
    ["always_on_modules", "enabled_modules"].iter().any(|key| {
        modules[*key]
            .as_array()
            .into_iter()
            .flatten()
            .any(|m| m.as_str() == Some(name))
    })
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn health_parses_status_and_check_messages() {
        let detail = json!({
            "status": "HEALTH_WARN",
            "checks": {
                "OSD_DOWN": {
                    "severity": "HEALTH_WARN",
                    "summary": {"message": "1 osds down"},
                },
                "PG_DEGRADED": {
                    "severity": "HEALTH_WARN",
                    "summary": {},
                },
            },
        });
        let health = parse_health(&detail);
        assert!(!health.is_ok());
        assert_eq!(health.status, "HEALTH_WARN");
        assert!(health.checks.contains(&"OSD_DOWN: 1 osds down".to_string()));
        assert!(health.checks.contains(&"PG_DEGRADED".to_string()));
    }

    #[test]
    fn health_ok_has_no_checks() {
        let health = parse_health(&json!({"status": "HEALTH_OK", "checks": {}}));
        assert!(health.is_ok());
        assert!(health.checks.is_empty());
    }

    #[test]
    fn clean_pgs_require_every_pg_active_clean() {
        let clean = json!({
            "pg_summary": {
                "num_pgs": 64,
                "num_pg_by_state": [{"name": "active+clean", "num": 64}],
            },
        });
        assert!(pgs_all_clean(&clean));

        let degraded = json!({
            "pg_summary": {
                "num_pgs": 64,
                "num_pg_by_state": [
                    {"name": "active+clean", "num": 60},
                    {"name": "active+undersized+degraded", "num": 4},
                ],
            },
        });
        assert!(!pgs_all_clean(&degraded));

        assert!(!pgs_all_clean(&json!({"pg_summary": {"num_pgs": 0}})));
        assert!(!pgs_all_clean(&json!({})));
    }

    #[test]
    fn crash_ledger_diff_reports_only_new_entries() {
        let crashes = json!([
            {"crash_id": "2026-01-04_a"},
            {"crash_id": "2026-01-05_b"},
        ]);
        let ids = crash_ids(&crashes);
        assert_eq!(ids, vec!["2026-01-04_a", "2026-01-05_b"]);

        let baseline = vec!["2026-01-04_a".to_string()];
        let new: Vec<String> = ids
            .into_iter()
            .filter(|id| !baseline.contains(id))
            .collect();
        assert_eq!(new, vec!["2026-01-05_b"]);
    }

    #[test]
    fn module_lookup_covers_always_on_and_enabled() {
        let modules = json!({
            "always_on_modules": ["balancer", "crash"],
            "enabled_modules": ["pg_autoscaler"],
        });
        assert!(module_enabled(&modules, "balancer"));
        assert!(module_enabled(&modules, "pg_autoscaler"));
        assert!(!module_enabled(&modules, "telemetry"));
    }

    #[test]
    fn pool_names_come_from_df() {
        let df = json!({
            "pools": [{"name": "rbd"}, {"name": "test-pool"}],
            "stats": {},
        });
        assert_eq!(pool_names(&df), vec!["rbd", "test-pool"]);
    }
}
