// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Object-level pool workflows driven through the `rados` CLI: filling
//! pools with data, pool snapshots, omap entries and benchmarks.

use std::time::Duration;

use anyhow::{bail, Context};
use rand::Rng;
use serde_json::Value;
use tracing::info;

use super::RadosOrchestrator;
use crate::ssh;

/// Payload size for generated objects.
const OBJECT_PAYLOAD: &str = "4M";

/// `bench_read` replays the data `bench_write` left behind; seq and
/// rand passes each run this long.
const BENCH_READ_SECS: u32 = 80;

/// Slack on top of the requested bench duration before the SSH command
/// itself is timed out.
const BENCH_GRACE: Duration = Duration::from_secs(120);

pub struct PoolFunctions<'c> {
    rados: &'c RadosOrchestrator<'c>,
}

impl<'c> PoolFunctions<'c> {
    pub fn new(rados: &'c RadosOrchestrator<'c>) -> Self {
        Self { rados }
    }

    /// Writes `count` objects with a generated payload and returns their
    /// names. Names are salted so repeated fills on the same pool do not
    /// overwrite each other.
    pub async fn put_objects(
        &self,
        pool: &str,
        count: u32,
        prefix: &str,
    ) -> anyhow::Result<Vec<String>> {
        let salt: u32 = rand::thread_rng().gen_range(0..10_000);
        let names: Vec<String> = (0..count)
            .map(|i| format!("{prefix}-{salt}-{i}"))
            .collect();

        let mut script = format!("truncate -s {OBJECT_PAYLOAD} /tmp/payload");
        for name in &names {
            script.push_str(&format!(" && rados -p {pool} put {name} /tmp/payload"));
        }
        self.shell_sh(&script).await?;

        info!(pool = %pool, count, "objects written");
        Ok(names)
    }

    pub async fn delete_objects(
        &self,
        pool: &str,
        objects: &[String],
    ) -> anyhow::Result<()> {
        if objects.is_empty() {
            return Ok(());
        }
        let script = objects
            .iter()
            .map(|name| format!("rados -p {pool} rm {name}"))
            .collect::<Vec<_>>()
            .join(" && ");
        self.shell_sh(&script).await?;
        info!(pool = %pool, count = objects.len(), "objects deleted");
        Ok(())
    }

    /// Object count for the pool from `rados df`.
    pub async fn list_object_count(&self, pool: &str) -> anyhow::Result<u64> {
        let out = self.rados.ceph().shell("rados df -f json").await?;
        let df: Value = serde_json::from_str(out.stdout.trim())
            .context("unparseable output of `rados df`")?;
        object_count(&df, pool)
            .with_context(|| format!("pool {pool} not in `rados df`"))
    }

    /// Creates a pool snapshot and returns its generated name.
    pub async fn create_pool_snap(&self, pool: &str) -> anyhow::Result<String> {
        let snap = format!(
            "{pool}-snap-{}",
            rand::thread_rng().gen_range(0..10_000u32)
        );
        self.rados
            .ceph()
            .ceph(&format!("osd pool mksnap {pool} {snap}"))
            .await?;
        if !self.snap_exists(pool, &snap).await? {
            bail!("snapshot {snap} missing after mksnap");
        }
        info!(pool = %pool, %snap, "pool snapshot created");
        Ok(snap)
    }

    pub async fn snap_exists(&self, pool: &str, snap: &str) -> anyhow::Result<bool> {
        let dump = self.rados.run("osd dump").await?;
        Ok(pool_snap_names(&dump, pool).iter().any(|s| s == snap))
    }

    pub async fn delete_pool_snap(&self, pool: &str, snap: &str) -> anyhow::Result<()> {
        self.rados
            .ceph()
            .ceph(&format!("osd pool rmsnap {pool} {snap}"))
            .await?;
        if self.snap_exists(pool, snap).await? {
            bail!("snapshot {snap} still present after rmsnap");
        }
        Ok(())
    }

    /// Writes `entries_per_obj` omap keys on each of `obj_count` objects.
    /// `rados setomapval` creates the objects as a side effect.
    pub async fn fill_omap_entries(
        &self,
        pool: &str,
        obj_count: u32,
        entries_per_obj: u32,
    ) -> anyhow::Result<()> {
        for obj in 0..obj_count {
            let name = format!("omap-obj-{obj}");
            let script = (0..entries_per_obj)
                .map(|entry| {
                    format!(
                        "rados -p {pool} setomapval {name} key-{entry} value-{entry}"
                    )
                })
                .collect::<Vec<_>>()
                .join(" && ");
            self.shell_sh(&script).await?;
        }
        info!(
            pool = %pool,
            objects = obj_count,
            entries = entries_per_obj,
            "omap entries written"
        );
        Ok(())
    }

    pub async fn get_bulk(&self, pool: &str) -> anyhow::Result<bool> {
        let prop = self.rados.get_pool_property(pool, "bulk").await?;
        prop.as_bool()
            .context("`ceph osd pool get bulk` returned no boolean")
    }

    pub async fn set_bulk(&self, pool: &str) -> anyhow::Result<()> {
        self.rados.set_pool_property(pool, "bulk", "true").await?;
        if !self.get_bulk(pool).await? {
            bail!("bulk flag not set on pool {pool}");
        }
        Ok(())
    }

    pub async fn remove_bulk(&self, pool: &str) -> anyhow::Result<()> {
        self.rados.set_pool_property(pool, "bulk", "false").await?;
        if self.get_bulk(pool).await? {
            bail!("bulk flag still set on pool {pool}");
        }
        Ok(())
    }

    pub async fn pool_id(&self, pool: &str) -> anyhow::Result<u64> {
        let detail = self.rados.run("osd pool ls detail").await?;
        detail
            .as_array()
            .into_iter()
            .flatten()
            .find(|p| p["pool_name"].as_str() == Some(pool))
            .and_then(|p| p["pool_id"].as_u64())
            .with_context(|| format!("pool {pool} not in `ceph osd pool ls detail`"))
    }

    /// 4 KiB writes for `secs` seconds, left in place so `bench_read`
    /// has data to replay.
    pub async fn bench_write(&self, pool: &str, secs: u32) -> anyhow::Result<()> {
        info!(pool = %pool, secs, "rados bench write");
        self.bench(&format!(
            "rados --no-log-to-stderr -b 4096 -p {pool} bench {secs} write --no-cleanup"
        ), secs)
        .await?;
        Ok(())
    }

    /// Sequential then random reads against data a prior
    /// [`PoolFunctions::bench_write`] wrote.
    pub async fn bench_read(&self, pool: &str) -> anyhow::Result<()> {
        info!(pool = %pool, secs = BENCH_READ_SECS, "rados bench read");
        self.bench(
            &format!("rados --no-log-to-stderr -p {pool} bench {BENCH_READ_SECS} seq"),
            BENCH_READ_SECS,
        )
        .await?;
        self.bench(
            &format!("rados --no-log-to-stderr -p {pool} bench {BENCH_READ_SECS} rand"),
            BENCH_READ_SECS,
        )
        .await?;
        Ok(())
    }

    async fn bench(&self, cmd: &str, secs: u32) -> anyhow::Result<ssh::Output> {
        let timeout = Duration::from_secs(u64::from(secs)) + BENCH_GRACE;
        self.rados.ceph().shell_timeout(cmd, timeout).await
    }

    async fn shell_sh(&self, script: &str) -> anyhow::Result<ssh::Output> {
        self.rados.ceph().shell(&format!("sh -c '{script}'")).await
    }
}

fn object_count(df: &Value, pool: &str) -> Option<u64> {
    df["pools"]
        .as_array()?
        .iter()
        .find(|p| p["name"].as_str() == Some(pool))
        .and_then(|p| p["num_objects"].as_u64())
}

fn pool_snap_names(dump: &Value, pool: &str) -> Vec<String> {
    dump["pools"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|p| p["pool_name"].as_str() == Some(pool))
        .flat_map(|p| p["pool_snaps"].as_array().into_iter().flatten())
        .filter_map(|s| s["name"].as_str())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn object_count_reads_rados_df() {
        let df = json!({
            "pools": [
                {"name": "rbd", "num_objects": 12},
                {"name": "test-pool", "num_objects": 200},
            ],
        });
        assert_eq!(object_count(&df, "test-pool"), Some(200));
        assert_eq!(object_count(&df, "missing"), None);
        assert_eq!(object_count(&json!({}), "rbd"), None);
    }

    #[test]
    fn snap_names_are_scoped_to_the_pool() {
        let dump = json!({
            "pools": [
                {
                    "pool_name": "alpha",
                    "pool_snaps": [
                        {"snapid": 1, "name": "alpha-snap-17"},
                        {"snapid": 2, "name": "alpha-snap-92"},
                    ],
                },
                {
                    "pool_name": "beta",
                    "pool_snaps": [{"snapid": 1, "name": "beta-snap-3"}],
                },
            ],
        });
        assert_eq!(
            pool_snap_names(&dump, "alpha"),
            vec!["alpha-snap-17", "alpha-snap-92"]
        );
        assert_eq!(pool_snap_names(&dump, "beta"), vec!["beta-snap-3"]);
        assert!(pool_snap_names(&dump, "gamma").is_empty());
    }
}
