// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use anyhow::bail;
use cephci_framework::rados::{PoolFunctions, PoolOpts, RadosOrchestrator};
use cephci_testcase::*;
use tokio::time::{sleep, Instant};
use tracing::info;

use crate::pool::salted;

/// An osd state change lands in `ceph osd stat` within this window.
const OSD_STATE_TIMEOUT: Duration = Duration::from_secs(120);

/// Recovery back to active+clean after daemon churn.
const CLEAN_TIMEOUT: Duration = Duration::from_secs(600);

const POLL: Duration = Duration::from_secs(10);

/// Polls `ceph osd stat` until exactly `wanted` osds report up.
async fn wait_for_up_osds(
    rados: &RadosOrchestrator<'_>,
    wanted: u64,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let stat = rados.run("osd stat").await?;
        let up = stat["num_up_osds"].as_u64().unwrap_or(0);
        if up == wanted {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!(
                "{up} osds up after {}s, wanted {wanted}",
                timeout.as_secs()
            );
        }
        sleep(POLL).await;
    }
}

#[cephci_testcase]
async fn osd_stop_start_returns_to_clean(ctx: &Framework) {
    let cephadm = ctx.cephadm();
    let rados = RadosOrchestrator::new(&cephadm);

    let stat = rados.run("osd stat").await?;
    let total = stat["num_osds"].as_u64().unwrap_or(0);
    if total < 2 {
        cephci_skip!("needs a second osd to keep serving while one is down");
    }

    let osds = rados.run("osd ls").await?;
    let osd_id = osds
        .as_array()
        .and_then(|ids| ids.first())
        .and_then(|id| id.as_u64())
        .context("`ceph osd ls` lists no osds")?;

    rados.stop_daemon("osd", &osd_id.to_string()).await?;
    wait_for_up_osds(&rados, total - 1, OSD_STATE_TIMEOUT).await?;
    info!(osd = osd_id, "osd reported down");

    rados.start_daemon("osd", &osd_id.to_string()).await?;
    wait_for_up_osds(&rados, total, OSD_STATE_TIMEOUT).await?;
    rados.wait_for_clean_pgs(CLEAN_TIMEOUT).await?;
}

#[cephci_testcase]
async fn primary_osd_restart_recovers_acting_set(ctx: &Framework) {
    let cephadm = ctx.cephadm();
    let rados = RadosOrchestrator::new(&cephadm);
    let pools = PoolFunctions::new(&rados);

    let pool = salted("ci-acting");
    rados.create_pool(&pool, &PoolOpts::default()).await?;
    let written = pools.put_objects(&pool, 1, "probe").await?;
    let object =
        written.first().map(String::as_str).context("no probe object written")?;

    let acting = rados.pg_acting_set(&pool, Some(object)).await?;
    let primary = *acting.first().context("acting set is empty")?;
    info!(%pool, primary, ?acting, "acting set before restart");

    rados.restart_daemon("osd", &primary.to_string()).await?;
    rados.wait_for_clean_pgs(CLEAN_TIMEOUT).await?;

    let after = rados.pg_acting_set(&pool, Some(object)).await?;
    assert!(
        !after.is_empty(),
        "pg has no acting set after restarting osd.{primary}"
    );
    assert_eq!(
        acting.len(),
        after.len(),
        "acting set size changed after restarting osd.{primary}"
    );

    rados.delete_pool(&pool).await?;
}
