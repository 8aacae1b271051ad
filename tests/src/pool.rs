// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use cephci_framework::rados::{PoolFunctions, PoolOpts, RadosOrchestrator};
use cephci_testcase::*;
use rand::Rng;
use tokio::time::sleep;

/// Pool statistics in `rados df` trail writes by a mgr stats tick.
const STAT_SETTLE: Duration = Duration::from_secs(5);

/// Salts a name so repeated runs against a reused cluster do not collide
/// with leftovers from earlier failures.
pub(crate) fn salted(prefix: &str) -> String {
    format!("{prefix}-{:04}", rand::thread_rng().gen_range(0..10_000u32))
}

#[cephci_testcase]
async fn replicated_pool_object_lifecycle(ctx: &Framework) {
    let cephadm = ctx.cephadm();
    let rados = RadosOrchestrator::new(&cephadm);
    let pools = PoolFunctions::new(&rados);

    let pool = salted("ci-repl");
    rados.create_pool(&pool, &PoolOpts::default()).await?;

    let written = pools.put_objects(&pool, 4, "obj").await?;
    assert_eq!(written.len(), 4);
    sleep(STAT_SETTLE).await;
    assert_eq!(pools.list_object_count(&pool).await?, 4);

    pools.delete_objects(&pool, &written).await?;
    sleep(STAT_SETTLE).await;
    assert_eq!(pools.list_object_count(&pool).await?, 0);

    rados.delete_pool(&pool).await?;
    assert!(
        !rados.list_pools().await?.contains(&pool),
        "pool {pool} still listed after delete"
    );
}

#[cephci_testcase]
async fn pool_property_round_trip(ctx: &Framework) {
    let cephadm = ctx.cephadm();
    let rados = RadosOrchestrator::new(&cephadm);

    let pool = salted("ci-props");
    rados.create_pool(&pool, &PoolOpts::default()).await?;

    rados
        .set_pool_property(&pool, "compression_mode", "aggressive")
        .await?;
    let mode = rados.get_pool_property(&pool, "compression_mode").await?;
    assert_eq!(mode.as_str(), Some("aggressive"));

    rados.delete_pool(&pool).await?;
}

#[cephci_testcase]
async fn bulk_flag_set_and_clear(ctx: &Framework) {
    let cephadm = ctx.cephadm();
    let rados = RadosOrchestrator::new(&cephadm);
    let pools = PoolFunctions::new(&rados);

    let pool = salted("ci-bulk");
    rados.create_pool(&pool, &PoolOpts::default()).await?;

    pools.set_bulk(&pool).await?;
    assert!(pools.get_bulk(&pool).await?);

    pools.remove_bulk(&pool).await?;
    assert!(!pools.get_bulk(&pool).await?);

    rados.delete_pool(&pool).await?;
}

#[cephci_testcase]
async fn pool_snapshot_create_and_remove(ctx: &Framework) {
    let cephadm = ctx.cephadm();
    let rados = RadosOrchestrator::new(&cephadm);
    let pools = PoolFunctions::new(&rados);

    let pool = salted("ci-snap");
    rados.create_pool(&pool, &PoolOpts::default()).await?;
    pools.put_objects(&pool, 2, "snapobj").await?;

    let snap = pools.create_pool_snap(&pool).await?;
    assert!(
        pools.snap_exists(&pool, &snap).await?,
        "snapshot {snap} not in the osd dump"
    );

    pools.delete_pool_snap(&pool, &snap).await?;
    assert!(
        !pools.snap_exists(&pool, &snap).await?,
        "snapshot {snap} survived rmsnap"
    );

    rados.delete_pool(&pool).await?;
}

#[cephci_testcase]
async fn pg_autoscaler_mode_round_trip(ctx: &Framework) {
    let cephadm = ctx.cephadm();
    let rados = RadosOrchestrator::new(&cephadm);

    let pool = salted("ci-autoscale");
    rados.create_pool(&pool, &PoolOpts::default()).await?;

    rados.configure_pg_autoscaler(&pool, "off").await?;
    let mode = rados.get_pool_property(&pool, "pg_autoscale_mode").await?;
    assert_eq!(mode.as_str(), Some("off"));

    rados.configure_pg_autoscaler(&pool, "on").await?;
    let mode = rados.get_pool_property(&pool, "pg_autoscale_mode").await?;
    assert_eq!(mode.as_str(), Some("on"));

    rados.delete_pool(&pool).await?;
}

#[cephci_testcase]
async fn erasure_pool_takes_writes(ctx: &Framework) {
    let cephadm = ctx.cephadm();
    let rados = RadosOrchestrator::new(&cephadm);
    let pools = PoolFunctions::new(&rados);

    let stat = rados.run("osd stat").await?;
    let osds = stat["num_osds"].as_u64().unwrap_or(0);
    if osds < 3 {
        cephci_skip!("erasure profile k=2 m=1 needs at least three osds");
    }

    let profile = salted("ci-ec");
    // crush-failure-domain=osd keeps the profile usable on clusters with
    // fewer hosts than k+m.
    cephadm
        .ceph(&format!(
            "osd erasure-code-profile set {profile} k=2 m=1 \
            crush-failure-domain=osd"
        ))
        .await?;

    let pool = salted("ci-ecpool");
    let opts = PoolOpts {
        ec_profile: Some(profile.clone()),
        ..Default::default()
    };
    rados.create_pool(&pool, &opts).await?;

    let prop = rados.get_pool_property(&pool, "erasure_code_profile").await?;
    assert_eq!(prop.as_str(), Some(profile.as_str()));

    pools.put_objects(&pool, 2, "ecobj").await?;

    rados.delete_pool(&pool).await?;
    cephadm
        .ceph(&format!("osd erasure-code-profile rm {profile}"))
        .await?;
}
