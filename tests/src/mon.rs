// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use cephci_framework::rados::{MonitorWorkflows, RadosOrchestrator};
use cephci_framework::Role;
use cephci_testcase::*;
use tokio::time::sleep;

/// Quorum re-elections and monmap changes settle within this window.
const MON_SETTLE: Duration = Duration::from_secs(300);

/// A daemon restart takes a moment to show in the health report.
const RESTART_KICK: Duration = Duration::from_secs(10);

#[cephci_testcase(polarion_id = "CEPH-83604848")]
async fn mon_compaction_survives_restart(ctx: &Framework) {
    let cephadm = ctx.cephadm();
    let rados = RadosOrchestrator::new(&cephadm);
    let mons = MonitorWorkflows::new(&cephadm);

    rados
        .set_config("mon", "mon_compact_on_start", "true")
        .await?;
    assert_eq!(
        rados.get_config("mon", "mon_compact_on_start").await?,
        "true"
    );

    // Restart a follower when there is one, so the quorum leader keeps
    // serving while the restarted mon compacts its store.
    let leader = mons.quorum_leader().await?;
    let target = mons
        .quorum_hosts()
        .await?
        .into_iter()
        .find(|name| name != &leader)
        .unwrap_or(leader);

    rados.restart_daemon("mon", &target).await?;
    sleep(RESTART_KICK).await;
    rados.wait_until_healthy(MON_SETTLE).await?;

    let quorum = mons.quorum_hosts().await?;
    assert!(
        quorum.iter().any(|name| name == &target),
        "mon.{target} absent from quorum after restart: {quorum:?}"
    );

    rados.remove_config("mon", "mon_compact_on_start").await?;
}

#[cephci_testcase]
async fn mon_remove_and_readd_keeps_quorum(ctx: &Framework) {
    let cluster = ctx.cluster();
    let mon_count = cluster.nodes_with_role(&Role::Mon).count();
    if mon_count < 3 {
        cephci_skip!("mon removal needs at least three mons to hold quorum");
    }

    let cephadm = ctx.cephadm();
    let rados = RadosOrchestrator::new(&cephadm);
    let mons = MonitorWorkflows::new(&cephadm);

    let leader = mons.quorum_leader().await?;
    let victim = cluster
        .nodes_with_role(&Role::Mon)
        .find(|node| node.shortname() != leader)
        .context("every mon node hosts the quorum leader")?;

    mons.set_mon_service_managed(false).await?;
    mons.remove_mon(victim).await?;
    rados.wait_until_healthy(MON_SETTLE).await?;

    let quorum = mons.quorum_hosts().await?;
    assert_eq!(
        quorum.len(),
        mon_count - 1,
        "quorum after removing mon.{}: {quorum:?}",
        victim.shortname()
    );
    assert!(
        !quorum.iter().any(|name| name == victim.shortname()),
        "mon.{} still in quorum after removal",
        victim.shortname()
    );

    mons.add_mon(victim).await?;
    assert!(mons.mon_exists_on_host(victim.shortname()).await?);

    rados.wait_until_healthy(MON_SETTLE).await?;
    let quorum = mons.quorum_hosts().await?;
    assert!(
        quorum.iter().any(|name| name == victim.shortname()),
        "mon.{} never rejoined quorum: {quorum:?}",
        victim.shortname()
    );

    mons.set_mon_service_managed(true).await?;
}
