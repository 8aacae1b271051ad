// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::bail;
use cephci_framework::rados::RadosOrchestrator;
use cephci_framework::Role;
use cephci_testcase::*;
use tracing::info;

#[cephci_testcase(abort_on_fail)]
async fn health_ok_test(ctx: &Framework) {
    let cephadm = ctx.cephadm();
    let rados = RadosOrchestrator::new(&cephadm);

    let health = rados.cluster_health().await?;
    if !health.is_ok() {
        bail!(
            "cluster is {} with checks {:?}",
            health.status,
            health.checks
        );
    }
}

#[cephci_testcase]
async fn daemons_running_for_every_role_test(ctx: &Framework) {
    let cephadm = ctx.cephadm();
    let daemons = cephadm.ceph_json("orch ps").await?;

    for (role, daemon_type) in [
        (Role::Mon, "mon"),
        (Role::Mgr, "mgr"),
        (Role::Osd, "osd"),
        (Role::Mds, "mds"),
        (Role::Rgw, "rgw"),
    ] {
        let placed = ctx.cluster().nodes_with_role(&role).count();
        if placed == 0 {
            continue;
        }

        let running = daemons
            .as_array()
            .into_iter()
            .flatten()
            .filter(|d| {
                d["daemon_type"].as_str() == Some(daemon_type)
                    && d["status_desc"].as_str() == Some("running")
            })
            .count();
        info!(daemon_type, running, "daemons running");
        if running == 0 {
            bail!(
                "layout places {placed} {daemon_type} node(s) but no such \
                daemon is running"
            );
        }
    }
}

#[cephci_testcase]
async fn osd_count_matches_layout_test(ctx: &Framework) {
    let expected: u64 = ctx
        .cluster()
        .nodes_with_role(&Role::Osd)
        .map(|node| u64::from(node.details.volume_count))
        .sum();
    if expected == 0 {
        cephci_skip!("layout attaches no data volumes to count osds against");
    }

    let cephadm = ctx.cephadm();
    let rados = RadosOrchestrator::new(&cephadm);
    let stat = rados.run("osd stat").await?;
    let actual = stat["num_osds"].as_u64().unwrap_or(0);
    assert_eq!(
        actual, expected,
        "osd count does not match the layout's data volumes"
    );
}

#[cephci_testcase]
async fn orch_hosts_match_cluster_test(ctx: &Framework) {
    let cephadm = ctx.cephadm();
    let listing = cephadm.ceph_json("orch host ls").await?;

    let mut listed: Vec<String> = listing
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|host| host["hostname"].as_str())
        .map(String::from)
        .collect();
    listed.sort();

    let mut wanted: Vec<String> = ctx
        .cluster()
        .nodes()
        .map(|node| node.shortname().to_string())
        .collect();
    wanted.sort();

    assert_eq!(
        listed, wanted,
        "orchestrator host list diverges from the cluster layout"
    );
}
