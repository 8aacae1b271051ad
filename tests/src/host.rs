// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use cephci_testcase::*;
use tracing::info;

#[cephci_testcase]
async fn cephadm_shell_round_trip(ctx: &Framework) {
    let cephadm = ctx.cephadm();
    let out = cephadm.shell("echo round-trip").await?;
    assert_eq!(out.stdout.trim(), "round-trip");
}

#[cephci_testcase]
async fn fetch_image_reports_running_image(ctx: &Framework) {
    let cephadm = ctx.cephadm();
    let image = cephadm.fetch_image().await?;
    info!(%image, "cluster container image");

    if let Some(expected) = ctx.build_image() {
        // cephadm rewrites image tags into repo digests when it pulls,
        // so compare the repository path only.
        let repo = image.split(['@', ':']).next().unwrap_or(&image);
        let expected_repo =
            expected.split(['@', ':']).next().unwrap_or(expected);
        assert_eq!(repo, expected_repo, "cluster runs an unexpected image");
    }
}

#[cephci_testcase]
async fn host_label_round_trip(ctx: &Framework) {
    let cephadm = ctx.cephadm();
    let node = ctx.cluster().installer()?;

    cephadm.label_host(node.shortname(), "ci-probe").await?;

    let listing = cephadm.ceph_json("orch host ls").await?;
    let labelled = listing
        .as_array()
        .into_iter()
        .flatten()
        .filter(|host| host["hostname"].as_str() == Some(node.shortname()))
        .any(|host| {
            host["labels"]
                .as_array()
                .into_iter()
                .flatten()
                .any(|label| label.as_str() == Some("ci-probe"))
        });
    assert!(
        labelled,
        "label ci-probe missing from `orch host ls` after labelling {}",
        node.shortname()
    );

    cephadm
        .ceph(&format!("orch host label rm {} ci-probe", node.shortname()))
        .await?;
}
