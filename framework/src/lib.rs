// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cephci framework: provisioning nodes on cloud or baremetal
//! providers, deploying Ceph onto them with cephadm, and driving the
//! resulting cluster from test cases.

pub mod cephadm;
pub mod cluster;
pub mod compute;
pub mod config;
pub mod parallel;
pub mod rados;
pub mod ssh;

pub use cluster::{Cluster, Node, Role};
pub use parallel::Parallel;

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use cephadm::CephAdm;
use compute::ProviderKind;

/// Knobs the runner chooses once per process and every test shares.
pub struct FrameworkParameters {
    pub run_id: String,
    pub provider: ProviderKind,
    /// Ceph container image under test; `None` lets cephadm use whatever
    /// the bootstrapped cluster runs.
    pub build_image: Option<String>,
    pub test_timeout: Duration,
    pub tmp_directory: Utf8PathBuf,
}

/// Context handed to every test case: the provisioned cluster plus the
/// run-wide settings needed to talk to it.
pub struct Framework {
    cluster: Cluster,
    run_id: String,
    provider: ProviderKind,
    build_image: Option<String>,
    test_timeout: Duration,
    tmp_directory: Utf8PathBuf,
}

impl Framework {
    pub fn new(params: FrameworkParameters, cluster: Cluster) -> Self {
        Self {
            cluster,
            run_id: params.run_id,
            provider: params.provider,
            build_image: params.build_image,
            test_timeout: params.test_timeout,
            tmp_directory: params.tmp_directory,
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// A cephadm handle bound to this cluster and the image under test.
    pub fn cephadm(&self) -> CephAdm<'_> {
        CephAdm::new(&self.cluster, self.build_image.clone())
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn build_image(&self) -> Option<&str> {
        self.build_image.as_deref()
    }

    pub fn test_timeout(&self) -> Duration {
        self.test_timeout
    }

    pub fn tmp_directory(&self) -> &Utf8Path {
        &self.tmp_directory
    }
}
