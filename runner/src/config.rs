// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::Utf8PathBuf;
use cephci_framework::cephadm::Registry;
use cephci_framework::compute::ProviderKind;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Subcommand)]
pub enum Command {
    Run(RunOptions),
    List(ListOptions),
    Cleanup(CleanupOptions),
}

/// Runtime configuration options for the runner.
#[derive(Debug, Parser)]
#[clap(verbatim_doc_comment)]
pub struct ProcessArgs {
    #[clap(subcommand)]
    pub command: Command,

    /// Suppress emission of terminal control codes in the runner's log output.
    #[clap(long, conflicts_with = "emit_bunyan")]
    pub disable_ansi: bool,

    /// Emit Bunyan-formatted logs.
    #[clap(long)]
    pub emit_bunyan: bool,
}

#[derive(Args, Debug)]
#[clap(verbatim_doc_comment)]
pub struct RunOptions {
    /// Cluster layout YAML naming the nodes to provision and the Ceph roles
    /// each one carries.
    #[clap(long, value_parser)]
    pub cluster_conf: Utf8PathBuf,

    /// Overrides YAML merged on top of the cluster layout before it is
    /// interpreted.
    #[clap(long, value_parser)]
    pub overrides: Option<Utf8PathBuf>,

    /// Inventory YAML supplying the default image, size, and cloud-init
    /// payload for provisioned nodes.
    #[clap(long, value_parser)]
    pub inventory: Utf8PathBuf,

    /// Provider credentials YAML.
    #[clap(long, value_parser)]
    pub credentials: Utf8PathBuf,

    /// Provider to provision nodes on.
    #[clap(long, value_parser)]
    pub provider: ProviderKind,

    /// Ceph container image to bootstrap. cephadm's packaged default is used
    /// when unset.
    #[clap(long, value_parser)]
    pub build_image: Option<String>,

    /// Yum repo to install the cephadm RPM from on the installer node. The
    /// package is assumed to be preinstalled when unset.
    #[clap(long, value_parser)]
    pub tool_repo: Option<String>,

    /// Container registry to log in to before pulling images. The three
    /// registry flags go together.
    #[clap(long, value_parser, requires = "registry_username")]
    pub registry_url: Option<String>,

    #[clap(long, value_parser, requires = "registry_password")]
    pub registry_username: Option<String>,

    #[clap(long, value_parser, requires = "registry_url")]
    pub registry_password: Option<String>,

    /// Hand the registry login to bootstrap as a --registry-json file
    /// instead of inline flags.
    #[clap(long, requires = "registry_url")]
    pub registry_json: bool,

    /// Tag embedded in provisioned node names, so concurrent runs stay
    /// distinguishable. Defaults to the local username.
    #[clap(long, value_parser, default_value_t = default_tag())]
    pub tag: String,

    /// Rebuild the cluster from this state file instead of provisioning and
    /// deploying a new one. The reused cluster is still torn down at the end
    /// of the run unless --keep-alive is also given.
    #[clap(long, value_parser)]
    pub reuse: Option<Utf8PathBuf>,

    /// Write the provisioned cluster to this state file for a later --reuse.
    #[clap(long, value_parser, conflicts_with = "reuse")]
    pub store: Option<Utf8PathBuf>,

    /// Leave the cluster up after the run instead of destroying it.
    #[clap(long)]
    pub keep_alive: bool,

    /// The directory into which to write temporary files generated during
    /// test execution.
    #[clap(long, value_parser, default_value = "/tmp/cephci")]
    pub tmp_directory: Utf8PathBuf,

    /// Only run tests whose fully-qualified names contain this string.
    /// Can be specified multiple times.
    #[clap(long, value_parser)]
    pub include_filter: Vec<String>,

    /// Only run tests whose fully-qualified names do not contain this
    /// string. Can be specified multiple times.
    #[clap(long, value_parser)]
    pub exclude_filter: Vec<String>,

    /// Per-test deadline in seconds.
    #[clap(long, value_parser, default_value = "3600")]
    pub test_timeout_secs: u64,
}

impl RunOptions {
    /// The registry login, when all three flags were given. clap's
    /// `requires` chain rules out partial combinations.
    pub fn registry(&self) -> Option<Registry> {
        match (
            &self.registry_url,
            &self.registry_username,
            &self.registry_password,
        ) {
            (Some(url), Some(username), Some(password)) => Some(Registry {
                url: url.clone(),
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

fn default_tag() -> String {
    std::env::var("USER").unwrap_or_else(|_| "ci".to_string())
}

#[derive(Args, Debug)]
#[clap(verbatim_doc_comment)]
pub struct ListOptions {
    /// Only list tests whose fully-qualified names contain this string.
    /// Can be specified multiple times.
    #[clap(long, value_parser)]
    pub include_filter: Vec<String>,

    /// Only list tests whose fully-qualified names do not contain this
    /// string. Can be specified multiple times.
    #[clap(long, value_parser)]
    pub exclude_filter: Vec<String>,
}

#[derive(Args, Debug)]
#[clap(verbatim_doc_comment)]
pub struct CleanupOptions {
    /// Provider credentials YAML.
    #[clap(long, value_parser)]
    pub credentials: Utf8PathBuf,

    /// Provider whose nodes are swept.
    #[clap(long, value_parser)]
    pub provider: ProviderKind,

    /// Case-insensitive substring matched against node names; every match
    /// is destroyed.
    #[clap(long, value_parser)]
    pub pattern: String,
}
