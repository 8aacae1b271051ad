// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! YAML configuration models: cluster layout, provider credentials, and the
//! image/userdata inventory, plus the override merge applied on top of a
//! layout before a run.

use std::collections::BTreeMap;

use anyhow::Context;
use camino::Utf8Path;
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Longest node name accepted by every provider; IBM registers the name as
/// a DNS label.
const MAX_NODE_NAME: usize = 63;

/// Reads and deserializes one YAML file.
pub fn load_yaml<T: DeserializeOwned>(path: &Utf8Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {path}"))?;
    serde_yaml::from_str(&text).with_context(|| format!("failed to parse {path}"))
}

/// Recursively merges `overlay` into `base`: mappings merge key-wise with
/// the overlay winning on scalars, sequences append, and any other pairing
/// replaces `base` wholesale.
pub fn merge_values(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    use serde_yaml::Value;

    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (Value::Sequence(base_seq), Value::Sequence(overlay_seq)) => {
            base_seq.extend(overlay_seq);
        }
        (base, overlay) => *base = overlay,
    }
}

/// Loads a cluster layout, applying an optional overrides file on top.
pub fn load_layout(
    path: &Utf8Path,
    overrides: Option<&Utf8Path>,
) -> anyhow::Result<LayoutFile> {
    let mut base: serde_yaml::Value = load_yaml(path)?;
    if let Some(overrides) = overrides {
        let overlay: serde_yaml::Value = load_yaml(overrides)?;
        merge_values(&mut base, overlay);
    }

    serde_yaml::from_value(base)
        .with_context(|| format!("failed to interpret cluster layout {path}"))
}

/// Canonical VM name: `{cluster}-{tag}-{run}-{key}-{role+role+..}`.
///
/// Role suffixes are dropped at `+` boundaries until the name fits the
/// provider limit.
pub fn node_name(
    cluster: &str,
    tag: &str,
    run_id: &str,
    node_key: &str,
    roles: &[String],
) -> String {
    let mut name =
        format!("{cluster}-{tag}-{run_id}-{node_key}-{}", roles.join("+"));

    while name.len() > MAX_NODE_NAME {
        match name.rfind('+') {
            Some(idx) => name.truncate(idx),
            None => {
                // Tags default to `$USER`, which need not be ASCII; a hard
                // cut at the byte limit could land inside a character.
                let mut cut = MAX_NODE_NAME;
                while !name.is_char_boundary(cut) {
                    cut -= 1;
                }
                name.truncate(cut);
                break;
            }
        }
    }

    name
}

/// Top level of a cluster layout file.
#[derive(Debug, Deserialize)]
pub struct LayoutFile {
    pub globals: Vec<ClusterEntry>,
}

impl LayoutFile {
    pub fn clusters(&self) -> impl Iterator<Item = &ClusterConf> {
        self.globals.iter().map(|e| &e.ceph_cluster)
    }
}

#[derive(Debug, Deserialize)]
pub struct ClusterEntry {
    #[serde(rename = "ceph-cluster")]
    pub ceph_cluster: ClusterConf,
}

/// One cluster in the layout. Node definitions live under dynamic
/// `node1`..`node99` keys; anything else in the mapping is ignored.
#[derive(Debug, Deserialize)]
pub struct ClusterConf {
    #[serde(default = "default_cluster_name")]
    pub name: String,

    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

fn default_cluster_name() -> String {
    "ceph".to_string()
}

impl ClusterConf {
    /// Returns `(key, conf)` pairs in `node1`..`node99` order.
    pub fn node_confs(&self) -> anyhow::Result<Vec<(String, NodeConf)>> {
        let mut confs = Vec::new();
        for n in 1..100 {
            let key = format!("node{n}");
            let Some(value) = self.extra.get(&key) else {
                continue;
            };
            let conf: NodeConf = serde_yaml::from_value(value.clone())
                .with_context(|| format!("bad node definition {key}"))?;
            confs.push((key, conf));
        }
        Ok(confs)
    }
}

/// One node definition in the layout.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConf {
    pub role: OneOrMany<String>,

    #[serde(default)]
    pub no_of_volumes: Option<u32>,

    #[serde(default)]
    pub disk_size: Option<u32>,

    /// Per-node image override; the inventory supplies the default.
    #[serde(default)]
    pub image_name: Option<String>,

    /// Per-node flavor/profile/instance-type override.
    #[serde(default)]
    pub vm_size: Option<String>,

    #[serde(default)]
    pub networks: Option<Vec<String>>,

    // Baremetal nodes are described in full rather than provisioned.
    #[serde(default)]
    pub ip: Option<String>,

    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub root_password: Option<String>,

    #[serde(default)]
    pub volumes: Option<Vec<String>>,

    #[serde(default)]
    pub subnet: Option<String>,
}

impl NodeConf {
    pub fn roles(&self) -> Vec<String> {
        self.role.to_vec()
    }
}

/// A scalar-or-list YAML field.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v.clone()],
            OneOrMany::Many(vs) => vs.clone(),
        }
    }
}

/// Top level of the credentials file.
#[derive(Debug, Deserialize)]
pub struct CredentialsFile {
    pub globals: ProviderCredentials,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProviderCredentials {
    #[serde(default, rename = "openstack-credentials")]
    pub openstack: Option<OpenStackCredentials>,

    #[serde(default, rename = "ibm-credentials")]
    pub ibm: Option<IbmCredentials>,

    #[serde(default, rename = "aws-credentials")]
    pub aws: Option<AwsCredentials>,

    #[serde(default, rename = "baremetal-credentials")]
    pub baremetal: Option<BaremetalCredentials>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OpenStackCredentials {
    pub username: String,
    pub password: String,

    /// Keystone v3 endpoint, e.g. `https://keystone.example.com:5000/v3`.
    pub auth_url: String,

    pub tenant_name: String,

    #[serde(default = "default_service_region")]
    pub service_region: String,

    #[serde(default = "default_domain")]
    pub domain: String,

    #[serde(default)]
    pub tenant_domain_id: Option<String>,
}

fn default_service_region() -> String {
    "regionOne".to_string()
}

fn default_domain() -> String {
    "Default".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IbmCredentials {
    /// IAM API key.
    pub access_key: String,

    /// Regional VPC endpoint, e.g. `https://us-south.iaas.cloud.ibm.com`.
    pub service_url: String,

    pub zone_name: String,
    pub vpc_name: String,

    /// DNS Services instance GUID and the zone the nodes register under.
    pub dns_service_id: String,
    pub dns_zone_id: String,
    pub dns_zone: String,

    #[serde(default)]
    pub resource_group: Option<String>,

    #[serde(default)]
    pub ssh_key_name: Option<String>,

    #[serde(default)]
    pub security_group: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AwsCredentials {
    pub access_key: String,
    pub access_secret: String,
    pub region: String,
    pub subnet_id: String,
    pub security_group_ids: Vec<String>,

    #[serde(default)]
    pub key_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BaremetalCredentials {
    /// Teuthology node that owns the lock database.
    pub server: String,

    #[serde(default = "default_teuthology_user")]
    pub user: String,

    /// Lock owner recorded with `teuthology-lock`.
    pub owner: String,

    #[serde(default)]
    pub ssh_key_path: Option<String>,

    /// Account freshly imaged machines are reachable as before root login
    /// is enabled.
    #[serde(default = "default_provision_user")]
    pub provision_user: String,

    /// Virtualenv holding the teuthology CLI on the lock server, if it is
    /// not on the login PATH.
    #[serde(default)]
    pub venv_path: Option<String>,
}

fn default_teuthology_user() -> String {
    "teuthology".to_string()
}

fn default_provision_user() -> String {
    "ubuntu".to_string()
}

/// Top level of the inventory file.
#[derive(Debug, Clone, Deserialize)]
pub struct InventoryFile {
    pub instance: InstanceInventory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceInventory {
    pub create: CreateInventory,

    #[serde(default)]
    pub setup: Option<SetupInventory>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CreateInventory {
    pub image_name: String,
    pub vm_size: String,

    #[serde(default)]
    pub networks: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SetupInventory {
    /// cloud-init payload passed through to the provider.
    #[serde(default)]
    pub userdata: Option<String>,

    #[serde(default)]
    pub os_type: Option<String>,

    #[serde(default)]
    pub os_version: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    const LAYOUT: &str = r#"
globals:
  - ceph-cluster:
      name: ceph
      node1:
        role:
          - installer
          - mon
          - mgr
      node2:
        role: osd
        no-of-volumes: 3
        disk-size: 20
      node10:
        role: [client]
        image-name: rhel-9-custom
"#;

    #[test]
    fn layout_nodes_come_back_in_numeric_order() {
        let layout: LayoutFile = serde_yaml::from_str(LAYOUT).unwrap();
        let cluster = layout.clusters().next().unwrap();
        assert_eq!(cluster.name, "ceph");

        let confs = cluster.node_confs().unwrap();
        let keys: Vec<_> = confs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["node1", "node2", "node10"]);

        assert_eq!(confs[0].1.roles(), vec!["installer", "mon", "mgr"]);
        assert_eq!(confs[1].1.roles(), vec!["osd"]);
        assert_eq!(confs[1].1.no_of_volumes, Some(3));
        assert_eq!(confs[2].1.image_name.as_deref(), Some("rhel-9-custom"));
    }

    #[test]
    fn merge_overlay_wins_on_scalars_and_appends_sequences() {
        let mut base: serde_yaml::Value = serde_yaml::from_str(
            "a: 1\nb:\n  c: old\n  keep: true\nlist:\n  - one\n",
        )
        .unwrap();
        let overlay: serde_yaml::Value =
            serde_yaml::from_str("a: 2\nb:\n  c: new\nlist:\n  - two\n")
                .unwrap();

        merge_values(&mut base, overlay);

        assert_eq!(base["a"], serde_yaml::Value::from(2));
        assert_eq!(base["b"]["c"], serde_yaml::Value::from("new"));
        assert_eq!(base["b"]["keep"], serde_yaml::Value::from(true));
        let list = base["list"].as_sequence().unwrap();
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn node_names_follow_the_canonical_scheme() {
        let name = node_name(
            "ceph",
            "jenkins",
            "3f8a12",
            "node2",
            &["mon".to_string(), "osd".to_string()],
        );
        assert_eq!(name, "ceph-jenkins-3f8a12-node2-mon+osd");
    }

    #[test]
    fn long_node_names_drop_role_suffixes() {
        let roles: Vec<String> = vec![
            "mon".into(),
            "mgr".into(),
            "osd".into(),
            "mds".into(),
            "rgw".into(),
            "client".into(),
            "alertmanager".into(),
            "node-exporter".into(),
        ];
        let name =
            node_name("longcluster", "someuser", "0123456789ab", "node12", &roles);
        assert!(name.len() <= 63, "{name} is too long");
        assert!(!name.ends_with('+'));
        assert!(name.starts_with("longcluster-someuser-0123456789ab-node12-"));
    }

    #[test]
    fn multibyte_tags_truncate_on_char_boundaries() {
        // Three-byte characters put the byte limit inside a character, so
        // a naive byte-indexed cut would panic here.
        let tag = "試".repeat(40);
        let name =
            node_name("ceph", &tag, "3f8a12", "node1", &["mon".to_string()]);
        assert!(name.len() <= 63, "{name} is too long");
        assert!(name.starts_with("ceph-試"));
    }

    #[test]
    fn credentials_allow_missing_providers() {
        let creds: CredentialsFile = serde_yaml::from_str(
            r#"
globals:
  openstack-credentials:
    username: ci
    password: secret
    auth-url: https://keystone.example.com:5000/v3
    tenant-name: ceph-ci
"#,
        )
        .unwrap();

        let openstack = creds.globals.openstack.unwrap();
        assert_eq!(openstack.username, "ci");
        assert_eq!(openstack.service_region, "regionOne");
        assert!(creds.globals.ibm.is_none());
        assert!(creds.globals.aws.is_none());
    }

    #[test]
    fn inventory_parses_userdata() {
        let inventory: InventoryFile = serde_yaml::from_str(
            r#"
instance:
  create:
    image-name: rhel-9.2-x86_64
    vm-size: m1.medium
  setup:
    userdata: |
      #cloud-config
      users:
        - name: cephuser
"#,
        )
        .unwrap();

        assert_eq!(inventory.instance.create.image_name, "rhel-9.2-x86_64");
        let setup = inventory.instance.setup.unwrap();
        assert!(setup.userdata.unwrap().contains("cephuser"));
    }

    #[test]
    fn load_layout_applies_override_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("layout.yaml");
        let extra = dir.path().join("extra-cluster.yaml");
        std::fs::write(&base, LAYOUT).unwrap();
        std::fs::write(
            &extra,
            "globals:\n  - ceph-cluster:\n      name: cephb\n      node1:\n        role: mon\n",
        )
        .unwrap();

        let layout = load_layout(
            Utf8Path::from_path(&base).unwrap(),
            Some(Utf8Path::from_path(&extra).unwrap()),
        )
        .unwrap();

        // Sequences append under the merge, so the override's cluster lands
        // after the base one.
        let names: Vec<_> = layout.clusters().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["ceph", "cephb"]);
    }
}
