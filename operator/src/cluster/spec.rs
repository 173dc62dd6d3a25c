//! Place all spec types into a single module so they can be used as a lightweight dependency
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Primary CRD describing a Ceph cluster the operator should run.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "ceph.rook.io",
    version = "v1",
    kind = "CephCluster",
    plural = "cephclusters",
    status = "CephClusterStatus",
    namespaced,
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".status.version.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CephClusterSpec {
    /// Ceph container image and whether unsupported releases are allowed.
    #[serde(default)]
    pub ceph_version: CephVersionSpec,
    /// Host directory where daemons keep configuration and state.
    /// Required for clusters the operator runs itself.
    #[serde(default)]
    pub data_dir_host_path: String,
    /// Upgrade even when `ceph health` does not report HEALTH_OK.
    #[serde(default)]
    pub skip_upgrade_checks: bool,
    /// Connect to an existing cluster instead of running daemons.
    #[serde(default)]
    pub external: ExternalSpec,
    /// Monitor placement.
    #[serde(default)]
    pub mon: MonSpec,
    /// Manager placement.
    #[serde(default)]
    pub mgr: MgrSpec,
    /// Nodes that run OSDs.
    #[serde(default)]
    pub storage: StorageSpec,
    /// RBD mirroring daemons. None disables mirroring.
    pub rbd_mirroring: Option<RbdMirroringSpec>,
    /// Resource requirements keyed by daemon type (mon, mgr, osd, rbdmirror).
    pub resources: Option<BTreeMap<String, ResourceRequirements>>,
    /// Security settings.
    #[serde(default)]
    pub security: SecuritySpec,
}

/// Ceph image to run.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephVersionSpec {
    /// Container image, e.g. quay.io/ceph/ceph:v19.2.3
    #[serde(default)]
    pub image: String,
    /// Allow releases newer than the operator has been tested with.
    #[serde(default)]
    pub allow_unsupported: bool,
}

/// External cluster connection.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSpec {
    /// Enable connection to an externally managed cluster.
    #[serde(default)]
    pub enable: bool,
}

/// Monitor settings.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonSpec {
    /// Number of monitors. Zero selects the default of three.
    #[serde(default)]
    pub count: i32,
    /// Allow more than one monitor on the same node.
    #[serde(default)]
    pub allow_multiple_per_node: bool,
    /// Spread monitors across zones with a tie breaking arbiter.
    pub stretch_cluster: Option<StretchClusterSpec>,
}

/// Stretch cluster topology.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StretchClusterSpec {
    /// Node label holding the zone name.
    pub failure_domain_label: Option<String>,
    /// Zones, exactly one of which must be the arbiter.
    #[serde(default)]
    pub zones: Vec<StretchClusterZone>,
}

/// One zone of a stretch cluster.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StretchClusterZone {
    /// Zone name as found on the failure domain label.
    #[serde(default)]
    pub name: String,
    /// The arbiter zone only runs a monitor.
    #[serde(default)]
    pub arbiter: bool,
}

/// Manager settings.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MgrSpec {
    /// Number of managers, one when unset.
    #[serde(default)]
    pub count: i32,
}

/// Storage selection.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Run OSDs on every schedulable node.
    #[serde(default)]
    pub use_all_nodes: bool,
    /// Nodes that run OSDs. Order is not significant.
    #[serde(default)]
    pub nodes: Vec<StorageNode>,
}

/// A node that runs OSDs.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageNode {
    /// Kubernetes node name.
    pub name: String,
    /// Devices to consume, all available devices when empty.
    #[serde(default)]
    pub devices: Vec<String>,
    /// Per node override of the osd resources.
    pub resources: Option<ResourceRequirements>,
    /// OSD configuration passed through to the daemon.
    pub config: Option<BTreeMap<String, String>>,
}

/// RBD mirror daemons.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RbdMirroringSpec {
    /// Number of rbd-mirror daemons.
    #[serde(default)]
    pub workers: i32,
}

/// Security settings.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySpec {
    /// Cephx key management.
    #[serde(default)]
    pub cephx: ClusterCephxConfig,
}

/// Cephx settings by key owner.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCephxConfig {
    /// Keys of the daemons and the admin client.
    #[serde(default)]
    pub daemon: CephxConfig,
}

/// Key rotation policy for a class of cephx keys.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephxConfig {
    /// One of Disabled, KeyGeneration or WithCephVersionUpdate. Empty means Disabled.
    #[serde(default)]
    pub key_rotation_policy: String,
    /// With the KeyGeneration policy, keys are rotated until their generation reaches this value.
    #[serde(default)]
    pub key_generation: u32,
}

/// Current status of a Ceph cluster.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephClusterStatus {
    /// Progressing, Ready, Connected or Failure.
    pub phase: Option<String>,
    /// Human readable detail of the phase.
    pub message: Option<String>,
    /// Version the cluster is running.
    pub version: Option<ClusterVersion>,
    /// Upgrade was in progress during the last orchestration.
    #[serde(default)]
    pub is_upgrade: bool,
    /// Cephx key state.
    #[serde(default)]
    pub cephx: ClusterCephxStatus,
}

/// Running image and version.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersion {
    /// Image detected.
    pub image: String,
    /// Version in `major.minor.extra-build` form.
    pub version: String,
}

/// Cephx status by key owner.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCephxStatus {
    /// The client.admin key.
    #[serde(default)]
    pub admin: CephxStatus,
}

/// Generation and version of a cephx key.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephxStatus {
    /// Times the key has been rotated, counting the initial key as one.
    #[serde(default)]
    pub key_generation: u32,
    /// Ceph version when the key was last rotated, or `Uninitialized` for a new cluster.
    #[serde(default)]
    pub key_ceph_version: String,
}
