//! Flexvolume driver support: the per-node coordinator that attaches block images and
//! filesystems into pods, the socket server the driver binary talks to, and the driver itself.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod controller;
pub mod host;
pub mod manager;
pub mod mountdir;
pub mod plugin;
pub mod rpc;
pub mod server;

#[cfg(test)]
pub mod stub;

/// Name of the socket inside the driver directory.
pub const UNIX_SOCKET_NAME: &str = ".rook.sock";
/// Driver vendor.
pub const FLEXVOLUME_VENDOR: &str = "ceph.rook.io";
/// Vendor used by old releases, still installed on request.
pub const FLEXVOLUME_VENDOR_LEGACY: &str = "rook.io";
/// Capability descriptor written next to the driver binary.
pub const SETTINGS_FILE_NAME: &str = "flex.config";
/// Default driver name.
pub const DEFAULT_DRIVER_NAME: &str = "rook";
/// Default kubelet root directory.
pub const DEFAULT_KUBELET_ROOT_DIR: &str = "/var/lib/kubelet";
/// Cluster namespace used when a storage class names none.
pub const DEFAULT_CLUSTER_NAMESPACE: &str = "rook-ceph";

/// Which credentials a filesystem mount may use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum MountSecurityMode {
    /// Fall back to the admin credential when none is given.
    #[default]
    Any,
    /// Require an explicit user and secret.
    Restricted,
}

/// Options of a volume as passed by the kubelet, augmented by the coordinator.
///
/// Field names follow the keys the kubelet uses in the JSON options blob.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AttachOptions {
    /// RBD image name
    pub image: String,
    /// Pool of the image, as named by storage classes
    pub block_pool: String,
    /// Pool of the image
    pub pool: String,
    /// Namespace of the cluster providing the volume
    pub cluster_namespace: String,
    /// Legacy name of cluster_namespace
    pub cluster_name: String,
    /// Storage class the volume was provisioned from
    pub storage_class: String,
    /// Pod scoped mount point
    pub mount_dir: String,
    /// CephFS filesystem name
    pub fs_name: String,
    /// Path inside the CephFS filesystem
    pub path: String,
    /// User for filesystem mounts
    pub mount_user: String,
    /// Name of a secret holding the key of mount_user
    pub mount_secret: String,
    /// "ro" or "rw"
    #[serde(rename = "kubernetes.io/readwrite")]
    pub read_write_mode: String,
    /// Filesystem type of block volumes
    #[serde(rename = "kubernetes.io/fsType")]
    pub fs_type: String,
    /// Group to give ownership of the volume root
    #[serde(rename = "kubernetes.io/fsGroup")]
    pub fs_group: String,
    /// Persistent volume name
    #[serde(rename = "kubernetes.io/pvOrVolumeName")]
    pub volume_name: String,
    /// Pod name
    #[serde(rename = "kubernetes.io/pod.name")]
    pub pod_name: String,
    /// Pod UID
    #[serde(rename = "kubernetes.io/pod.uid")]
    pub pod_id: String,
    /// Pod namespace
    #[serde(rename = "kubernetes.io/pod.namespace")]
    pub pod_namespace: String,
}

impl AttachOptions {
    /// Whether the pod asked for a read-only mount.
    pub fn read_only(&self) -> bool {
        self.read_write_mode == "ro"
    }

    /// The pool, preferring `pool` over `blockPool`.
    pub fn effective_pool(&self) -> &str {
        if self.pool.is_empty() {
            &self.block_pool
        } else {
            &self.pool
        }
    }

    /// The cluster namespace, preferring `clusterNamespace` over the legacy `clusterName`.
    pub fn effective_cluster_namespace(&self) -> &str {
        if self.cluster_namespace.is_empty() {
            &self.cluster_name
        } else {
            &self.cluster_namespace
        }
    }
}

/// Monitors and credential for mounting a filesystem.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientAccessInfo {
    /// Monitor endpoints
    pub monitors: Vec<String>,
    /// User without the `client.` prefix
    pub user_name: String,
    /// Cephx key
    pub secret_key: String,
}

/// Input of GetGlobalMountPath.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalMountPathInput {
    /// Persistent volume name
    pub volume_name: String,
    /// Directory of the driver binary, ending in `vendor~driver`
    pub driver_dir: String,
}

/// Input of Expand.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandArgs {
    /// Volume to expand
    pub options: AttachOptions,
    /// New size in bytes
    pub size_bytes: u64,
}

/// A message the driver wants logged by the long running agent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    /// Text
    pub message: String,
    /// Log at error level
    pub is_error: bool,
}

/// Operations the flexvolume driver invokes on the node agent.
#[async_trait]
pub trait VolumeController: Send + Sync {
    /// Record the attachment and map the image, returning the device path.
    async fn attach(&self, opts: &AttachOptions) -> Result<String>;
    /// Unmap the image and drop the record once it has no attachments.
    async fn detach(&self, opts: &AttachOptions) -> Result<()>;
    /// Like detach, forcing the unmap.
    async fn detach_force(&self, opts: &AttachOptions) -> Result<()>;
    /// Remove the attachment at `opts.mount_dir`, reporting whether it was the last one on this
    /// node.
    async fn remove_attachment_object(&self, opts: &AttachOptions) -> Result<bool>;
    /// Fill in what the kubelet does not pass on unmount.
    async fn get_attach_info_from_mount_dir(
        &self,
        mount_dir: &str,
        opts: AttachOptions,
    ) -> Result<AttachOptions>;
    /// Staging path the device is mounted at before being bind mounted into pods.
    async fn get_global_mount_path(&self, input: &GlobalMountPathInput) -> Result<String>;
    /// Monitors and credential for a filesystem mount.
    async fn get_client_access_info(
        &self,
        cluster_namespace: &str,
        pod_namespace: &str,
        mount_user: &str,
        mount_secret: &str,
    ) -> Result<ClientAccessInfo>;
    /// Kernel version of this node.
    async fn get_kernel_version(&self) -> Result<String>;
    /// Grow the image.
    async fn expand(&self, args: &ExpandArgs) -> Result<()>;
    /// Log on behalf of the driver.
    async fn log(&self, message: &LogMessage) -> Result<()>;
}
