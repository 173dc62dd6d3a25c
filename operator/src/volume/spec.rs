//! Place all spec types into a single module so they can be used as a lightweight dependency
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Record of the pods a persistent volume is attached to. Named after the persistent volume.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "rook.io",
    version = "v1alpha2",
    kind = "Volume",
    plural = "volumes",
    namespaced,
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Namespace of the cluster that provides the volume.
    #[serde(default)]
    pub cluster_namespace: String,
    /// Current attachments. At most one may be read-write, in which case it is the only one.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// One pod's mount of the volume on one node.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Node the pod runs on.
    pub node: String,
    /// Namespace of the pod.
    pub pod_namespace: String,
    /// Name of the pod.
    pub pod_name: String,
    /// Namespace of the cluster providing the volume.
    pub cluster_name: String,
    /// Pod scoped mount point chosen by the kubelet.
    pub mount_dir: String,
    /// Whether the pod mounted the volume read-only.
    pub read_only: bool,
}

impl Volume {
    /// A record with a single attachment, ready to be created.
    pub fn with_attachment(
        namespace: &str,
        volume_name: &str,
        cluster_namespace: &str,
        attachment: Attachment,
    ) -> Self {
        let mut volume = Volume::new(
            volume_name,
            VolumeSpec {
                cluster_namespace: cluster_namespace.to_owned(),
                attachments: vec![attachment],
            },
        );
        volume.metadata.namespace = Some(namespace.to_owned());
        volume
    }

    /// Index of the attachment at `mount_dir`.
    pub fn find_mount_dir(&self, mount_dir: &str) -> Option<usize> {
        self.spec
            .attachments
            .iter()
            .position(|a| a.mount_dir == mount_dir)
    }

    /// Index of the read-write attachment, if any.
    pub fn read_write_attachment(&self) -> Option<usize> {
        self.spec.attachments.iter().position(|a| !a.read_only)
    }
}
