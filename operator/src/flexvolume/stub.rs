//! Test doubles for the coordinator's collaborators.
use std::{collections::BTreeMap, sync::Mutex};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        core::v1::{
            FlexPersistentVolumeSource, Node, NodeStatus, NodeSystemInfo, ObjectReference,
            PersistentVolume, PersistentVolumeSpec, Pod, PodSpec, PodStatus, Secret,
        },
        storage::v1::StorageClass,
    },
    ByteString,
};
use kube::core::ObjectMeta;
use mockall::mock;

use crate::{
    ceph::info::{tests::cluster_info, ClusterInfo},
    error::{Error, Result},
    flexvolume::{
        host::{ClusterInfoLoader, HostPlatform},
        manager::VolumeManager,
        AttachOptions, ClientAccessInfo, ExpandArgs, GlobalMountPathInput, LogMessage,
        VolumeController,
    },
};

mock! {
    pub VolumeManagerTest {}
    #[async_trait]
    impl VolumeManager for VolumeManagerTest {
        async fn init(&self) -> anyhow::Result<()>;
        async fn attach(
            &self,
            image: &str,
            pool: &str,
            user: &str,
            key: &str,
            cluster_namespace: &str,
        ) -> anyhow::Result<String>;
        async fn detach(
            &self,
            image: &str,
            pool: &str,
            user: &str,
            key: &str,
            cluster_namespace: &str,
            force: bool,
        ) -> anyhow::Result<()>;
        async fn expand(
            &self,
            image: &str,
            pool: &str,
            cluster_namespace: &str,
            size_mb: u64,
        ) -> anyhow::Result<()>;
    }
}

mock! {
    pub VolumeControllerTest {}
    #[async_trait]
    impl VolumeController for VolumeControllerTest {
        async fn attach(&self, opts: &AttachOptions) -> Result<String>;
        async fn detach(&self, opts: &AttachOptions) -> Result<()>;
        async fn detach_force(&self, opts: &AttachOptions) -> Result<()>;
        async fn remove_attachment_object(&self, opts: &AttachOptions) -> Result<bool>;
        async fn get_attach_info_from_mount_dir(
            &self,
            mount_dir: &str,
            opts: AttachOptions,
        ) -> Result<AttachOptions>;
        async fn get_global_mount_path(&self, input: &GlobalMountPathInput) -> Result<String>;
        async fn get_client_access_info(
            &self,
            cluster_namespace: &str,
            pod_namespace: &str,
            mount_user: &str,
            mount_secret: &str,
        ) -> Result<ClientAccessInfo>;
        async fn get_kernel_version(&self) -> Result<String>;
        async fn expand(&self, args: &ExpandArgs) -> Result<()>;
        async fn log(&self, message: &LogMessage) -> Result<()>;
    }
}

/// Host platform backed by in memory objects.
#[derive(Default)]
pub struct StubHost {
    pub pods: Mutex<Vec<Pod>>,
    pub volumes: BTreeMap<String, PersistentVolume>,
    pub storage_classes: BTreeMap<String, StorageClass>,
    pub secrets: BTreeMap<(String, String), Secret>,
    pub kernel_version: String,
    pub clusters: BTreeMap<String, ClusterInfo>,
}

impl StubHost {
    /// Host knowing the rook-ceph cluster with admin key `AQadmin==`.
    pub fn new() -> Self {
        Self {
            kernel_version: "5.14.0-284.el9.x86_64".to_owned(),
            clusters: BTreeMap::from_iter(vec![(
                "rook-ceph".to_owned(),
                cluster_info("rook-ceph", "AQadmin=="),
            )]),
            ..Default::default()
        }
    }

    pub fn with_pod(self, namespace: &str, name: &str, uid: &str, node: &str, phase: &str) -> Self {
        self.pods.lock().unwrap().push(Pod {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                uid: Some(uid.to_owned()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_owned()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_owned()),
                ..Default::default()
            }),
        });
        self
    }

    pub fn with_volume(
        mut self,
        name: &str,
        claim_namespace: &str,
        options: &[(&str, &str)],
    ) -> Self {
        let volume = PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                claim_ref: Some(ObjectReference {
                    namespace: Some(claim_namespace.to_owned()),
                    ..Default::default()
                }),
                flex_volume: Some(FlexPersistentVolumeSource {
                    driver: "ceph.rook.io/rook".to_owned(),
                    options: Some(
                        options
                            .iter()
                            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                            .collect(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        };
        self.volumes.insert(name.to_owned(), volume);
        self
    }

    pub fn with_storage_class(mut self, name: &str, parameters: &[(&str, &str)]) -> Self {
        self.storage_classes.insert(
            name.to_owned(),
            StorageClass {
                metadata: ObjectMeta {
                    name: Some(name.to_owned()),
                    ..Default::default()
                },
                parameters: Some(
                    parameters
                        .iter()
                        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                        .collect(),
                ),
                provisioner: "ceph.rook.io/block".to_owned(),
                ..Default::default()
            },
        );
        self
    }

    pub fn with_secret(mut self, namespace: &str, name: &str, data: &[(&str, &str)]) -> Self {
        self.secrets.insert(
            (namespace.to_owned(), name.to_owned()),
            Secret {
                metadata: ObjectMeta {
                    name: Some(name.to_owned()),
                    namespace: Some(namespace.to_owned()),
                    ..Default::default()
                },
                data: Some(
                    data.iter()
                        .map(|(k, v)| ((*k).to_owned(), ByteString(v.as_bytes().to_vec())))
                        .collect(),
                ),
                ..Default::default()
            },
        );
        self
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.pods.lock().unwrap().retain(|pod| {
            pod.metadata.namespace.as_deref() != Some(namespace)
                || pod.metadata.name.as_deref() != Some(name)
        });
    }
}

fn not_found(what: String) -> Error {
    Error::NotFound(what)
}

#[async_trait]
impl ClusterInfoLoader for StubHost {
    async fn cluster_info(&self, namespace: &str) -> Result<ClusterInfo> {
        self.clusters
            .get(namespace)
            .cloned()
            .ok_or_else(|| not_found(format!("cluster info for namespace {namespace}")))
    }
}

#[async_trait]
impl HostPlatform for StubHost {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .find(|pod| {
                pod.metadata.namespace.as_deref() == Some(namespace)
                    && pod.metadata.name.as_deref() == Some(name)
            })
            .cloned())
    }

    async fn list_node_pods(&self, namespace: &str, node: &str) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|pod| {
                pod.metadata.namespace.as_deref() == Some(namespace)
                    && pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node)
            })
            .cloned()
            .collect())
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<PersistentVolume> {
        self.volumes
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(format!("persistent volume {name}")))
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass> {
        self.storage_classes
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(format!("storage class {name}")))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.secrets
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
            .ok_or_else(|| not_found(format!("secret {namespace}/{name}")))
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        Ok(Node {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                node_info: Some(NodeSystemInfo {
                    kernel_version: self.kernel_version.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}
