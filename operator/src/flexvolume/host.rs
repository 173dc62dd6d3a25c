//! Lookups against the host platform the coordinator depends on.
use async_trait::async_trait;
use k8s_openapi::api::{
    core::v1::{ConfigMap, Node, PersistentVolume, Pod, Secret},
    storage::v1::StorageClass,
};
use kube::{api::ListParams, Api, Client};

use crate::{
    ceph::info::{ClusterInfo, MON_ENDPOINTS_CONFIG_MAP_NAME, MON_ENDPOINTS_KEY, MON_SECRET_NAME},
    error::{Error, Result},
};

/// Loads the identity of a cluster from its persisted secret.
#[async_trait]
pub trait ClusterInfoLoader: Send + Sync {
    /// Identity of the cluster in `namespace`.
    async fn cluster_info(&self, namespace: &str) -> Result<ClusterInfo>;
}

/// Define the behavior we consume from the host platform.
#[async_trait]
pub trait HostPlatform: ClusterInfoLoader {
    /// A pod, None if it does not exist.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
    /// Pods in `namespace` scheduled to `node`.
    async fn list_node_pods(&self, namespace: &str, node: &str) -> Result<Vec<Pod>>;
    /// A persistent volume.
    async fn get_persistent_volume(&self, name: &str) -> Result<PersistentVolume>;
    /// A storage class.
    async fn get_storage_class(&self, name: &str) -> Result<StorageClass>;
    /// A secret.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;
    /// A node.
    async fn get_node(&self, name: &str) -> Result<Node>;
}

/// Host lookups through the Kubernetes API.
#[derive(Clone)]
pub struct KubeHost {
    client: Client,
}

impl KubeHost {
    /// Host backed by the given API client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Read the cluster identity persisted by the operator in `namespace`.
pub async fn load_cluster_info(client: &Client, namespace: &str) -> Result<Option<ClusterInfo>> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let Some(secret) = secrets.get_opt(MON_SECRET_NAME).await? else {
        return Ok(None);
    };
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let endpoints = config_maps
        .get_opt(MON_ENDPOINTS_CONFIG_MAP_NAME)
        .await?
        .and_then(|cm| cm.data)
        .and_then(|mut data| data.remove(MON_ENDPOINTS_KEY));
    // The cluster resource is named after its namespace unless recorded otherwise.
    let name = secret
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get("ceph.rook.io/cluster"))
        .cloned()
        .unwrap_or_else(|| namespace.to_owned());
    ClusterInfo::from_secret_data(
        namespace,
        &name,
        &secret.data.unwrap_or_default(),
        endpoints.as_deref(),
    )
    .map(Some)
}

#[async_trait]
impl ClusterInfoLoader for KubeHost {
    async fn cluster_info(&self, namespace: &str) -> Result<ClusterInfo> {
        load_cluster_info(&self.client, namespace)
            .await?
            .ok_or_else(|| Error::NotFound(format!("cluster info for namespace {namespace}")))
    }
}

#[async_trait]
impl HostPlatform for KubeHost {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.get_opt(name).await?)
    }

    async fn list_node_pods(&self, namespace: &str, node: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        Ok(pods.list(&params).await?.items)
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<PersistentVolume> {
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(volumes.get(name).await?)
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass> {
        let classes: Api<StorageClass> = Api::all(self.client.clone());
        Ok(classes.get(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(secrets.get(name).await?)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.get(name).await?)
    }
}
