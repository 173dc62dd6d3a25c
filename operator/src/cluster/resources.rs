//! Persisted state of a cluster: its identity secret, the rotator marker and the CR status.
use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{DeleteParams, Patch, PatchParams},
    core::ObjectMeta,
    Api, Client, Resource,
};
use tracing::debug;

use crate::{
    ceph::info::{format_mon_endpoints, ClusterInfo, MON_ENDPOINTS_CONFIG_MAP_NAME, MON_ENDPOINTS_KEY, MON_SECRET_NAME},
    cluster::{CephCluster, CephClusterStatus, CephxStatus},
    error::Result,
    flexvolume::host::load_cluster_info,
    labels::managed_labels_extend,
    utils::apply_config_map,
    CONTROLLER_NAME,
};

/// Secret holding the rotator keyring while an admin key rotation is in flight.
pub const ROTATOR_SECRET_NAME: &str = "rook-ceph-admin-rotator-keyring";
/// Key of the keyring in [`ROTATOR_SECRET_NAME`].
pub const ROTATOR_SECRET_KEY: &str = "keyring";
/// Label naming the cluster a secret belongs to.
pub const CLUSTER_LABEL: &str = "ceph.rook.io/cluster";

/// Define the persisted cluster state we read and write.
#[async_trait]
pub trait ClusterResources: Send + Sync {
    /// Identity of the cluster in `namespace`, None for a new cluster.
    async fn load_cluster_info(&self, namespace: &str) -> Result<Option<ClusterInfo>>;
    /// Persist the identity secret and the monitor endpoints.
    async fn save_cluster_info(&self, info: &ClusterInfo) -> Result<()>;
    /// Rotator keyring, None when no rotation is in flight.
    async fn get_rotator_keyring(&self, namespace: &str) -> Result<Option<String>>;
    /// Persist the rotator keyring.
    async fn save_rotator_keyring(&self, namespace: &str, keyring: &str) -> Result<()>;
    /// Remove the rotator keyring. Removing a missing one succeeds.
    async fn delete_rotator_keyring(&self, namespace: &str) -> Result<()>;
    /// Replace the recorded admin key status.
    async fn update_cephx_status(&self, namespace: &str, name: &str, status: &CephxStatus)
        -> Result<()>;
    /// Merge `status` into the cluster status. The admin key status is left as is; only
    /// [`ClusterResources::update_cephx_status`] writes it.
    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CephClusterStatus,
    ) -> Result<()>;
}

/// Cluster state stored in Kubernetes objects.
#[derive(Clone)]
pub struct KubeClusterResources {
    client: Client,
}

impl KubeClusterResources {
    /// Resources read and written through the given API client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        labels: Option<BTreeMap<String, String>>,
        string_data: BTreeMap<String, String>,
    ) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                labels: managed_labels_extend(labels),
                ..ObjectMeta::default()
            },
            string_data: Some(string_data),
            ..Default::default()
        };
        secrets
            .patch(
                name,
                &PatchParams::apply(CONTROLLER_NAME).force(),
                &Patch::Apply(secret),
            )
            .await?;
        debug!(namespace, secret = name, "applied secret");
        Ok(())
    }

    async fn patch_status(&self, namespace: &str, name: &str, status: serde_json::Value) -> Result<()> {
        let clusters: Api<CephCluster> = Api::namespaced(self.client.clone(), namespace);
        clusters
            .patch_status(
                name,
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({ "status": status })),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterResources for KubeClusterResources {
    async fn load_cluster_info(&self, namespace: &str) -> Result<Option<ClusterInfo>> {
        load_cluster_info(&self.client, namespace).await
    }

    async fn save_cluster_info(&self, info: &ClusterInfo) -> Result<()> {
        let labels = BTreeMap::from_iter(vec![(CLUSTER_LABEL.to_owned(), info.name.clone())]);
        self.apply_secret(&info.namespace, MON_SECRET_NAME, Some(labels), info.secret_data())
            .await?;
        apply_config_map(
            &self.client,
            &info.namespace,
            vec![],
            MON_ENDPOINTS_CONFIG_MAP_NAME,
            BTreeMap::from_iter(vec![(
                MON_ENDPOINTS_KEY.to_owned(),
                format_mon_endpoints(&info.monitors),
            )]),
        )
        .await?;
        Ok(())
    }

    async fn get_rotator_keyring(&self, namespace: &str) -> Result<Option<String>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(secrets
            .get_opt(ROTATOR_SECRET_NAME)
            .await?
            .and_then(|secret| secret.data)
            .and_then(|mut data| data.remove(ROTATOR_SECRET_KEY))
            .map(|keyring| String::from_utf8_lossy(&keyring.0).into_owned()))
    }

    async fn save_rotator_keyring(&self, namespace: &str, keyring: &str) -> Result<()> {
        self.apply_secret(
            namespace,
            ROTATOR_SECRET_NAME,
            None,
            BTreeMap::from_iter(vec![(ROTATOR_SECRET_KEY.to_owned(), keyring.to_owned())]),
        )
        .await
    }

    async fn delete_rotator_keyring(&self, namespace: &str) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match secrets
            .delete(ROTATOR_SECRET_NAME, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn update_cephx_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CephxStatus,
    ) -> Result<()> {
        self.patch_status(
            namespace,
            name,
            serde_json::json!({ "cephx": { "admin": status } }),
        )
        .await
    }

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CephClusterStatus,
    ) -> Result<()> {
        let mut status = serde_json::to_value(status).map_err(anyhow::Error::from)?;
        if let Some(fields) = status.as_object_mut() {
            fields.remove("cephx");
        }
        self.patch_status(namespace, name, status).await
    }
}

/// Kubernetes object key of a cluster.
pub fn cluster_key(cluster: &CephCluster) -> String {
    format!(
        "{}/{}",
        cluster.meta().namespace.as_deref().unwrap_or_default(),
        cluster.meta().name.as_deref().unwrap_or_default()
    )
}
