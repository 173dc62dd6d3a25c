use async_trait::async_trait;
use kube::{
    api::{DeleteParams, ListParams, PostParams},
    Api, Client, ResourceExt,
};
use tracing::debug;

use crate::volume::Volume;

/// Errors from the attachment record store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No record with that name.
    #[error("volume record {0} not found")]
    NotFound(String),
    /// Create raced with another create.
    #[error("volume record {0} already exists")]
    AlreadyExists(String),
    /// Update raced with another update.
    #[error("volume record {0} was modified concurrently")]
    Conflict(String),
    /// Any other API failure.
    #[error("Kube error: {0}")]
    Kube(#[source] kube::Error),
}

fn store_error(err: kube::Error, name: &str) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(name.to_owned()),
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(name.to_owned())
        }
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict(name.to_owned()),
        err => StoreError::Kube(err),
    }
}

/// CRUD over attachment records keyed by namespace and volume name.
///
/// Updates carry the resource version they read, so concurrent writers lose with
/// [`StoreError::Conflict`] rather than overwrite each other.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Create a record, failing with AlreadyExists if one exists.
    async fn create(&self, namespace: &str, volume: &Volume) -> Result<Volume, StoreError>;
    /// Read a record.
    async fn get(&self, namespace: &str, name: &str) -> Result<Volume, StoreError>;
    /// Every record in the namespace.
    async fn list(&self, namespace: &str) -> Result<Vec<Volume>, StoreError>;
    /// Replace a record previously read.
    async fn update(&self, namespace: &str, volume: &Volume) -> Result<Volume, StoreError>;
    /// Delete a record.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// Stores records as `Volume` custom resources.
#[derive(Clone)]
pub struct KubeAttachmentStore {
    client: Client,
}

impl KubeAttachmentStore {
    /// Store backed by the given API client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Volume> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl AttachmentStore for KubeAttachmentStore {
    async fn create(&self, namespace: &str, volume: &Volume) -> Result<Volume, StoreError> {
        let name = volume.name_any();
        debug!(namespace, name = %name, "creating volume record");
        self.api(namespace)
            .create(&PostParams::default(), volume)
            .await
            .map_err(|err| store_error(err, &name))
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Volume, StoreError> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|err| store_error(err, name))
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Volume>, StoreError> {
        Ok(self
            .api(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|err| store_error(err, namespace))?
            .items)
    }

    async fn update(&self, namespace: &str, volume: &Volume) -> Result<Volume, StoreError> {
        let name = volume.name_any();
        debug!(namespace, name = %name, attachments = volume.spec.attachments.len(), "updating volume record");
        self.api(namespace)
            .replace(&name, &PostParams::default(), volume)
            .await
            .map_err(|err| store_error(err, &name))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        debug!(namespace, name, "deleting volume record");
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|err| store_error(err, name))
    }
}
