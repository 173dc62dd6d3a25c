//! In memory attachment store with the same concurrency semantics as the API server.
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use kube::ResourceExt;

use crate::volume::{AttachmentStore, StoreError, Volume};

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<(String, String), Volume>>,
    version: AtomicUsize,
    /// Number of upcoming updates that fail with a conflict.
    pub conflicts: AtomicUsize,
    /// Number of update calls, conflicting or not.
    pub updates: AtomicUsize,
}

impl MemoryStore {
    pub fn with(records: Vec<Volume>) -> Self {
        let store = Self::default();
        for mut volume in records {
            let ns = volume.namespace().unwrap_or_default();
            volume.metadata.resource_version = Some(store.next_version());
            store
                .records
                .lock()
                .unwrap()
                .insert((ns, volume.name_any()), volume);
        }
        store
    }

    pub fn record(&self, namespace: &str, name: &str) -> Option<Volume> {
        self.records
            .lock()
            .unwrap()
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl AttachmentStore for MemoryStore {
    async fn create(&self, namespace: &str, volume: &Volume) -> Result<Volume, StoreError> {
        let key = (namespace.to_owned(), volume.name_any());
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key.1));
        }
        let mut volume = volume.clone();
        volume.metadata.namespace = Some(namespace.to_owned());
        volume.metadata.resource_version = Some(self.next_version());
        records.insert(key, volume.clone());
        Ok(volume)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Volume, StoreError> {
        self.record(namespace, name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Volume>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, volume)| volume.clone())
            .collect())
    }

    async fn update(&self, namespace: &str, volume: &Volume) -> Result<Volume, StoreError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let key = (namespace.to_owned(), volume.name_any());
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Conflict(key.1));
        }
        let mut records = self.records.lock().unwrap();
        let current = records
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(key.1.clone()))?;
        if current.metadata.resource_version != volume.metadata.resource_version {
            return Err(StoreError::Conflict(key.1));
        }
        let mut volume = volume.clone();
        volume.metadata.resource_version = Some(self.next_version());
        records.insert(key, volume.clone());
        Ok(volume)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap()
            .remove(&(namespace.to_owned(), name.to_owned()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))
    }
}
