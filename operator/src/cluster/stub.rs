//! In memory stand-ins for a running cluster and its persisted state.
use std::{
    collections::{BTreeMap, VecDeque},
    fs,
    sync::Mutex,
};

use anyhow::anyhow;
use async_trait::async_trait;
use mockall::mock;

use crate::{
    ceph::{
        client::{AuthEntry, AuthList, CephClient, CommandIdentity, DaemonsVersions},
        info::ClusterInfo,
        version::CephVersion,
    },
    cluster::{
        daemons::{CephDaemons, DaemonKind},
        resources::ClusterResources,
        version::VersionDetector,
        CephCluster, CephClusterStatus, CephxStatus,
    },
    error::{Error, Result},
};

#[derive(Default)]
struct FakeCephState {
    auth: BTreeMap<String, String>,
    rotated_keys: VecDeque<String>,
    created: usize,
    fail_rotate: bool,
    versions: DaemonsVersions,
    health: String,
}

/// Cluster that authenticates commands against its own key table.
///
/// A command succeeds only when the keyring file of its identity holds the key the cluster knows
/// for that entity.
pub struct FakeCeph {
    state: Mutex<FakeCephState>,
}

impl FakeCeph {
    pub fn new(auth: &[(&str, &str)]) -> Self {
        Self {
            state: Mutex::new(FakeCephState {
                auth: auth
                    .iter()
                    .map(|(entity, key)| ((*entity).to_owned(), (*key).to_owned()))
                    .collect(),
                health: "HEALTH_OK".to_owned(),
                ..Default::default()
            }),
        }
    }

    /// Key handed out by the next `auth rotate`.
    pub fn queue_rotated_key(&self, key: &str) {
        self.state.lock().unwrap().rotated_keys.push_back(key.to_owned());
    }

    /// Make the next `auth rotate` fail without changing anything.
    pub fn fail_next_rotate(&self) {
        self.state.lock().unwrap().fail_rotate = true;
    }

    pub fn set_versions(&self, versions: DaemonsVersions) {
        self.state.lock().unwrap().versions = versions;
    }

    pub fn set_health(&self, health: &str) {
        self.state.lock().unwrap().health = health.to_owned();
    }

    pub fn key(&self, entity: &str) -> Option<String> {
        self.state.lock().unwrap().auth.get(entity).cloned()
    }

    pub fn has_entity(&self, entity: &str) -> bool {
        self.key(entity).is_some()
    }

    fn authenticate(&self, id: &CommandIdentity) -> Result<()> {
        let keyring = fs::read_to_string(&id.keyring)
            .map_err(|err| Error::backend(anyhow!("{}: {err}", id.keyring.display())))?;
        let presented = keyring
            .lines()
            .find_map(|line| line.trim().strip_prefix("key = "))
            .map(str::to_owned);
        let known = self.key(&id.username);
        if presented.is_none() || presented != known {
            return Err(Error::backend(anyhow!(
                "{} failed to authenticate: permission denied",
                id.username
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CephClient for FakeCeph {
    async fn auth_list(&self, _cluster: &ClusterInfo, id: &CommandIdentity) -> Result<AuthList> {
        self.authenticate(id)?;
        let state = self.state.lock().unwrap();
        Ok(AuthList {
            auth_dump: state
                .auth
                .iter()
                .map(|(entity, key)| AuthEntry {
                    entity: entity.clone(),
                    key: key.clone(),
                    ..Default::default()
                })
                .collect(),
        })
    }

    async fn auth_get_or_create_key(
        &self,
        _cluster: &ClusterInfo,
        id: &CommandIdentity,
        entity: &str,
        _caps: &[&str],
    ) -> Result<String> {
        self.authenticate(id)?;
        let mut state = self.state.lock().unwrap();
        state.created += 1;
        let fresh = format!("CREATED{}==", state.created);
        Ok(state.auth.entry(entity.to_owned()).or_insert(fresh).clone())
    }

    async fn auth_rotate(
        &self,
        _cluster: &ClusterInfo,
        id: &CommandIdentity,
        entity: &str,
    ) -> Result<String> {
        self.authenticate(id)?;
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_rotate) {
            return Err(Error::backend(anyhow!("auth rotate {entity}: connection lost")));
        }
        let key = state
            .rotated_keys
            .pop_front()
            .ok_or_else(|| Error::backend(anyhow!("no rotated key queued")))?;
        state.auth.insert(entity.to_owned(), key.clone());
        Ok(key)
    }

    async fn auth_delete(
        &self,
        _cluster: &ClusterInfo,
        id: &CommandIdentity,
        entity: &str,
    ) -> Result<()> {
        self.authenticate(id)?;
        self.state.lock().unwrap().auth.remove(entity);
        Ok(())
    }

    async fn versions(
        &self,
        _cluster: &ClusterInfo,
        id: &CommandIdentity,
    ) -> Result<DaemonsVersions> {
        self.authenticate(id)?;
        Ok(self.state.lock().unwrap().versions.clone())
    }

    async fn health(&self, _cluster: &ClusterInfo, id: &CommandIdentity) -> Result<String> {
        self.authenticate(id)?;
        Ok(self.state.lock().unwrap().health.clone())
    }
}

#[derive(Default)]
struct StubResourcesState {
    info: Option<ClusterInfo>,
    rotator: Option<String>,
    cephx: Option<CephxStatus>,
    statuses: Vec<CephClusterStatus>,
}

/// Persisted cluster state kept in memory.
#[derive(Default)]
pub struct StubResources {
    state: Mutex<StubResourcesState>,
}

impl StubResources {
    pub fn with_info(info: ClusterInfo) -> Self {
        let resources = Self::default();
        resources.state.lock().unwrap().info = Some(info);
        resources
    }

    pub fn info(&self) -> Option<ClusterInfo> {
        self.state.lock().unwrap().info.clone()
    }

    pub fn saved_admin_key(&self) -> Option<String> {
        self.info().map(|info| info.ceph_cred.secret)
    }

    pub fn rotator_keyring(&self) -> Option<String> {
        self.state.lock().unwrap().rotator.clone()
    }

    pub fn cephx_status(&self) -> Option<CephxStatus> {
        self.state.lock().unwrap().cephx.clone()
    }

    /// Every status written, oldest first.
    pub fn statuses(&self) -> Vec<CephClusterStatus> {
        self.state.lock().unwrap().statuses.clone()
    }

    pub fn phases(&self) -> Vec<String> {
        self.statuses()
            .into_iter()
            .filter_map(|status| status.phase)
            .collect()
    }
}

#[async_trait]
impl ClusterResources for StubResources {
    async fn load_cluster_info(&self, _namespace: &str) -> Result<Option<ClusterInfo>> {
        Ok(self.info())
    }

    async fn save_cluster_info(&self, info: &ClusterInfo) -> Result<()> {
        self.state.lock().unwrap().info = Some(info.clone());
        Ok(())
    }

    async fn get_rotator_keyring(&self, _namespace: &str) -> Result<Option<String>> {
        Ok(self.rotator_keyring())
    }

    async fn save_rotator_keyring(&self, _namespace: &str, keyring: &str) -> Result<()> {
        self.state.lock().unwrap().rotator = Some(keyring.to_owned());
        Ok(())
    }

    async fn delete_rotator_keyring(&self, _namespace: &str) -> Result<()> {
        self.state.lock().unwrap().rotator = None;
        Ok(())
    }

    async fn update_cephx_status(
        &self,
        _namespace: &str,
        _name: &str,
        status: &CephxStatus,
    ) -> Result<()> {
        self.state.lock().unwrap().cephx = Some(status.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        _namespace: &str,
        _name: &str,
        status: &CephClusterStatus,
    ) -> Result<()> {
        self.state.lock().unwrap().statuses.push(status.clone());
        Ok(())
    }
}

mock! {
    pub VersionDetectorTest {}
    #[async_trait]
    impl VersionDetector for VersionDetectorTest {
        async fn detect(&self, cluster: &CephCluster, image: &str) -> Result<CephVersion>;
    }
}

mock! {
    pub CephDaemonsTest {}
    #[async_trait]
    impl CephDaemons for CephDaemonsTest {
        async fn start(
            &self,
            kind: DaemonKind,
            cluster: &CephCluster,
            info: &ClusterInfo,
            mon_count: i32,
        ) -> Result<()>;
    }
}
