//! Rotation of the cluster's administrative cephx key.
//!
//! A temporary rotator identity with admin capabilities performs the rotation so that at every
//! step at least one working admin key exists. The rotator keyring is persisted in a secret before
//! anything changes on the cluster; while that secret exists a rotation is in flight and
//! [`AdminKeyRotator::recover`] finishes it.
use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use crate::{
    ceph::{
        client::{CephClient, CommandIdentity},
        info::{write_connection_config, ClusterInfo},
        keyring::{
            admin_keyring, gen_keyring, should_rotate_cephx_keys, updated_cephx_status,
            ADMIN_CAPS, ADMIN_ROTATOR_USERNAME, ADMIN_USERNAME,
        },
        version::CephVersion,
    },
    cluster::{resources::ClusterResources, CephxConfig, CephxStatus},
    error::{Error, Result},
    utils::write_file_atomic,
};

/// Directory below the cluster config dir holding keyrings during a rotation.
pub const ROTATE_DIR: &str = "admin-rotate";

/// Receives the request to restart all work after the admin key changed.
pub trait Reloader: Send + Sync {
    /// Ask for a reload. Must not block.
    fn reload(&self);
}

impl Reloader for tokio::sync::Notify {
    fn reload(&self) {
        self.notify_one();
    }
}

static ROTATIONS: Lazy<Mutex<HashSet<String>>> = Lazy::new(Default::default);

/// Exclusive claim on rotating the keys of one cluster, released on drop.
#[derive(Debug)]
pub struct RotationGuard {
    namespace: String,
}

impl RotationGuard {
    /// Claim the rotation lock of `namespace` without waiting.
    pub fn claim(namespace: &str) -> Result<Self> {
        let mut rotations = ROTATIONS.lock().unwrap_or_else(PoisonError::into_inner);
        if !rotations.insert(namespace.to_owned()) {
            return Err(Error::Conflict(format!(
                "admin key rotation already in progress for cluster in namespace {namespace}, retry later"
            )));
        }
        Ok(Self {
            namespace: namespace.to_owned(),
        })
    }
}

impl Drop for RotationGuard {
    fn drop(&mut self) {
        ROTATIONS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.namespace);
    }
}

/// Everything a rotation needs to know about the cluster.
#[derive(Clone, Debug)]
pub struct RotationRequest {
    /// Name of the CephCluster resource
    pub name: String,
    /// Current identity. Its namespace is the cluster's namespace.
    pub info: ClusterInfo,
    /// Desired policy
    pub cfg: CephxConfig,
    /// Recorded admin key status
    pub status: CephxStatus,
    /// Version the cluster runs. When recovering, the monitors are asked instead and this is
    /// only used if they cannot be reached.
    pub running: CephVersion,
    /// Version of the desired image
    pub image: CephVersion,
}

/// Rotates the admin key and recovers interrupted rotations.
pub struct AdminKeyRotator<C: ?Sized, R: ?Sized> {
    ceph: Arc<C>,
    resources: Arc<R>,
    reloader: Arc<dyn Reloader>,
    config_dir: PathBuf,
}

impl<C, R> AdminKeyRotator<C, R>
where
    C: CephClient + ?Sized + 'static,
    R: ClusterResources + ?Sized + 'static,
{
    /// Create a rotator writing keyrings below `config_dir`.
    pub fn new(
        ceph: Arc<C>,
        resources: Arc<R>,
        reloader: Arc<dyn Reloader>,
        config_dir: impl AsRef<Path>,
    ) -> Self {
        Self {
            ceph,
            resources,
            reloader,
            config_dir: config_dir.as_ref().to_owned(),
        }
    }

    /// Rotate the admin key when the policy asks for it.
    ///
    /// Returns Ok when no rotation was needed and [`Error::SuccessfulAdminKeyRotation`] after a
    /// rotation; the caller must stop its reconcile and let the process reload. The rotation runs
    /// on its own task so dropping the returned future does not interrupt it.
    pub async fn rotate(self: &Arc<Self>, request: RotationRequest) -> Result<()> {
        let rotator = self.clone();
        tokio::spawn(async move { rotator.rotate_locked(request).await })
            .await
            .map_err(anyhow::Error::from)?
    }

    /// Finish a rotation a previous run left behind. Does nothing when none is in flight.
    pub async fn recover(self: &Arc<Self>, request: RotationRequest) -> Result<()> {
        let namespace = &request.info.namespace;
        let Some(keyring) = self.resources.get_rotator_keyring(namespace).await? else {
            return Ok(());
        };
        info!(%namespace, "recovering interrupted admin key rotation");
        let rotator = self.clone();
        tokio::spawn(async move { rotator.recover_locked(request, keyring).await })
            .await
            .map_err(anyhow::Error::from)?
    }

    async fn rotate_locked(&self, request: RotationRequest) -> Result<()> {
        let _guard = RotationGuard::claim(&request.info.namespace)?;
        let RotationRequest {
            info,
            cfg,
            status,
            running,
            image,
            ..
        } = &request;

        if info.ceph_cred.username != ADMIN_USERNAME {
            debug!(user = %info.ceph_cred.username, "not the admin user, skipping key rotation");
            return Ok(());
        }
        if !should_rotate_cephx_keys(cfg, running, image, status)? {
            let updated = updated_cephx_status(false, cfg, running, status);
            if &updated != status {
                self.resources
                    .update_cephx_status(&info.namespace, &request.name, &updated)
                    .await?;
            }
            return Ok(());
        }

        info!(namespace = %info.namespace, generation = status.key_generation, "rotating admin key");
        let admin = info.admin_identity(&self.config_dir);
        let key = self
            .ceph
            .auth_get_or_create_key(info, &admin, ADMIN_ROTATOR_USERNAME, ADMIN_CAPS)
            .await?;
        let keyring = gen_keyring(ADMIN_ROTATOR_USERNAME, &key, ADMIN_CAPS)?;
        self.resources
            .save_rotator_keyring(&info.namespace, &keyring)
            .await?;
        self.rotate_with(request, &keyring, false).await
    }

    async fn recover_locked(&self, request: RotationRequest, keyring: String) -> Result<()> {
        let _guard = RotationGuard::claim(&request.info.namespace)?;
        let info = &request.info;
        write_connection_config(&self.config_dir, info)?;
        match self
            .ceph
            .auth_list(info, &info.admin_identity(&self.config_dir))
            .await
        {
            Ok(auth) if !auth.contains(ADMIN_ROTATOR_USERNAME) => {
                debug!("rotator already removed, finishing cleanup");
                return self.finish(request, true).await;
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "stored admin key not accepted, resuming with the rotator key"),
        }
        self.rotate_with(request, &keyring, true).await
    }

    fn rotate_dir(&self, info: &ClusterInfo) -> PathBuf {
        info.config_dir(&self.config_dir).join(ROTATE_DIR)
    }

    async fn rotate_with(
        &self,
        mut request: RotationRequest,
        keyring: &str,
        recovering: bool,
    ) -> Result<()> {
        let dir = self.rotate_dir(&request.info);
        let rotator = CommandIdentity {
            username: ADMIN_ROTATOR_USERNAME.to_owned(),
            keyring: dir.join(format!("{ADMIN_ROTATOR_USERNAME}.keyring")),
        };
        write_file_atomic(&rotator.keyring, keyring.as_bytes(), 0o600)?;

        let info = &mut request.info;
        self.ceph.auth_list(info, &rotator).await?;
        let new_key = self.ceph.auth_rotate(info, &rotator, ADMIN_USERNAME).await?;

        let new_admin = CommandIdentity {
            username: ADMIN_USERNAME.to_owned(),
            keyring: dir.join(format!("{ADMIN_USERNAME}.keyring")),
        };
        write_file_atomic(&new_admin.keyring, admin_keyring(&new_key)?.as_bytes(), 0o600)?;
        self.ceph.auth_list(info, &new_admin).await?;

        info.ceph_cred.secret = new_key;
        write_connection_config(&self.config_dir, info)?;
        self.resources.save_cluster_info(info).await?;

        let admin = info.admin_identity(&self.config_dir);
        self.ceph
            .auth_delete(info, &admin, ADMIN_ROTATOR_USERNAME)
            .await?;
        self.finish(request, recovering).await
    }

    /// Oldest version the monitors run, falling back to `recorded`.
    async fn running_version(&self, info: &ClusterInfo, recorded: CephVersion) -> CephVersion {
        let admin = info.admin_identity(&self.config_dir);
        match self
            .ceph
            .versions(info, &admin)
            .await
            .and_then(|versions| versions.least_uptodate_mon())
        {
            Ok(Some(version)) => version,
            Ok(None) => {
                warn!(namespace = %info.namespace, "no monitor versions reported for admin key status");
                recorded
            }
            Err(err) => {
                warn!(namespace = %info.namespace, %err, "failed to determine ceph version for admin key status");
                recorded
            }
        }
    }

    async fn finish(&self, mut request: RotationRequest, recovering: bool) -> Result<()> {
        let namespace = &request.info.namespace;
        match fs::remove_dir_all(self.rotate_dir(&request.info)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => {
                warn!(%err, "failed to remove admin rotation keyrings")
            }
            _ => {}
        }
        self.resources.delete_rotator_keyring(namespace).await?;
        // An interrupted run may have upgraded the daemons after the version was recorded.
        if recovering {
            request.running = self.running_version(&request.info, request.running).await;
        }
        let updated =
            updated_cephx_status(true, &request.cfg, &request.running, &request.status);
        self.resources
            .update_cephx_status(namespace, &request.name, &updated)
            .await?;
        info!(
            %namespace,
            generation = updated.key_generation,
            version = %updated.key_ceph_version,
            "admin key rotated, reloading"
        );
        self.reloader.reload();
        Err(Error::SuccessfulAdminKeyRotation)
    }
}
