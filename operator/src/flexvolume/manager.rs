//! Backend operations on RBD images.
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::{
    ceph::keyring::gen_keyring, flexvolume::host::ClusterInfoLoader,
    utils::exec::CommandExecutor, utils::write_file_atomic,
};

const RBD_SYSFS_DEVICES: &str = "/sys/bus/rbd/devices";
const RBD_MODULE_SYSFS: &str = "/sys/module/rbd";
const FIND_DEVICE_PATH_ATTEMPTS: usize = 10;

/// Define the behavior we consume from the storage backend.
///
/// All operations are idempotent with respect to already attached or detached images.
#[async_trait]
pub trait VolumeManager: Send + Sync {
    /// Prepare the node, e.g. load kernel modules.
    async fn init(&self) -> Result<()>;
    /// Map an image, returning its device path.
    async fn attach(
        &self,
        image: &str,
        pool: &str,
        user: &str,
        key: &str,
        cluster_namespace: &str,
    ) -> Result<String>;
    /// Unmap an image.
    async fn detach(
        &self,
        image: &str,
        pool: &str,
        user: &str,
        key: &str,
        cluster_namespace: &str,
        force: bool,
    ) -> Result<()>;
    /// Resize an image to `size_mb` megabytes.
    async fn expand(
        &self,
        image: &str,
        pool: &str,
        cluster_namespace: &str,
        size_mb: u64,
    ) -> Result<()>;
}

/// Maps images with the kernel rbd driver through the `rbd` CLI.
pub struct RbdVolumeManager<E, L> {
    executor: E,
    loader: L,
    keyring_dir: PathBuf,
    devices_dir: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
}

impl<E, L> RbdVolumeManager<E, L>
where
    E: CommandExecutor,
    L: ClusterInfoLoader,
{
    /// Manager writing its temporary keyrings below `keyring_dir`.
    pub fn new(executor: E, loader: L, keyring_dir: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            executor,
            loader,
            keyring_dir: keyring_dir.as_ref().to_owned(),
            devices_dir: PathBuf::from(RBD_SYSFS_DEVICES),
            timeout,
            poll_interval: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    fn with_devices_dir(mut self, dir: &Path, poll_interval: Duration) -> Self {
        self.devices_dir = dir.to_owned();
        self.poll_interval = poll_interval;
        self
    }

    /// Device of a mapped image, found by matching the pool and name the kernel reports.
    fn find_device_path(&self, image: &str, pool: &str) -> Result<Option<String>> {
        let entries = match fs::read_dir(&self.devices_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to list {}", self.devices_dir.display()))
            }
        };
        for entry in entries {
            let dir = entry?.path();
            let read = |name: &str| fs::read_to_string(dir.join(name)).map(|s| s.trim().to_owned());
            let (Ok(device_pool), Ok(device_image)) = (read("pool"), read("name")) else {
                continue;
            };
            if device_pool == pool && device_image == image {
                if let Some(id) = dir.file_name() {
                    return Ok(Some(format!("/dev/rbd{}", id.to_string_lossy())));
                }
            }
        }
        Ok(None)
    }

    /// Write a keyring for `user` that is removed by the caller once the command ran.
    fn write_keyring(&self, cluster_namespace: &str, user: &str, key: &str) -> Result<PathBuf> {
        let path = self
            .keyring_dir
            .join(cluster_namespace)
            .join(format!("{user}.{}.keyring", uuid::Uuid::new_v4()));
        let keyring = gen_keyring(&format!("client.{user}"), key, &[])?;
        write_file_atomic(&path, keyring.as_bytes(), 0o600)?;
        Ok(path)
    }

    async fn run_rbd(
        &self,
        mut args: Vec<String>,
        user: &str,
        key: &str,
        cluster_namespace: &str,
    ) -> Result<()> {
        let info = self
            .loader
            .cluster_info(cluster_namespace)
            .await
            .with_context(|| format!("failed to load cluster information from {cluster_namespace}"))?;
        let keyring = self.write_keyring(cluster_namespace, user, key)?;
        args.extend([
            format!("--id={user}"),
            format!("--cluster={cluster_namespace}"),
            format!("--keyring={}", keyring.display()),
            format!("-m={}", info.monitor_endpoints().join(",")),
        ]);
        let res = self.executor.execute("rbd", &args, self.timeout).await;
        if let Err(err) = fs::remove_file(&keyring) {
            warn!(path = %keyring.display(), %err, "failed to remove temporary keyring");
        }
        res.map(|_| ())
    }
}

#[async_trait]
impl<E, L> VolumeManager for RbdVolumeManager<E, L>
where
    E: CommandExecutor,
    L: ClusterInfoLoader,
{
    async fn init(&self) -> Result<()> {
        if Path::new(RBD_MODULE_SYSFS).exists() {
            return Ok(());
        }
        let params = self
            .executor
            .execute(
                "modinfo",
                &["-F".to_owned(), "parm".to_owned(), "rbd".to_owned()],
                self.timeout,
            )
            .await
            .unwrap_or_default();
        let mut args = vec!["rbd".to_owned()];
        if params.contains("single_major") {
            args.push("single_major=Y".to_owned());
        }
        self.executor
            .execute("modprobe", &args, self.timeout)
            .await
            .context("failed to load kernel module rbd")?;
        Ok(())
    }

    #[instrument(skip(self, key))]
    async fn attach(
        &self,
        image: &str,
        pool: &str,
        user: &str,
        key: &str,
        cluster_namespace: &str,
    ) -> Result<String> {
        if let Some(device) = self.find_device_path(image, pool)? {
            info!(device = %device, "volume is already attached");
            return Ok(device);
        }
        if user.is_empty() && key.is_empty() {
            bail!("no id nor keyring given, can't mount without credentials");
        }

        info!("attaching volume");
        self.run_rbd(
            vec!["map".to_owned(), format!("{pool}/{image}")],
            user,
            key,
            cluster_namespace,
        )
        .await
        .with_context(|| format!("failed to map image {pool}/{image} cluster {cluster_namespace}"))?;

        for attempt in 1..=FIND_DEVICE_PATH_ATTEMPTS {
            if let Some(device) = self.find_device_path(image, pool)? {
                return Ok(device);
            }
            info!(attempt, "device path not found yet");
            tokio::time::sleep(self.poll_interval).await;
        }
        bail!("exceeded retry count while finding device path for {pool}/{image}")
    }

    #[instrument(skip(self, key))]
    async fn detach(
        &self,
        image: &str,
        pool: &str,
        user: &str,
        key: &str,
        cluster_namespace: &str,
        force: bool,
    ) -> Result<()> {
        let Some(device) = self.find_device_path(image, pool)? else {
            info!("volume is already detached");
            return Ok(());
        };
        if user.is_empty() && key.is_empty() {
            bail!("no id nor keyring given, can't unmount without credentials");
        }

        info!(device = %device, "detaching volume");
        let mut args = vec!["unmap".to_owned()];
        if force {
            args.extend(["-o".to_owned(), "force".to_owned()]);
        }
        args.push(device);
        self.run_rbd(args, user, key, cluster_namespace)
            .await
            .with_context(|| format!("failed to unmap image {pool}/{image} cluster {cluster_namespace}"))
    }

    #[instrument(skip(self))]
    async fn expand(
        &self,
        image: &str,
        pool: &str,
        cluster_namespace: &str,
        size_mb: u64,
    ) -> Result<()> {
        let info = self.loader.cluster_info(cluster_namespace).await?;
        let user = info
            .ceph_cred
            .username
            .strip_prefix("client.")
            .unwrap_or(&info.ceph_cred.username)
            .to_owned();
        self.run_rbd(
            vec![
                "resize".to_owned(),
                format!("{pool}/{image}"),
                format!("--size={size_mb}"),
            ],
            &user,
            &info.ceph_cred.secret,
            cluster_namespace,
        )
        .await
        .with_context(|| format!("failed to resize volume {pool}/{image} cluster {cluster_namespace}"))
    }
}
