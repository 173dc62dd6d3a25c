//! The flexvolume driver the kubelet executes for every volume operation.
//!
//! Each invocation forwards its work to the node agent over the socket and reports a
//! [`DriverStatus`] on stdout.
use std::{
    fs,
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, bail, Context as _, Result};
use async_trait::async_trait;
use nix::unistd::{chown, Gid, Uid};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    flexvolume::{
        AttachOptions, ExpandArgs, GlobalMountPathInput, LogMessage, VolumeController,
        SETTINGS_FILE_NAME,
    },
    utils::exec::{CommandExecutor, CommandFailed},
};

const STATUS_SUCCESS: &str = "Success";
const STATUS_FAILURE: &str = "Failure";
const STATUS_NOT_SUPPORTED: &str = "Not supported";

/// Filesystem type of CephFS volumes.
pub const CEPHFS_TYPE: &str = "ceph";
const DEFAULT_FS_TYPE: &str = "ext4";
const MDS_NAMESPACE_KERNEL: (u32, u32) = (4, 7);
/// blkid exits with 2 when the device holds no recognizable signature.
const BLKID_NOTHING_FOUND: i32 = 2;

/// What the driver supports, reported by `init`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// The driver does not implement attach and detach as separate calls.
    pub attach: bool,
    /// Whether the kubelet should relabel volumes for SELinux.
    pub selinux_relabel: bool,
    /// Whether the kubelet should apply the pod fsGroup.
    pub fs_group: bool,
    /// Whether volume metrics are available.
    pub supports_metrics: bool,
    /// Whether expanding needs a filesystem resize.
    #[serde(rename = "requiresFSResize")]
    pub requires_fs_resize: bool,
}

impl Capabilities {
    /// Capabilities of this driver with the configurable flags set.
    pub fn new(selinux_relabel: bool, fs_group: bool) -> Self {
        Self {
            attach: false,
            selinux_relabel,
            fs_group,
            supports_metrics: true,
            requires_fs_resize: true,
        }
    }
}

/// Result of a driver invocation, printed as JSON.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverStatus {
    /// Success, Failure or Not supported
    pub status: String,
    /// Reason for a failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Device path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Driver capabilities, only for init
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
}

impl DriverStatus {
    /// Successful invocation.
    pub fn success() -> Self {
        Self {
            status: STATUS_SUCCESS.to_owned(),
            ..Default::default()
        }
    }

    /// Failed invocation.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_FAILURE.to_owned(),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Call the driver does not implement.
    pub fn not_supported() -> Self {
        Self {
            status: STATUS_NOT_SUPPORTED.to_owned(),
            ..Default::default()
        }
    }

    /// Process exit code for this status.
    pub fn exit_code(&self) -> i32 {
        if self.status == STATUS_FAILURE {
            1
        } else {
            0
        }
    }
}

/// Driver subcommands, as invoked by the kubelet.
#[derive(Clone, Debug, PartialEq, Eq, clap::Subcommand)]
pub enum DriverCommand {
    /// Report the driver capabilities.
    Init,
    /// Attach a volume to the node. Done as part of mount instead.
    Attach {
        /// Ignored arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Check whether a volume is attached.
    #[command(name = "isattached")]
    IsAttached {
        /// Ignored arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Attach and mount a volume into a pod.
    Mount {
        /// Pod scoped mount point
        mount_dir: String,
        /// JSON options
        options: String,
    },
    /// Unmount a volume from a pod, detaching it once unused on the node.
    Unmount {
        /// Pod scoped mount point
        mount_dir: String,
    },
    /// Grow the image and the filesystem on it.
    #[command(name = "expandfs")]
    ExpandFs {
        /// JSON options
        options: String,
        /// Where the filesystem is mounted
        mount_path: String,
        /// Device holding the filesystem
        device_path: String,
        /// Requested size in bytes
        new_size: u64,
        /// Current size in bytes
        old_size: Option<u64>,
    },
}

/// Mount operations on the host.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Whether something is mounted at `path`. A missing path is not a mount point.
    async fn is_mount_point(&self, path: &Path) -> Result<bool>;
    /// Mount `source` on `target`.
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()>;
    /// Unmount `target`.
    async fn unmount(&self, target: &Path) -> Result<()>;
    /// Mount `device`, creating a filesystem first when the device is blank.
    async fn format_and_mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()>;
    /// Grow the filesystem on `device` mounted at `mount_path` to fill the device.
    async fn resize(&self, device: &str, mount_path: &Path, fs_type: &str) -> Result<()>;
}

/// [`Mounter`] using the host mount tools.
pub struct SystemMounter<E> {
    executor: E,
    mounts_file: PathBuf,
    timeout: Duration,
}

impl<E: CommandExecutor> SystemMounter<E> {
    /// Mounter running commands through `executor`.
    pub fn new(executor: E, timeout: Duration) -> Self {
        Self {
            executor,
            mounts_file: PathBuf::from("/proc/mounts"),
            timeout,
        }
    }

    #[cfg(test)]
    fn with_mounts_file(mut self, path: &Path) -> Self {
        self.mounts_file = path.to_owned();
        self
    }

    async fn run(&self, command: &str, args: Vec<String>) -> Result<String> {
        self.executor.execute(command, &args, self.timeout).await
    }
}

#[async_trait]
impl<E: CommandExecutor> Mounter for SystemMounter<E> {
    async fn is_mount_point(&self, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let mounts = fs::read_to_string(&self.mounts_file)
            .with_context(|| format!("failed to read {}", self.mounts_file.display()))?;
        let target = path.to_string_lossy();
        Ok(mounts.lines().any(|line| {
            line.split_whitespace()
                .nth(1)
                .map(|mount_point| mount_point.replace("\\040", " ") == target)
                .unwrap_or(false)
        }))
    }

    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        let mut args = Vec::new();
        if !fs_type.is_empty() {
            args.extend(["-t".to_owned(), fs_type.to_owned()]);
        }
        if !options.is_empty() {
            args.extend(["-o".to_owned(), options.join(",")]);
        }
        args.extend([source.to_owned(), target.display().to_string()]);
        self.run("mount", args).await?;
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        self.run("umount", vec![target.display().to_string()]).await?;
        Ok(())
    }

    async fn format_and_mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        let mount_err = match self.mount(device, target, fs_type, options).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        let probe = self
            .run(
                "blkid",
                ["-p", "-s", "TYPE", "-s", "PTTYPE", "-o", "export", device]
                    .map(str::to_owned)
                    .to_vec(),
            )
            .await;
        match probe {
            Err(err) if CommandFailed::exit_code(&err) == Some(BLKID_NOTHING_FOUND) => {}
            Err(err) => return Err(err.context(format!("failed to probe {device}"))),
            Ok(existing) => {
                return Err(mount_err.context(format!(
                    "failed to mount {device} which already holds {}",
                    existing.split_whitespace().collect::<Vec<_>>().join(" ")
                )))
            }
        }

        info!(device, fs_type, "formatting blank device");
        let mut args = Vec::new();
        if fs_type.starts_with("ext") {
            args.extend(["-F".to_owned(), "-m0".to_owned()]);
        }
        args.push(device.to_owned());
        self.run(&format!("mkfs.{fs_type}"), args)
            .await
            .with_context(|| format!("failed to format {device} as {fs_type}"))?;
        self.mount(device, target, fs_type, options).await
    }

    async fn resize(&self, device: &str, mount_path: &Path, fs_type: &str) -> Result<()> {
        match fs_type {
            "ext3" | "ext4" => {
                self.run("resize2fs", vec![device.to_owned()]).await?;
            }
            "xfs" => {
                self.run(
                    "xfs_growfs",
                    vec!["-d".to_owned(), mount_path.display().to_string()],
                )
                .await?;
            }
            other => debug!(fs_type = other, "filesystem resize not supported"),
        }
        Ok(())
    }
}

/// Whether a kernel version string such as `5.14.0-284.el9` is at least `major.minor`.
pub fn kernel_at_least(version: &str, (major, minor): (u32, u32)) -> Option<bool> {
    let mut parts = version.split(['.', '-']);
    let have_major: u32 = parts.next()?.parse().ok()?;
    let have_minor: u32 = parts
        .next()
        .map(|p| p.chars().take_while(char::is_ascii_digit).collect::<String>())
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    Some((have_major, have_minor) >= (major, minor))
}

/// Give `gid` ownership of `path`, with group write access unless `read_only`.
pub fn set_fs_group(path: &Path, gid: u32, read_only: bool) -> Result<()> {
    let metadata = fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    chown(path, Some(Uid::from_raw(metadata.uid())), Some(Gid::from_raw(gid)))
        .with_context(|| format!("chown failed on {}", path.display()))?;
    let mode = if read_only { 0o550 } else { 0o770 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o2000))
        .with_context(|| format!("chmod failed on {}", path.display()))?;
    Ok(())
}

/// The driver logic, talking to the agent through `client`.
pub struct Plugin<C, M> {
    client: C,
    mounter: M,
    driver_dir: PathBuf,
}

impl<C, M> Plugin<C, M>
where
    C: VolumeController,
    M: Mounter,
{
    /// Driver installed in `driver_dir`.
    pub fn new(client: C, mounter: M, driver_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            mounter,
            driver_dir: driver_dir.into(),
        }
    }

    /// Capabilities written next to the binary by the agent, or the defaults.
    pub fn init(driver_dir: &Path) -> DriverStatus {
        let settings = driver_dir.join(SETTINGS_FILE_NAME);
        match fs::read_to_string(&settings)
            .map_err(anyhow::Error::from)
            .and_then(|raw| Ok(serde_json::from_str::<DriverStatus>(&raw)?))
        {
            Ok(status) => status,
            Err(err) => {
                warn!(path = %settings.display(), %err, "using default driver capabilities");
                DriverStatus {
                    capabilities: Some(Capabilities::new(false, true)),
                    ..DriverStatus::success()
                }
            }
        }
    }

    /// Run one subcommand, other than init.
    pub async fn run(&self, command: DriverCommand) -> DriverStatus {
        let res = match command {
            DriverCommand::Init => return Self::init(&self.driver_dir),
            DriverCommand::Attach { .. } | DriverCommand::IsAttached { .. } => {
                return DriverStatus::not_supported()
            }
            DriverCommand::Mount { mount_dir, options } => self.mount(&mount_dir, &options).await,
            DriverCommand::Unmount { mount_dir } => self.unmount(&mount_dir).await,
            DriverCommand::ExpandFs {
                options,
                mount_path,
                device_path,
                new_size,
                ..
            } => {
                self.expand_fs(&options, &mount_path, &device_path, new_size)
                    .await
            }
        };
        match res {
            Ok(()) => DriverStatus::success(),
            Err(err) => DriverStatus::failure(format!("Rook: {err:#}")),
        }
    }

    /// Forward a message to the agent log. Failing to do so is not an error of the operation.
    async fn log(&self, message: String, is_error: bool) {
        if is_error {
            warn!("{message}");
        } else {
            info!("{message}");
        }
        if let Err(err) = self.client.log(&LogMessage { message, is_error }).await {
            warn!(%err, "failed to forward log message");
        }
    }

    async fn mount(&self, mount_dir: &str, raw_options: &str) -> Result<()> {
        let mut opts: AttachOptions = serde_json::from_str(raw_options)
            .with_context(|| format!("could not parse options for mounting {raw_options}"))?;
        opts.mount_dir = mount_dir.to_owned();

        if opts.fs_type == CEPHFS_TYPE {
            return self.mount_filesystem(opts).await;
        }

        let opts = match self
            .client
            .get_attach_info_from_mount_dir(mount_dir, opts)
            .await
        {
            Ok(opts) => opts,
            Err(err) => {
                self.log(format!("mount volume in {mount_dir} failed: {err}"), true)
                    .await;
                bail!("mount volume failed: {err}");
            }
        };
        let volume = format!("{}/{}", opts.effective_pool(), opts.image);

        self.log(format!("calling agent to attach volume {volume}"), false)
            .await;
        let device = match self.client.attach(&opts).await {
            Ok(device) => device,
            Err(err) => {
                self.log(format!("attach volume {volume} failed: {err}"), true)
                    .await;
                bail!("mount volume failed: {err}");
            }
        };

        let global_path = self
            .client
            .get_global_mount_path(&GlobalMountPathInput {
                volume_name: opts.volume_name.clone(),
                driver_dir: self.driver_dir.display().to_string(),
            })
            .await
            .map_err(|err| anyhow!("mount volume failed. Cannot get global volume mount path: {err}"))?;
        let global_path = PathBuf::from(global_path);
        let mode = if opts.read_write_mode.is_empty() {
            "rw".to_owned()
        } else {
            opts.read_write_mode.clone()
        };

        if !self.mounter.is_mount_point(&global_path).await? {
            fs::create_dir_all(&global_path).with_context(|| {
                format!("cannot create global volume mount path {}", global_path.display())
            })?;
            let fs_type = if opts.fs_type.is_empty() {
                DEFAULT_FS_TYPE
            } else {
                opts.fs_type.as_str()
            };
            self.log(
                format!(
                    "formatting volume {} device {device} mount path {} fs {fs_type}",
                    opts.volume_name,
                    global_path.display()
                ),
                false,
            )
            .await;
            if let Err(err) = self
                .mounter
                .format_and_mount(&device, &global_path, fs_type, &[mode.clone()])
                .await
            {
                self.log(format!("mount volume {volume} failed: {err:#}"), true)
                    .await;
                let _ = fs::remove_dir(&global_path);
                return Err(err.context(format!(
                    "failed to mount volume {device} [{fs_type}] to {}",
                    global_path.display()
                )));
            }
        }

        let pod_dir = Path::new(mount_dir);
        if self.mounter.is_mount_point(pod_dir).await? {
            info!(mount_dir, "volume is already mounted");
        } else {
            self.log(
                format!(
                    "mounting global mount path {} on {mount_dir}",
                    global_path.display()
                ),
                false,
            )
            .await;
            fs::create_dir_all(pod_dir)
                .with_context(|| format!("cannot create mount dir {mount_dir}"))?;
            let global_source = global_path.display().to_string();
            if let Err(err) = self
                .mounter
                .mount(&global_source, pod_dir, "", &[mode, "bind".to_owned()])
                .await
            {
                self.log(format!("mount volume {volume} failed: {err:#}"), true)
                    .await;
                let _ = fs::remove_dir(pod_dir);
                return Err(err.context(format!(
                    "failed to mount volume {} to {mount_dir}",
                    global_path.display()
                )));
            }
        }
        self.log(
            format!("volume {volume} has been attached and mounted"),
            false,
        )
        .await;
        self.apply_fs_group(&opts).await;
        Ok(())
    }

    async fn mount_filesystem(&self, mut opts: AttachOptions) -> Result<()> {
        if opts.fs_name.is_empty() {
            bail!("attach filesystem failed: filesystem name is not provided");
        }
        if opts.cluster_namespace.is_empty() {
            if opts.cluster_name.is_empty() {
                bail!(
                    "attach filesystem {} failed: cluster namespace is not provided",
                    opts.fs_name
                );
            }
            opts.cluster_namespace = opts.cluster_name.clone();
        }
        self.log(
            format!("mounting ceph filesystem {} on {}", opts.fs_name, opts.mount_dir),
            false,
        )
        .await;

        let access = match self
            .client
            .get_client_access_info(
                &opts.cluster_namespace,
                &opts.pod_namespace,
                &opts.mount_user,
                &opts.mount_secret,
            )
            .await
        {
            Ok(access) => access,
            Err(err) => {
                let message = format!(
                    "attach filesystem {} on cluster {} failed: {err}",
                    opts.fs_name, opts.cluster_namespace
                );
                self.log(message.clone(), true).await;
                bail!(message);
            }
        };

        let path = match opts.path.as_str() {
            "" => "/".to_owned(),
            p if p.starts_with('/') => p.to_owned(),
            p => format!("/{p}"),
        };
        let mut options = vec![
            format!("name={}", access.user_name),
            format!("secret={}", access.secret_key),
        ];
        let (major, minor) = MDS_NAMESPACE_KERNEL;
        match self.client.get_kernel_version().await {
            Ok(kernel) => match kernel_at_least(&kernel, MDS_NAMESPACE_KERNEL) {
                Some(true) => options.push(format!("mds_namespace={}", opts.fs_name)),
                Some(false) => {
                    self.log(format!("WARNING: the node kernel version is {kernel}, which does not support multiple ceph filesystems. The kernel version has to be at least {major}.{minor}"), false).await
                }
                None => {
                    self.log(format!("WARNING: the node kernel version {kernel} cannot be parsed. The kernel version has to be at least {major}.{minor} in order to specify a filesystem namespace"), false).await
                }
            },
            Err(err) => {
                self.log(format!("WARNING: the node kernel version cannot be detected ({err}). The kernel version has to be at least {major}.{minor} in order to specify a filesystem namespace"), false).await
            }
        }

        let source = format!("{}:{path}", access.monitors.join(","));
        let mount_dir = PathBuf::from(&opts.mount_dir);
        if self.mounter.is_mount_point(&mount_dir).await? {
            info!(mount_dir = %opts.mount_dir, "filesystem is already mounted");
        } else {
            fs::create_dir_all(&mount_dir)
                .with_context(|| format!("cannot create mount dir {}", opts.mount_dir))?;
            if let Err(err) = self
                .mounter
                .mount(&source, &mount_dir, CEPHFS_TYPE, &options)
                .await
            {
                let _ = fs::remove_dir(&mount_dir);
                let message = format!(
                    "failed to mount filesystem {} to {} with monitor {source}: {err:#}",
                    opts.fs_name, opts.mount_dir
                );
                self.log(message.clone(), true).await;
                bail!(message);
            }
            self.log(
                format!("ceph filesystem {} has been attached and mounted", opts.fs_name),
                false,
            )
            .await;
        }
        self.apply_fs_group(&opts).await;
        Ok(())
    }

    /// Apply the pod fsGroup to the volume root. Failures are logged, the mount stays.
    async fn apply_fs_group(&self, opts: &AttachOptions) {
        if opts.fs_group.is_empty() {
            return;
        }
        let gid: u32 = match opts.fs_group.parse() {
            Ok(gid) => gid,
            Err(err) => {
                self.log(format!("invalid fsgroup {}: {err}", opts.fs_group), true)
                    .await;
                return;
            }
        };
        let path = Path::new(&opts.mount_dir).join(opts.path.trim_start_matches('/'));
        match set_fs_group(&path, gid, opts.read_only()) {
            Ok(()) => {
                self.log(format!("successfully set fsgroup to {gid}"), false)
                    .await
            }
            Err(err) => self.log(format!("fsgroup: {err:#}"), true).await,
        }
    }

    async fn unmount(&self, mount_dir: &str) -> Result<()> {
        let pod_dir = Path::new(mount_dir);
        if self.mounter.is_mount_point(pod_dir).await? {
            self.mounter
                .unmount(pod_dir)
                .await
                .with_context(|| format!("failed to unmount {mount_dir}"))?;
        }
        if let Err(err) = fs::remove_dir(pod_dir) {
            debug!(mount_dir, %err, "mount dir not removed");
        }

        let opts = self
            .client
            .get_attach_info_from_mount_dir(mount_dir, AttachOptions::default())
            .await
            .map_err(|err| anyhow!("unmount volume at {mount_dir} failed: {err}"))?;
        if opts.image.is_empty() {
            // Filesystem volumes are not attached.
            return Ok(());
        }

        let safe_to_detach = self
            .client
            .remove_attachment_object(&opts)
            .await
            .map_err(|err| anyhow!("unmount volume at {mount_dir} failed: {err}"))?;
        if !safe_to_detach {
            self.log(
                format!(
                    "volume {} is still in use on this node, not detaching",
                    opts.volume_name
                ),
                false,
            )
            .await;
            return Ok(());
        }

        let global_path = self
            .client
            .get_global_mount_path(&GlobalMountPathInput {
                volume_name: opts.volume_name.clone(),
                driver_dir: self.driver_dir.display().to_string(),
            })
            .await
            .map_err(|err| anyhow!("unmount volume failed. Cannot get global volume mount path: {err}"))?;
        let global_path = PathBuf::from(global_path);
        if self.mounter.is_mount_point(&global_path).await? {
            self.mounter
                .unmount(&global_path)
                .await
                .with_context(|| format!("failed to unmount {}", global_path.display()))?;
        }
        let _ = fs::remove_dir(&global_path);

        self.client
            .detach(&opts)
            .await
            .map_err(|err| anyhow!("detach volume {} failed: {err}", opts.volume_name))?;
        self.log(
            format!("volume {} has been unmounted and detached", opts.volume_name),
            false,
        )
        .await;
        Ok(())
    }

    async fn expand_fs(
        &self,
        raw_options: &str,
        mount_path: &str,
        device_path: &str,
        new_size: u64,
    ) -> Result<()> {
        let opts: AttachOptions = serde_json::from_str(raw_options)
            .with_context(|| format!("could not parse options for expanding {raw_options}"))?;
        let opts = match self
            .client
            .get_attach_info_from_mount_dir(mount_path, opts.clone())
            .await
        {
            Ok(opts) => opts,
            Err(err) => {
                warn!(%err, "using the options passed by the kubelet");
                opts
            }
        };
        let fs_type = opts.fs_type.clone();
        self.client
            .expand(&ExpandArgs {
                options: opts,
                size_bytes: new_size,
            })
            .await
            .map_err(|err| anyhow!("expand volume failed: {err}"))?;
        self.mounter
            .resize(device_path, Path::new(mount_path), &fs_type)
            .await
            .with_context(|| format!("failed to resize filesystem on {device_path}"))
    }
}
