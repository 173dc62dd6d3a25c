//! Coordinates attach and detach requests from pods sharing a volume.
//!
//! The attachment record is the source of truth for which pods use a volume. Every mutation is
//! an optimistic update of that record, so racing callers see a conflict and retry.
use std::path::PathBuf;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, Pod};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::{Error, Result},
    flexvolume::{
        host::HostPlatform,
        manager::VolumeManager,
        mountdir::{global_mount_path, pod_and_pv_from_mount_dir, vendor_and_driver},
        AttachOptions, ClientAccessInfo, ExpandArgs, GlobalMountPathInput, LogMessage,
        MountSecurityMode, VolumeController, DEFAULT_CLUSTER_NAMESPACE,
    },
    volume::{Attachment, AttachmentStore, StoreError, Volume},
};

const LOG_TARGET: &str = "flexdriver";
const BYTES_PER_MB: u64 = 1024 * 1024;

const CLUSTER_NAMESPACE_KEY: &str = "clusterNamespace";
const LEGACY_CLUSTER_NAMESPACE_KEY: &str = "clusterName";

/// Where the coordinator runs and which policy it enforces.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Namespace attachment records are kept in.
    pub namespace: String,
    /// Node this agent runs on.
    pub node_name: String,
    /// Kubelet root directory on the host.
    pub kubelet_root_dir: PathBuf,
    /// Credential policy for filesystem mounts.
    pub security_mode: MountSecurityMode,
}

/// What the host registry says about the pod owning an attachment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OwnerLookup {
    /// The pod no longer exists.
    Missing,
    /// The pod exists and is in the given phase.
    Present {
        /// Pod phase, empty when not reported.
        phase: String,
    },
}

/// Whether `incoming` may take over the read-write attachment `existing`.
///
/// A read-write attachment is replaced when its pod is gone, or when the same pod is restarting
/// on the same node.
pub fn may_replace(existing: &Attachment, incoming: &Attachment, owner: &OwnerLookup) -> bool {
    match owner {
        OwnerLookup::Missing => true,
        OwnerLookup::Present { .. } => {
            existing.pod_namespace == incoming.pod_namespace
                && existing.pod_name == incoming.pod_name
                && existing.node == incoming.node
        }
    }
}

/// [`VolumeController`] backed by an attachment store, a volume manager and host lookups.
pub struct FlexvolumeController<S, M, H> {
    config: ControllerConfig,
    store: S,
    manager: M,
    host: H,
}

impl<S, M, H> FlexvolumeController<S, M, H>
where
    S: AttachmentStore,
    M: VolumeManager,
    H: HostPlatform,
{
    /// Create a coordinator for the node described by `config`.
    pub fn new(config: ControllerConfig, store: S, manager: M, host: H) -> Self {
        Self {
            config,
            store,
            manager,
            host,
        }
    }

    fn attachment_for(&self, opts: &AttachOptions, cluster_namespace: &str) -> Attachment {
        Attachment {
            node: self.config.node_name.clone(),
            pod_namespace: opts.pod_namespace.clone(),
            pod_name: opts.pod_name.clone(),
            cluster_name: cluster_namespace.to_owned(),
            mount_dir: opts.mount_dir.clone(),
            read_only: opts.read_only(),
        }
    }

    async fn lookup_owner(&self, attachment: &Attachment) -> Result<OwnerLookup> {
        let pod = self
            .host
            .get_pod(&attachment.pod_namespace, &attachment.pod_name)
            .await?;
        Ok(match pod {
            None => OwnerLookup::Missing,
            Some(pod) => OwnerLookup::Present {
                phase: pod.status.and_then(|s| s.phase).unwrap_or_default(),
            },
        })
    }

    /// Add the attachment described by `opts` to the volume record.
    async fn record_attachment(&self, opts: &AttachOptions, cluster_namespace: &str) -> Result<()> {
        let namespace = &self.config.namespace;
        let incoming = self.attachment_for(opts, cluster_namespace);

        let mut record = match self.store.get(namespace, &opts.volume_name).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                let record = Volume::with_attachment(
                    namespace,
                    &opts.volume_name,
                    cluster_namespace,
                    incoming,
                );
                return match self.store.create(namespace, &record).await {
                    Ok(_) => {
                        info!(volume = %opts.volume_name, "created volume attachment record");
                        Ok(())
                    }
                    Err(StoreError::AlreadyExists(_)) => Err(Error::Conflict(format!(
                        "failed to attach volume {} for pod {}/{}. Volume is already attached by a different pod",
                        opts.volume_name, opts.pod_namespace, opts.pod_name
                    ))),
                    Err(err) => Err(err.into()),
                };
            }
            Err(err) => return Err(err.into()),
        };

        if record.find_mount_dir(&opts.mount_dir).is_some() {
            info!(volume = %opts.volume_name, mount_dir = %opts.mount_dir, "volume is already recorded for this mount");
            return Ok(());
        }

        match record.read_write_attachment() {
            Some(index) => {
                let existing = &record.spec.attachments[index];
                let owner = self.lookup_owner(existing).await?;
                if !may_replace(existing, &incoming, &owner) {
                    let phase = match &owner {
                        OwnerLookup::Present { phase } => phase.as_str(),
                        OwnerLookup::Missing => "",
                    };
                    return Err(Error::Policy(format!(
                        "failed to attach volume {} for pod {}/{}. Volume is already attached by pod {}/{}. Status {}",
                        opts.volume_name,
                        opts.pod_namespace,
                        opts.pod_name,
                        existing.pod_namespace,
                        existing.pod_name,
                        phase
                    )));
                }
                info!(
                    volume = %opts.volume_name,
                    previous_pod = %existing.pod_name,
                    pod = %opts.pod_name,
                    "taking over read-write attachment"
                );
                record.spec.attachments[index] = incoming;
            }
            None => {
                if !opts.read_only() && !record.spec.attachments.is_empty() {
                    return Err(Error::Policy(format!(
                        "failed to attach volume {} for pod {}/{}. Volume is already attached by one or more pods",
                        opts.volume_name, opts.pod_namespace, opts.pod_name
                    )));
                }
                record.spec.attachments.push(incoming);
            }
        }

        self.store.update(namespace, &record).await?;
        Ok(())
    }

    /// User (without the `client.` prefix) and key used for block operations.
    ///
    /// `mountSecret` names a secret in the pod namespace; its single value is the key.
    async fn block_credentials(
        &self,
        opts: &AttachOptions,
        cluster_namespace: &str,
    ) -> Result<(String, String)> {
        if !opts.mount_user.is_empty() && !opts.mount_secret.is_empty() {
            let key = self
                .mount_secret_value(&opts.pod_namespace, &opts.mount_secret)
                .await?;
            return Ok((opts.mount_user.clone(), key));
        }
        let info = self.host.cluster_info(cluster_namespace).await?;
        Ok((
            short_user_name(&info.ceph_cred.username),
            info.ceph_cred.secret,
        ))
    }

    async fn detach_volume(&self, opts: &AttachOptions, force: bool) -> Result<()> {
        let cluster_namespace = cluster_namespace_of(opts);
        // A missing cluster leaves nothing mapped that would need credentials.
        let (user, key) = match self.block_credentials(opts, cluster_namespace).await {
            Ok(creds) => creds,
            Err(err) if err.is_not_found() => {
                warn!(%err, cluster_namespace, "cluster information unavailable for detach");
                (String::new(), String::new())
            }
            Err(err) => return Err(err),
        };
        self.manager
            .detach(
                &opts.image,
                opts.effective_pool(),
                &user,
                &key,
                cluster_namespace,
                force,
            )
            .await
            .map_err(Error::backend)?;

        let namespace = &self.config.namespace;
        match self.store.get(namespace, &opts.volume_name).await {
            Ok(record) if record.spec.attachments.is_empty() => {
                match self.store.delete(namespace, &opts.volume_name).await {
                    Ok(()) | Err(StoreError::NotFound(_)) => {
                        info!(volume = %opts.volume_name, "deleted volume attachment record");
                        Ok(())
                    }
                    Err(err) => Err(err.into()),
                }
            }
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn cluster_namespace_from_volume(&self, volume: &PersistentVolume) -> Result<String> {
        let options = flex_options(volume);
        for key in [CLUSTER_NAMESPACE_KEY, LEGACY_CLUSTER_NAMESPACE_KEY] {
            if let Some(namespace) = options.get(key).filter(|v| !v.is_empty()) {
                return Ok(namespace.clone());
            }
        }
        let Some(storage_class) = options.get("storageClass").filter(|v| !v.is_empty()) else {
            return Ok(DEFAULT_CLUSTER_NAMESPACE.to_owned());
        };
        let class = self.host.get_storage_class(storage_class).await?;
        let parameters = class.parameters.unwrap_or_default();
        Ok([CLUSTER_NAMESPACE_KEY, LEGACY_CLUSTER_NAMESPACE_KEY]
            .iter()
            .find_map(|key| parameters.get(*key).filter(|v| !v.is_empty()).cloned())
            .unwrap_or_else(|| DEFAULT_CLUSTER_NAMESPACE.to_owned()))
    }

    /// Key stored in the secret `name`, which must hold exactly one entry.
    async fn mount_secret_value(&self, namespace: &str, name: &str) -> Result<String> {
        let secret = self.host.get_secret(namespace, name).await?;
        let data = secret.data.unwrap_or_default();
        if data.len() != 1 {
            return Err(Error::Validation(format!(
                "secret {namespace}/{name} must contain exactly one data entry, found {}",
                data.len()
            )));
        }
        let value = data.into_values().next().unwrap_or_default();
        String::from_utf8(value.0).map_err(|err| {
            Error::Validation(format!("secret {namespace}/{name} is not valid utf-8: {err}"))
        })
    }
}

fn short_user_name(username: &str) -> String {
    username
        .strip_prefix("client.")
        .unwrap_or(username)
        .to_owned()
}

fn cluster_namespace_of(opts: &AttachOptions) -> &str {
    match opts.effective_cluster_namespace() {
        "" => DEFAULT_CLUSTER_NAMESPACE,
        namespace => namespace,
    }
}

fn require_block(opts: &AttachOptions) -> Result<()> {
    if opts.image.is_empty() || opts.effective_pool().is_empty() {
        return Err(Error::Validation(format!(
            "volume {} has no image and pool, only block volumes can be attached",
            opts.volume_name
        )));
    }
    Ok(())
}

fn flex_options(volume: &PersistentVolume) -> std::collections::BTreeMap<String, String> {
    volume
        .spec
        .as_ref()
        .and_then(|spec| spec.flex_volume.as_ref())
        .and_then(|flex| flex.options.clone())
        .unwrap_or_default()
}

fn pod_uid(pod: &Pod) -> Option<&str> {
    pod.metadata.uid.as_deref()
}

#[async_trait]
impl<S, M, H> VolumeController for FlexvolumeController<S, M, H>
where
    S: AttachmentStore,
    M: VolumeManager,
    H: HostPlatform,
{
    #[instrument(skip(self, opts), fields(volume = %opts.volume_name, pod = %opts.pod_name))]
    async fn attach(&self, opts: &AttachOptions) -> Result<String> {
        require_block(opts)?;
        let cluster_namespace = cluster_namespace_of(opts);
        self.record_attachment(opts, cluster_namespace).await?;

        let (user, key) = self.block_credentials(opts, cluster_namespace).await?;
        let device = self
            .manager
            .attach(
                &opts.image,
                opts.effective_pool(),
                &user,
                &key,
                cluster_namespace,
            )
            .await
            .map_err(Error::backend)?;
        info!(device = %device, "volume attached");
        Ok(device)
    }

    #[instrument(skip(self, opts), fields(volume = %opts.volume_name))]
    async fn detach(&self, opts: &AttachOptions) -> Result<()> {
        self.detach_volume(opts, false).await
    }

    #[instrument(skip(self, opts), fields(volume = %opts.volume_name))]
    async fn detach_force(&self, opts: &AttachOptions) -> Result<()> {
        self.detach_volume(opts, true).await
    }

    #[instrument(skip(self, opts), fields(volume = %opts.volume_name, mount_dir = %opts.mount_dir))]
    async fn remove_attachment_object(&self, opts: &AttachOptions) -> Result<bool> {
        let namespace = &self.config.namespace;
        let node = &self.config.node_name;
        let mut record = self.store.get(namespace, &opts.volume_name).await?;

        let on_node = record
            .spec
            .attachments
            .iter()
            .filter(|a| &a.node == node)
            .count();
        let Some(index) = record
            .spec
            .attachments
            .iter()
            .position(|a| &a.node == node && a.mount_dir == opts.mount_dir)
        else {
            return Err(Error::NotFound(format!(
                "volume {} has no attachment for {} on node {}",
                opts.volume_name, opts.mount_dir, node
            )));
        };
        record.spec.attachments.remove(index);

        if record.spec.attachments.is_empty() {
            self.store.delete(namespace, &opts.volume_name).await?;
        } else {
            self.store.update(namespace, &record).await?;
        }
        let safe_to_detach = on_node == 1;
        info!(safe_to_detach, "removed attachment");
        Ok(safe_to_detach)
    }

    #[instrument(skip(self, opts))]
    async fn get_attach_info_from_mount_dir(
        &self,
        mount_dir: &str,
        mut opts: AttachOptions,
    ) -> Result<AttachOptions> {
        let (pod_id, volume_name) = pod_and_pv_from_mount_dir(mount_dir)?;
        opts.pod_id = pod_id;
        opts.volume_name = volume_name;
        opts.mount_dir = mount_dir.to_owned();

        let volume = self.host.get_persistent_volume(&opts.volume_name).await?;
        if opts.pod_namespace.is_empty() {
            opts.pod_namespace = volume
                .spec
                .as_ref()
                .and_then(|spec| spec.claim_ref.as_ref())
                .and_then(|claim| claim.namespace.clone())
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "persistent volume {} is not bound to a claim",
                        opts.volume_name
                    ))
                })?;
        }

        if opts.pod_name.is_empty() {
            let pods = self
                .host
                .list_node_pods(&opts.pod_namespace, &self.config.node_name)
                .await?;
            // Unmount only needs the volume and the mount dir, so a deleted pod is fine.
            match pods
                .iter()
                .find(|pod| pod_uid(pod) == Some(opts.pod_id.as_str()))
                .and_then(|pod| pod.metadata.name.clone())
            {
                Some(name) => opts.pod_name = name,
                None => debug!(
                    pod_id = %opts.pod_id,
                    pod_namespace = %opts.pod_namespace,
                    "no pod on this node has the mount dir's uid"
                ),
            }
        }

        let options = flex_options(&volume);
        for (key, field) in [
            ("image", &mut opts.image),
            ("blockPool", &mut opts.block_pool),
            ("pool", &mut opts.pool),
            ("storageClass", &mut opts.storage_class),
        ] {
            if field.is_empty() {
                *field = options.get(key).cloned().unwrap_or_default();
            }
        }
        opts.cluster_namespace = self.cluster_namespace_from_volume(&volume).await?;
        Ok(opts)
    }

    async fn get_global_mount_path(&self, input: &GlobalMountPathInput) -> Result<String> {
        let (vendor, driver) = vendor_and_driver(&input.driver_dir)?;
        Ok(global_mount_path(
            &self.config.kubelet_root_dir,
            &vendor,
            &driver,
            &input.volume_name,
        )
        .display()
        .to_string())
    }

    #[instrument(skip(self, mount_secret))]
    async fn get_client_access_info(
        &self,
        cluster_namespace: &str,
        pod_namespace: &str,
        mount_user: &str,
        mount_secret: &str,
    ) -> Result<ClientAccessInfo> {
        let info = self.host.cluster_info(cluster_namespace).await?;
        let monitors = info.monitor_endpoints();
        let explicit = !mount_user.is_empty() && !mount_secret.is_empty();

        let (user_name, secret_key) = match self.config.security_mode {
            MountSecurityMode::Restricted if !explicit => {
                return Err(Error::Policy(
                    "no mount user and/or mount secret given while the agent runs in Restricted mount security mode"
                        .to_owned(),
                ));
            }
            MountSecurityMode::Any if !explicit => (
                short_user_name(&info.ceph_cred.username),
                info.ceph_cred.secret,
            ),
            _ => (
                mount_user.to_owned(),
                self.mount_secret_value(pod_namespace, mount_secret).await?,
            ),
        };
        Ok(ClientAccessInfo {
            monitors,
            user_name,
            secret_key,
        })
    }

    async fn get_kernel_version(&self) -> Result<String> {
        let node = self.host.get_node(&self.config.node_name).await?;
        node.status
            .and_then(|status| status.node_info)
            .map(|info| info.kernel_version)
            .filter(|version| !version.is_empty())
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "kernel version of node {}",
                    self.config.node_name
                ))
            })
    }

    #[instrument(skip(self, args), fields(volume = %args.options.volume_name, size_bytes = args.size_bytes))]
    async fn expand(&self, args: &ExpandArgs) -> Result<()> {
        require_block(&args.options)?;
        let size_mb = args.size_bytes.div_ceil(BYTES_PER_MB);
        self.manager
            .expand(
                &args.options.image,
                args.options.effective_pool(),
                cluster_namespace_of(&args.options),
                size_mb,
            )
            .await
            .map_err(Error::backend)
    }

    async fn log(&self, message: &LogMessage) -> Result<()> {
        if message.is_error {
            error!(target: LOG_TARGET, "{}", message.message);
        } else {
            info!(target: LOG_TARGET, "{}", message.message);
        }
        Ok(())
    }
}
