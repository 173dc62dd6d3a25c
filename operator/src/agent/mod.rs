//! The per node agent: hosts the volume coordinator for the flexvolume driver and releases the
//! attachments of clusters deleted while their volumes were still mounted here.
use std::{collections::HashSet, path::PathBuf, sync::Arc};

use anyhow::Context as _;
use futures::{StreamExt, TryStreamExt};
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api, Client, ResourceExt,
};
use tracing::{error, info, warn};

use crate::{
    cluster::CephCluster,
    config::OperatorConfig,
    flexvolume::{
        controller::{ControllerConfig, FlexvolumeController},
        host::KubeHost,
        manager::{RbdVolumeManager, VolumeManager},
        plugin::Capabilities,
        server::{driver_targets, FlexvolumeServer},
        MountSecurityMode, DEFAULT_KUBELET_ROOT_DIR,
    },
    utils::exec::ProcessExecutor,
    volume::KubeAttachmentStore,
};

pub mod sweeper;

use sweeper::Sweeper;

/// Name of the driver binary shipped next to the agent.
pub const DRIVER_BINARY_NAME: &str = "rookflex";

/// Agent options.
#[derive(clap::Args, Debug, Clone)]
pub struct AgentOpts {
    /// Namespace of the operator, where attachment records are kept.
    #[arg(long, env = "POD_NAMESPACE", default_value = "rook-ceph")]
    pub namespace: String,

    /// Node this agent runs on.
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Host directory the kubelet loads flexvolume drivers from.
    #[arg(long, env = "FLEXVOLUME_DIR_PATH", default_value = "/flexmnt")]
    pub flexvolume_dir: PathBuf,

    /// Kubelet root directory on the host.
    #[arg(long, env = "ROOK_KUBELET_ROOT_DIR", default_value = DEFAULT_KUBELET_ROOT_DIR)]
    pub kubelet_root_dir: PathBuf,

    /// Credentials filesystem mounts may use.
    #[arg(long, env = "AGENT_MOUNT_SECURITY_MODE", value_enum, default_value_t)]
    pub mount_security_mode: MountSecurityMode,

    /// Driver binary to install. Defaults to rookflex next to this executable.
    #[arg(long)]
    pub driver_binary: Option<PathBuf>,

    /// Also install the driver under the legacy rook.io vendor.
    #[arg(long)]
    pub legacy_vendor: bool,

    /// Let the kubelet relabel volumes for SELinux.
    #[arg(long, env = "ROOK_ENABLE_SELINUX_RELABELING", default_value_t = true, action = clap::ArgAction::Set)]
    pub selinux_relabel: bool,

    /// Let the kubelet apply the pod fsGroup to volumes.
    #[arg(long, env = "ROOK_ENABLE_FSGROUP", default_value_t = true, action = clap::ArgAction::Set)]
    pub fs_group: bool,
}

impl AgentOpts {
    fn driver_binary(&self) -> anyhow::Result<PathBuf> {
        if let Some(binary) = &self.driver_binary {
            return Ok(binary.clone());
        }
        let exe = std::env::current_exe().context("failed to locate agent binary")?;
        let dir = exe
            .parent()
            .context("agent binary has no parent directory")?;
        Ok(dir.join(DRIVER_BINARY_NAME))
    }
}

/// Decides which clusters to sweep from the CephCluster watch events.
///
/// A cluster is swept once per deletion, even though a terminating object is reported again on
/// every update.
#[derive(Debug, Default)]
pub struct DeletionTracker {
    swept: HashSet<String>,
}

impl DeletionTracker {
    /// Namespaces whose cluster started deleting with this event.
    pub fn deleted_namespaces(&mut self, event: &watcher::Event<CephCluster>) -> Vec<String> {
        let clusters: Vec<(&CephCluster, bool)> = match event {
            watcher::Event::Deleted(cluster) => vec![(cluster, true)],
            watcher::Event::Applied(cluster) => {
                vec![(cluster, cluster.metadata.deletion_timestamp.is_some())]
            }
            watcher::Event::Restarted(clusters) => clusters
                .iter()
                .map(|c| (c, c.metadata.deletion_timestamp.is_some()))
                .collect(),
        };
        let mut deleted = Vec::new();
        for (cluster, deleting) in clusters {
            let Some(namespace) = cluster.namespace() else {
                continue;
            };
            if !deleting {
                self.swept.remove(&namespace);
            } else if self.swept.insert(namespace.clone()) {
                deleted.push(namespace);
            }
        }
        deleted
    }
}

/// Run the agent until the process is asked to stop.
pub async fn run(opts: AgentOpts) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    let config = OperatorConfig::load(client.clone(), &opts.namespace).await?;

    let host = KubeHost::new(client.clone());
    let store = KubeAttachmentStore::new(client.clone());
    let manager = RbdVolumeManager::new(
        ProcessExecutor,
        host.clone(),
        std::env::temp_dir().join("rook-flex"),
        config.commands_timeout,
    );
    if let Err(err) = manager.init().await {
        // Mounts of filesystems still work without the rbd module.
        warn!(%err, "failed to initialize the rbd volume manager");
    }
    let controller = Arc::new(FlexvolumeController::new(
        ControllerConfig {
            namespace: opts.namespace.clone(),
            node_name: opts.node_name.clone(),
            kubelet_root_dir: opts.kubelet_root_dir.clone(),
            security_mode: opts.mount_security_mode,
        },
        store.clone(),
        manager,
        host,
    ));

    let binary = opts.driver_binary()?;
    let capabilities = Capabilities::new(opts.selinux_relabel, opts.fs_group);
    let mut server = FlexvolumeServer::new(controller.clone());
    for (vendor, driver) in driver_targets(&opts.namespace, opts.legacy_vendor) {
        server
            .start(&opts.flexvolume_dir, &vendor, &driver, &binary, &capabilities)
            .await?;
    }

    let sweeper = Sweeper::new(
        controller,
        Arc::new(store),
        opts.namespace.clone(),
        opts.node_name.clone(),
    );
    info!(node = %opts.node_name, "agent started");
    tokio::select! {
        res = watch_clusters(client, &sweeper) => {
            if let Err(err) = &res {
                error!(%err, "cluster watch ended");
            }
        }
        _ = tokio::signal::ctrl_c() => info!("shutting down agent"),
    }
    server.stop_all();
    Ok(())
}

async fn watch_clusters<C, S>(client: Client, sweeper: &Sweeper<C, S>) -> anyhow::Result<()>
where
    C: crate::flexvolume::VolumeController + ?Sized + 'static,
    S: crate::volume::AttachmentStore + ?Sized + 'static,
{
    let clusters: Api<CephCluster> = Api::all(client);
    let mut tracker = DeletionTracker::default();
    let mut events = watcher(clusters, watcher::Config::default())
        .default_backoff()
        .boxed();
    while let Some(event) = events.try_next().await? {
        for namespace in tracker.deleted_namespaces(&event) {
            info!(cluster = %namespace, "cluster deleted, releasing its mounts on this node");
            if let Err(err) = sweeper.sweep(&namespace).await {
                error!(cluster = %namespace, %err, "failed to release mounts");
            }
        }
    }
    Ok(())
}
