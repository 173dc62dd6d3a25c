//! Reconciles CephCluster resources into running daemons.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use futures::stream::StreamExt;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use kube::{
    client::Client,
    runtime::{
        controller::Action,
        finalizer::{self, finalizer},
        watcher, Controller,
    },
    Api, ResourceExt,
};
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    ceph::{
        client::{CephCli, CephClient},
        info::{write_connection_config, ClusterInfo},
        keyring::UNINITIALIZED,
        version::CephVersion,
    },
    cluster::{
        cephx::{AdminKeyRotator, Reloader, RotationRequest},
        compare::specs_equal,
        daemons::{CephDaemons, DaemonKind, DeploymentDaemons},
        orchestration::Flights,
        resources::{cluster_key, ClusterResources, KubeClusterResources},
        validation::validate,
        version::{
            check_supported, check_upgrade_health, upgrade_kind, JobVersionDetector, UpgradeKind,
            VersionDetector,
        },
        CephCluster, CephClusterSpec, CephClusterStatus, CephxStatus, ClusterVersion,
    },
    config::OperatorConfig,
    error::{Error, Result},
    labels::MANAGED_BY_LABEL_SELECTOR,
    utils::exec::ProcessExecutor,
};

/// Finalizer that lets the operator forget a cluster before it is removed.
pub const FINALIZER: &str = "cephcluster.ceph.rook.io";

/// Daemons are being created or updated.
pub const PHASE_PROGRESSING: &str = "Progressing";
/// Every daemon runs the desired version.
pub const PHASE_READY: &str = "Ready";
/// An external cluster is reachable.
pub const PHASE_CONNECTED: &str = "Connected";
/// The last orchestration failed.
pub const PHASE_FAILURE: &str = "Failure";

const ERROR_REQUEUE: Duration = Duration::from_secs(5);

struct Orchestrated {
    spec: CephClusterSpec,
    at: Instant,
}

/// Collaborators and per cluster state shared by every reconcile.
pub struct Context {
    client: Client,
    resources: Arc<dyn ClusterResources>,
    ceph: Arc<dyn CephClient>,
    detector: Arc<dyn VersionDetector>,
    daemons: Arc<dyn CephDaemons>,
    rotator: Arc<AdminKeyRotator<dyn CephClient, dyn ClusterResources>>,
    flights: Flights,
    config: OperatorConfig,
    config_dir: PathBuf,
    latest: Mutex<HashMap<String, Arc<CephCluster>>>,
    orchestrated: Mutex<HashMap<String, Orchestrated>>,
}

impl Context {
    /// Context backed by the API server and the ceph CLI.
    pub fn new(
        client: Client,
        config: OperatorConfig,
        config_dir: impl AsRef<Path>,
        reloader: Arc<dyn Reloader>,
    ) -> Self {
        let ceph: Arc<dyn CephClient> = Arc::new(CephCli::new(
            ProcessExecutor,
            config_dir.as_ref(),
            config.commands_timeout,
        ));
        Self::with(
            client.clone(),
            Arc::new(KubeClusterResources::new(client.clone())),
            ceph,
            Arc::new(JobVersionDetector::new(
                client.clone(),
                config.detect_version_timeout,
            )),
            Arc::new(DeploymentDaemons::new(client)),
            reloader,
            config,
            config_dir,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn with(
        client: Client,
        resources: Arc<dyn ClusterResources>,
        ceph: Arc<dyn CephClient>,
        detector: Arc<dyn VersionDetector>,
        daemons: Arc<dyn CephDaemons>,
        reloader: Arc<dyn Reloader>,
        config: OperatorConfig,
        config_dir: impl AsRef<Path>,
    ) -> Self {
        let rotator = Arc::new(AdminKeyRotator::new(
            ceph.clone(),
            resources.clone(),
            reloader,
            config_dir.as_ref(),
        ));
        Self {
            client,
            resources,
            ceph,
            detector,
            daemons,
            rotator,
            flights: Flights::default(),
            config,
            config_dir: config_dir.as_ref().to_owned(),
            latest: Default::default(),
            orchestrated: Default::default(),
        }
    }

    /// Time left before an unchanged, successfully orchestrated cluster is orchestrated again.
    fn resync_remaining(&self, key: &str, spec: &CephClusterSpec) -> Option<Duration> {
        let orchestrated = self
            .orchestrated
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let last = orchestrated.get(key)?;
        if !specs_equal(&last.spec, spec) {
            return None;
        }
        self.config
            .resync_period
            .checked_sub(last.at.elapsed())
            .filter(|remaining| !remaining.is_zero())
    }

    fn set_latest(&self, key: &str, cluster: Arc<CephCluster>) {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), cluster);
    }

    fn latest(&self, key: &str) -> Option<Arc<CephCluster>> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn forget(&self, key: &str) {
        self.flights.forget(key);
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        self.orchestrated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// Run the CephCluster controller until shutdown, restarting it whenever the admin key changes.
pub async fn run(namespace: String, config_dir: PathBuf) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    let config = OperatorConfig::load(client.clone(), &namespace).await?;
    info!(%namespace, config_dir = %config_dir.display(), ?config, "starting cluster controller");

    loop {
        let reload = Arc::new(Notify::new());
        let context = Arc::new(Context::new(
            client.clone(),
            config.clone(),
            &config_dir,
            reload.clone(),
        ));

        let clusters: Api<CephCluster> = Api::all(client.clone());
        let deployments = Api::<Deployment>::all(client.clone());
        let services = Api::<Service>::all(client.clone());
        let controller = Controller::new(clusters, watcher::Config::default())
            .owns(
                deployments,
                watcher::Config::default().labels(MANAGED_BY_LABEL_SELECTOR),
            )
            .owns(
                services,
                watcher::Config::default().labels(MANAGED_BY_LABEL_SELECTOR),
            )
            .graceful_shutdown_on(async move { reload.notified().await })
            .run(reconcile, on_error, context)
            .for_each(|rec_res| async move {
                match rec_res {
                    Ok((cluster, _)) => {
                        debug!(cluster.name, "reconcile success");
                    }
                    Err(err) => {
                        error!(?err, "reconcile error")
                    }
                }
            });

        tokio::select! {
            _ = controller => info!("admin key changed, restarting cluster controller"),
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down cluster controller");
                return Ok(());
            }
        }
    }
}

/// Handle errors during reconciliation.
fn on_error(_cluster: Arc<CephCluster>, _error: &Error, _cx: Arc<Context>) -> Action {
    Action::requeue(ERROR_REQUEUE)
}

/// Perform a reconcile pass for the CephCluster CRD
async fn reconcile(cluster: Arc<CephCluster>, cx: Arc<Context>) -> Result<Action> {
    let namespace = cluster
        .namespace()
        .ok_or_else(|| Error::Validation("CephCluster must be namespaced".to_owned()))?;
    let clusters: Api<CephCluster> = Api::namespaced(cx.client.clone(), &namespace);
    let res = finalizer(&clusters, FINALIZER, cluster, |event| async {
        match event {
            finalizer::Event::Apply(cluster) => apply(cluster, cx.clone()).await,
            finalizer::Event::Cleanup(cluster) => cleanup(cluster, cx.clone()).await,
        }
    })
    .await;
    match res {
        Ok(action) => Ok(action),
        Err(finalizer::Error::ApplyFailed(err)) | Err(finalizer::Error::CleanupFailed(err)) => {
            if err.is_successful_rotation() {
                // The reload stops this controller; nothing more to do here.
                Ok(Action::await_change())
            } else {
                Err(err)
            }
        }
        Err(err) => Err(anyhow::anyhow!("finalizer: {err}").into()),
    }
}

#[instrument(skip_all, fields(cluster = %cluster_key(&cluster)))]
async fn apply(cluster: Arc<CephCluster>, cx: Arc<Context>) -> Result<Action> {
    let key = cluster_key(&cluster);
    if let Some(remaining) = cx.resync_remaining(&key, &cluster.spec) {
        debug!(?remaining, "spec unchanged since last orchestration");
        return Ok(Action::requeue(remaining));
    }

    cx.set_latest(&key, cluster.clone());
    let flight = cx.flights.get(&key);
    let res = flight
        .trigger(|| {
            let cx = cx.clone();
            let cluster = cx.latest(&key).unwrap_or_else(|| cluster.clone());
            async move {
                let res = orchestrate(&cluster, &cx).await;
                if res.is_ok() {
                    cx.orchestrated
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(
                            cluster_key(&cluster),
                            Orchestrated {
                                spec: cluster.spec.clone(),
                                at: Instant::now(),
                            },
                        );
                }
                res
            }
        })
        .await;

    match res {
        None | Some(Ok(())) => Ok(Action::requeue(cx.config.resync_period)),
        Some(Err(err)) if err.is_successful_rotation() => Err(err),
        Some(Err(err)) => {
            warn!(%err, "orchestration failed");
            let status = CephClusterStatus {
                phase: Some(PHASE_FAILURE.to_owned()),
                message: Some(err.to_string()),
                ..cluster.status.clone().unwrap_or_default()
            };
            if let Err(status_err) = cx
                .resources
                .update_status(
                    &cluster.namespace().unwrap_or_default(),
                    &cluster.name_any(),
                    &status,
                )
                .await
            {
                warn!(%status_err, "failed to record failure status");
            }
            Err(err)
        }
    }
}

async fn cleanup(cluster: Arc<CephCluster>, cx: Arc<Context>) -> Result<Action> {
    let key = cluster_key(&cluster);
    info!(cluster = %key, "cluster deleted");
    cx.forget(&key);
    Ok(Action::await_change())
}

fn recorded_version(status: &CephClusterStatus) -> Option<CephVersion> {
    status
        .version
        .as_ref()
        .and_then(|version| CephVersion::parse_status(&version.version).ok())
}

/// One full pass bringing the cluster toward its spec.
async fn orchestrate(cluster: &CephCluster, cx: &Context) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let spec = &cluster.spec;
    let mut status = cluster.status.clone().unwrap_or_default();

    let (mut info, cephx) = match cx.resources.load_cluster_info(&namespace).await? {
        Some(info) => (info, status.cephx.admin.clone()),
        None => {
            let info = ClusterInfo::generate(&namespace, &name, &mut rand::thread_rng());
            info!(fsid = %info.fsid, "created cluster identity");
            cx.resources.save_cluster_info(&info).await?;
            let cephx = CephxStatus {
                key_generation: 0,
                key_ceph_version: UNINITIALIZED.to_owned(),
            };
            cx.resources
                .update_cephx_status(&namespace, &name, &cephx)
                .await?;
            (info, cephx)
        }
    };
    let rotation = |info: &ClusterInfo, running: CephVersion, image: CephVersion| RotationRequest {
        name: name.clone(),
        info: info.clone(),
        cfg: spec.security.cephx.daemon.clone(),
        status: cephx.clone(),
        running,
        image,
    };

    let recorded = recorded_version(&status).unwrap_or_default();
    cx.rotator
        .recover(rotation(&info, recorded, recorded))
        .await?;

    let validated = validate(spec)?;
    write_connection_config(&cx.config_dir, &info)?;

    if spec.external.enable {
        status.phase = Some(PHASE_CONNECTED.to_owned());
        status.message = Some("connected to the external cluster".to_owned());
        cx.resources
            .update_status(&namespace, &name, &status)
            .await?;
        return Ok(());
    }

    let image = &spec.ceph_version.image;
    let desired = cx.detector.detect(cluster, image).await?;
    check_supported(&desired, spec.ceph_version.allow_unsupported)?;
    info.ceph_version = desired;

    let admin = info.admin_identity(&cx.config_dir);
    let kind = if status.version.is_some() {
        upgrade_kind(&desired, &cx.ceph.versions(&info, &admin).await?)?
    } else {
        UpgradeKind::NewCluster
    };
    if let UpgradeKind::Upgrade { from } = &kind {
        let health = cx.ceph.health(&info, &admin).await?;
        check_upgrade_health(&health, spec.skip_upgrade_checks)?;
        info!(%from, to = %desired, "upgrading cluster");
    }

    status.phase = Some(PHASE_PROGRESSING.to_owned());
    status.message = Some(match &kind {
        UpgradeKind::NewCluster => format!("creating cluster running {desired}"),
        UpgradeKind::NoChange => format!("updating cluster running {desired}"),
        UpgradeKind::Upgrade { from } => format!("upgrading cluster from {from} to {desired}"),
    });
    status.is_upgrade = matches!(kind, UpgradeKind::Upgrade { .. });
    cx.resources
        .update_status(&namespace, &name, &status)
        .await?;

    for daemon in DaemonKind::ORDER {
        cx.daemons
            .start(daemon, cluster, &info, validated.mon_count)
            .await?;
    }

    cx.rotator
        .rotate(rotation(&info, desired, desired))
        .await?;

    status.phase = Some(PHASE_READY.to_owned());
    status.message = Some(format!("cluster running {desired}"));
    status.version = Some(ClusterVersion {
        image: image.clone(),
        version: desired.status_string(),
    });
    status.is_upgrade = false;
    cx.resources
        .update_status(&namespace, &name, &status)
        .await?;
    info!(version = %desired, "cluster orchestrated");
    Ok(())
}
