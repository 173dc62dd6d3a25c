//! Releases the attachments of a deleted cluster on this node.
use std::{sync::Arc, time::Duration};

use kube::ResourceExt;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{Error, Result},
    flexvolume::{AttachOptions, VolumeController},
    utils::retry_on_conflict,
    volume::{Attachment, AttachmentStore},
};

/// Attempts at removing an attachment before a worker gives up.
pub const REMOVE_ATTEMPTS: usize = 3;
/// Pause between attempts.
pub const REMOVE_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Outcome of one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Mounts released.
    pub released: usize,
    /// Mounts whose worker failed.
    pub failed: usize,
}

/// Forcibly detaches every mount on this node that belongs to a cluster being deleted.
pub struct Sweeper<C: ?Sized, S: ?Sized> {
    controller: Arc<C>,
    store: Arc<S>,
    namespace: String,
    node_name: String,
    retry_interval: Duration,
}

impl<C, S> Sweeper<C, S>
where
    C: VolumeController + ?Sized + 'static,
    S: AttachmentStore + ?Sized + 'static,
{
    /// Sweeper for the records in `namespace` attached on `node_name`.
    pub fn new(
        controller: Arc<C>,
        store: Arc<S>,
        namespace: impl Into<String>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            controller,
            store,
            namespace: namespace.into(),
            node_name: node_name.into(),
            retry_interval: REMOVE_RETRY_INTERVAL,
        }
    }

    #[cfg(test)]
    fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Release every attachment of `cluster_namespace` on this node and wait for all workers.
    #[instrument(skip(self), fields(node = %self.node_name))]
    pub async fn sweep(&self, cluster_namespace: &str) -> Result<SweepReport> {
        let volumes = self.store.list(&self.namespace).await?;
        let mut workers = JoinSet::new();
        for volume in volumes {
            let volume_name = volume.name_any();
            for attachment in volume.spec.attachments {
                if attachment.node != self.node_name
                    || attachment.cluster_name != cluster_namespace
                {
                    continue;
                }
                debug!(volume = %volume_name, mount_dir = %attachment.mount_dir, "releasing mount");
                let worker = Worker {
                    controller: self.controller.clone(),
                    store: self.store.clone(),
                    namespace: self.namespace.clone(),
                    retry_interval: self.retry_interval,
                };
                let volume_name = volume_name.clone();
                workers.spawn(async move {
                    let res = worker.release(&attachment).await;
                    (volume_name, attachment.mount_dir, res)
                });
            }
        }

        let mut report = SweepReport::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, _, Ok(()))) => report.released += 1,
                Ok((volume, mount_dir, Err(err))) => {
                    warn!(%volume, %mount_dir, %err, "failed to release mount");
                    report.failed += 1;
                }
                Err(err) => {
                    warn!(%err, "sweep worker panicked");
                    report.failed += 1;
                }
            }
        }
        info!(
            cluster = cluster_namespace,
            released = report.released,
            failed = report.failed,
            "swept attachments of deleted cluster"
        );
        Ok(report)
    }
}

struct Worker<C: ?Sized, S: ?Sized> {
    controller: Arc<C>,
    store: Arc<S>,
    namespace: String,
    retry_interval: Duration,
}

impl<C, S> Worker<C, S>
where
    C: VolumeController + ?Sized,
    S: AttachmentStore + ?Sized,
{
    async fn release(&self, attachment: &Attachment) -> Result<()> {
        let seed = AttachOptions {
            pod_namespace: attachment.pod_namespace.clone(),
            pod_name: attachment.pod_name.clone(),
            read_write_mode: if attachment.read_only { "ro" } else { "rw" }.to_owned(),
            ..Default::default()
        };
        let opts = self
            .controller
            .get_attach_info_from_mount_dir(&attachment.mount_dir, seed)
            .await?;
        self.controller.detach_force(&opts).await?;
        let safe_to_detach = retry_on_conflict(REMOVE_ATTEMPTS, self.retry_interval, || {
            self.controller.remove_attachment_object(&opts)
        })
        .await?;
        if safe_to_detach {
            match self.store.delete(&self.namespace, &opts.volume_name).await {
                Ok(()) => {}
                Err(err) => {
                    let err = Error::from(err);
                    if !err.is_not_found() {
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use mockall::predicate;

    use super::*;
    use crate::{
        flexvolume::stub::MockVolumeControllerTest,
        volume::{stub::MemoryStore, Volume},
    };

    const NS: &str = "rook-ceph-system";
    const NODE: &str = "node-a";

    fn attachment(node: &str, pod: &str, cluster: &str, volume: &str) -> Attachment {
        Attachment {
            node: node.to_owned(),
            pod_namespace: "apps".to_owned(),
            pod_name: pod.to_owned(),
            cluster_name: cluster.to_owned(),
            mount_dir: format!("/var/lib/kubelet/pods/{pod}-uid/volumes/ceph.rook.io~rook/{volume}"),
            read_only: true,
        }
    }

    fn record(volume: &str, attachments: Vec<Attachment>) -> Volume {
        let mut record = Volume::with_attachment(NS, volume, "rook-ceph", attachments[0].clone());
        record.spec.attachments = attachments;
        record
    }

    fn expect_attach_info(controller: &mut MockVolumeControllerTest) {
        controller
            .expect_get_attach_info_from_mount_dir()
            .returning(|mount_dir, mut opts| {
                let volume = mount_dir.rsplit('/').next().unwrap_or_default();
                opts.mount_dir = mount_dir.to_owned();
                opts.volume_name = volume.to_owned();
                opts.image = volume.to_owned();
                opts.pool = "replicapool".to_owned();
                Ok(opts)
            });
    }

    #[tokio::test]
    async fn releases_only_this_node_and_cluster() {
        let store = Arc::new(MemoryStore::with(vec![
            record(
                "pvc-1",
                vec![
                    attachment(NODE, "web-0", "rook-ceph", "pvc-1"),
                    attachment("node-b", "web-1", "rook-ceph", "pvc-1"),
                ],
            ),
            record("pvc-2", vec![attachment(NODE, "db-0", "other", "pvc-2")]),
        ]));
        let mut controller = MockVolumeControllerTest::new();
        expect_attach_info(&mut controller);
        controller
            .expect_detach_force()
            .withf(|opts| opts.volume_name == "pvc-1" && opts.pod_name == "web-0")
            .times(1)
            .returning(|_| Ok(()));
        controller
            .expect_remove_attachment_object()
            .times(1)
            .returning(|_| Ok(false));

        let sweeper = Sweeper::new(Arc::new(controller), store.clone(), NS, NODE);
        let report = sweeper.sweep("rook-ceph").await.unwrap();

        assert_eq!(report, SweepReport { released: 1, failed: 0 });
        assert!(store.record(NS, "pvc-1").is_some());
        assert!(store.record(NS, "pvc-2").is_some());
    }

    #[tokio::test]
    async fn deletes_record_when_safe() {
        let store = Arc::new(MemoryStore::with(vec![record(
            "pvc-1",
            vec![attachment(NODE, "web-0", "rook-ceph", "pvc-1")],
        )]));
        let mut controller = MockVolumeControllerTest::new();
        expect_attach_info(&mut controller);
        controller.expect_detach_force().returning(|_| Ok(()));
        controller
            .expect_remove_attachment_object()
            .returning(|_| Ok(true));

        let sweeper = Sweeper::new(Arc::new(controller), store.clone(), NS, NODE);
        let report = sweeper.sweep("rook-ceph").await.unwrap();

        assert_eq!(report.released, 1);
        assert!(store.record(NS, "pvc-1").is_none());
    }

    #[tokio::test]
    async fn retries_conflicting_removal() {
        let store = Arc::new(MemoryStore::with(vec![record(
            "pvc-1",
            vec![attachment(NODE, "web-0", "rook-ceph", "pvc-1")],
        )]));
        let mut controller = MockVolumeControllerTest::new();
        expect_attach_info(&mut controller);
        controller.expect_detach_force().returning(|_| Ok(()));
        let calls = AtomicUsize::new(0);
        controller
            .expect_remove_attachment_object()
            .times(3)
            .returning(move |_| {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Conflict("pvc-1".to_owned()))
                } else {
                    Ok(true)
                }
            });

        let sweeper = Sweeper::new(Arc::new(controller), store.clone(), NS, NODE)
            .with_retry_interval(Duration::from_millis(1));
        let report = sweeper.sweep("rook-ceph").await.unwrap();

        assert_eq!(report, SweepReport { released: 1, failed: 0 });
        assert!(store.record(NS, "pvc-1").is_none());
    }

    #[tokio::test]
    async fn gives_up_after_three_conflicts() {
        let store = Arc::new(MemoryStore::with(vec![record(
            "pvc-1",
            vec![attachment(NODE, "web-0", "rook-ceph", "pvc-1")],
        )]));
        let mut controller = MockVolumeControllerTest::new();
        expect_attach_info(&mut controller);
        controller.expect_detach_force().returning(|_| Ok(()));
        controller
            .expect_remove_attachment_object()
            .times(REMOVE_ATTEMPTS)
            .returning(|_| Err(Error::Conflict("pvc-1".to_owned())));

        let sweeper = Sweeper::new(Arc::new(controller), store.clone(), NS, NODE)
            .with_retry_interval(Duration::from_millis(1));
        let report = sweeper.sweep("rook-ceph").await.unwrap();

        assert_eq!(report, SweepReport { released: 0, failed: 1 });
        assert!(store.record(NS, "pvc-1").is_some());
    }

    #[tokio::test]
    async fn failed_worker_does_not_stop_siblings() {
        let store = Arc::new(MemoryStore::with(vec![
            record("pvc-1", vec![attachment(NODE, "web-0", "rook-ceph", "pvc-1")]),
            record("pvc-2", vec![attachment(NODE, "web-1", "rook-ceph", "pvc-2")]),
        ]));
        let mut controller = MockVolumeControllerTest::new();
        expect_attach_info(&mut controller);
        controller
            .expect_detach_force()
            .with(predicate::function(|opts: &AttachOptions| {
                opts.volume_name == "pvc-1"
            }))
            .returning(|_| Err(Error::backend(anyhow::anyhow!("rbd unmap failed"))));
        controller
            .expect_detach_force()
            .with(predicate::function(|opts: &AttachOptions| {
                opts.volume_name == "pvc-2"
            }))
            .returning(|_| Ok(()));
        controller
            .expect_remove_attachment_object()
            .withf(|opts| opts.volume_name == "pvc-2")
            .times(1)
            .returning(|_| Ok(true));

        let sweeper = Sweeper::new(Arc::new(controller), store.clone(), NS, NODE);
        let report = sweeper.sweep("rook-ceph").await.unwrap();

        assert_eq!(report, SweepReport { released: 1, failed: 1 });
        assert!(store.record(NS, "pvc-1").is_some());
        assert!(store.record(NS, "pvc-2").is_none());
    }
}
