//! Starts and updates the Ceph daemons of a cluster as Deployments.
use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::DeploymentSpec,
        core::v1::{
            Container, ContainerPort, HostPathVolumeSource, PodSpec, PodTemplateSpec,
            ResourceRequirements, ServicePort, ServiceSpec, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference},
};
use kube::{core::ObjectMeta, Client, Resource, ResourceExt};
use tracing::{debug, info};

use crate::{
    ceph::info::ClusterInfo,
    cluster::CephCluster,
    error::{Error, Result},
    labels::selector_labels,
    utils::{apply_deployment, apply_service},
};

/// Daemon types, in the order they are started.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DaemonKind {
    /// Monitors
    Mon,
    /// Managers
    Mgr,
    /// Object storage daemons
    Osd,
    /// RBD mirroring daemons
    RbdMirror,
}

impl DaemonKind {
    /// Start order of a cluster.
    pub const ORDER: [DaemonKind; 4] = [
        DaemonKind::Mon,
        DaemonKind::Mgr,
        DaemonKind::Osd,
        DaemonKind::RbdMirror,
    ];

    /// Key of the daemon type in the spec's resources map.
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonKind::Mon => "mon",
            DaemonKind::Mgr => "mgr",
            DaemonKind::Osd => "osd",
            DaemonKind::RbdMirror => "rbdmirror",
        }
    }

    fn app(&self) -> &'static str {
        match self {
            DaemonKind::Mon => "rook-ceph-mon",
            DaemonKind::Mgr => "rook-ceph-mgr",
            DaemonKind::Osd => "rook-ceph-osd",
            DaemonKind::RbdMirror => "rook-ceph-rbd-mirror",
        }
    }
}

/// Define how the daemons of a cluster are started.
#[async_trait]
pub trait CephDaemons: Send + Sync {
    /// Start or update every daemon of `kind` for `cluster`.
    async fn start(
        &self,
        kind: DaemonKind,
        cluster: &CephCluster,
        info: &ClusterInfo,
        mon_count: i32,
    ) -> Result<()>;
}

/// Daemon ids are letters: a, b, ..., z, aa, ab, ...
pub fn daemon_id(mut index: usize) -> String {
    let mut id = Vec::new();
    loop {
        id.push(b'a' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    id.reverse();
    String::from_utf8_lossy(&id).into_owned()
}

/// Runs daemons as Deployments through server side apply.
#[derive(Clone)]
pub struct DeploymentDaemons {
    client: Client,
}

struct DaemonTemplate<'a> {
    kind: DaemonKind,
    name: String,
    id: String,
    args: Vec<String>,
    replicas: i32,
    node: Option<&'a str>,
    resources: Option<ResourceRequirements>,
}

impl DeploymentDaemons {
    /// Daemons created through the given API client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn apply(
        &self,
        cluster: &CephCluster,
        info: &ClusterInfo,
        orefs: &[OwnerReference],
        template: DaemonTemplate<'_>,
    ) -> Result<()> {
        let namespace = &info.namespace;
        let app = template.kind.app();
        let mut labels = selector_labels(app);
        labels.insert("ceph_daemon_id".to_owned(), template.id.clone());
        labels.insert("rook_cluster".to_owned(), namespace.clone());

        let data_dir = cluster.spec.data_dir_host_path.clone();
        let mut args = vec![
            format!("--fsid={}", info.fsid),
            format!("--id={}", template.id),
            "--foreground".to_owned(),
        ];
        args.extend(template.args);
        let node_selector = template.node.map(|node| {
            BTreeMap::from_iter(vec![(
                "kubernetes.io/hostname".to_owned(),
                node.to_owned(),
            )])
        });
        let spec = DeploymentSpec {
            replicas: Some(template.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: template.kind.as_str().to_owned(),
                        image: Some(cluster.spec.ceph_version.image.clone()),
                        command: Some(vec![daemon_command(template.kind).to_owned()]),
                        args: Some(args),
                        resources: template.resources,
                        volume_mounts: Some(vec![VolumeMount {
                            name: "rook-data".to_owned(),
                            mount_path: "/var/lib/rook".to_owned(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    node_selector,
                    volumes: Some(vec![Volume {
                        name: "rook-data".to_owned(),
                        host_path: Some(HostPathVolumeSource {
                            path: data_dir,
                            type_: None,
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        };
        apply_deployment(
            &self.client,
            namespace,
            orefs.to_vec(),
            &template.name,
            spec,
            Some(labels),
        )
        .await?;
        debug!(deployment = %template.name, "applied daemon");
        Ok(())
    }

    async fn apply_mon_service(
        &self,
        namespace: &str,
        orefs: &[OwnerReference],
        id: &str,
    ) -> Result<()> {
        let mut selector = selector_labels(DaemonKind::Mon.app());
        selector.insert("ceph_daemon_id".to_owned(), id.to_owned());
        let port = |name: &str, port: i32| ServicePort {
            name: Some(name.to_owned()),
            port,
            protocol: Some("TCP".to_owned()),
            ..Default::default()
        };
        let spec = ServiceSpec {
            ports: Some(vec![port("tcp-msgr1", 6789), port("tcp-msgr2", 3300)]),
            selector: Some(selector.clone()),
            ..Default::default()
        };
        apply_service(
            &self.client,
            namespace,
            orefs.to_vec(),
            &format!("rook-ceph-mon-{id}"),
            spec,
            Some(selector),
        )
        .await?;
        Ok(())
    }
}

fn daemon_command(kind: DaemonKind) -> &'static str {
    match kind {
        DaemonKind::Mon => "ceph-mon",
        DaemonKind::Mgr => "ceph-mgr",
        DaemonKind::Osd => "ceph-osd",
        DaemonKind::RbdMirror => "rbd-mirror",
    }
}

fn resources_for(cluster: &CephCluster, kind: DaemonKind) -> Option<ResourceRequirements> {
    cluster
        .spec
        .resources
        .as_ref()
        .and_then(|resources| resources.get(kind.as_str()))
        .cloned()
}

#[async_trait]
impl CephDaemons for DeploymentDaemons {
    async fn start(
        &self,
        kind: DaemonKind,
        cluster: &CephCluster,
        info: &ClusterInfo,
        mon_count: i32,
    ) -> Result<()> {
        let orefs: Vec<OwnerReference> = cluster.controller_owner_ref(&()).into_iter().collect();
        let mon_hosts = info.monitor_endpoints().join(",");
        match kind {
            DaemonKind::Mon => {
                let count = usize::try_from(mon_count)
                    .map_err(|_| Error::Validation(format!("invalid mon count {mon_count}")))?;
                for id in (0..count).map(daemon_id) {
                    self.apply_mon_service(&info.namespace, &orefs, &id).await?;
                    let template = DaemonTemplate {
                        kind,
                        name: format!("rook-ceph-mon-{id}"),
                        args: vec![format!("--mon-data=/var/lib/rook/mon-{id}/data")],
                        id,
                        replicas: 1,
                        node: None,
                        resources: resources_for(cluster, kind),
                    };
                    self.apply(cluster, info, &orefs, template).await?;
                }
            }
            DaemonKind::Mgr => {
                let count = usize::try_from(cluster.spec.mgr.count.max(1)).unwrap_or(1);
                for id in (0..count).map(daemon_id) {
                    let template = DaemonTemplate {
                        kind,
                        name: format!("rook-ceph-mgr-{id}"),
                        args: vec![format!("--mon-host={mon_hosts}")],
                        id,
                        replicas: 1,
                        node: None,
                        resources: resources_for(cluster, kind),
                    };
                    self.apply(cluster, info, &orefs, template).await?;
                }
            }
            DaemonKind::Osd => {
                for node in &cluster.spec.storage.nodes {
                    let mut args = vec![format!("--mon-host={mon_hosts}")];
                    args.extend(node.devices.iter().map(|d| format!("--device={d}")));
                    let template = DaemonTemplate {
                        kind,
                        name: format!("rook-ceph-osd-{}", node.name),
                        id: node.name.clone(),
                        args,
                        replicas: 1,
                        node: Some(&node.name),
                        resources: node
                            .resources
                            .clone()
                            .or_else(|| resources_for(cluster, kind)),
                    };
                    self.apply(cluster, info, &orefs, template).await?;
                }
            }
            DaemonKind::RbdMirror => {
                let Some(mirroring) = &cluster.spec.rbd_mirroring else {
                    return Ok(());
                };
                if mirroring.workers <= 0 {
                    return Ok(());
                }
                let template = DaemonTemplate {
                    kind,
                    name: "rook-ceph-rbd-mirror".to_owned(),
                    id: "a".to_owned(),
                    args: vec![format!("--mon-host={mon_hosts}")],
                    replicas: mirroring.workers,
                    node: None,
                    resources: resources_for(cluster, kind),
                };
                self.apply(cluster, info, &orefs, template).await?;
            }
        }
        info!(cluster = %cluster.name_any(), daemon = kind.as_str(), "daemons started");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use expect_test::expect;
    use hyper::body::to_bytes;
    use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};

    use super::*;
    use crate::{
        ceph::info::tests::cluster_info,
        cluster::{CephClusterSpec, CephVersionSpec, RbdMirroringSpec},
        utils::test::{json_response, mock_client, timeout_after_1s},
    };

    fn cluster() -> CephCluster {
        let mut cluster = CephCluster::new(
            "my-cluster",
            CephClusterSpec {
                ceph_version: CephVersionSpec {
                    image: "quay.io/ceph/ceph:v19.2.3".to_owned(),
                    allow_unsupported: false,
                },
                data_dir_host_path: "/var/lib/rook".to_owned(),
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("rook-ceph".to_owned());
        cluster
    }

    #[test]
    fn daemon_ids() {
        let ids: Vec<_> = [0, 1, 25, 26, 27, 701].into_iter().map(daemon_id).collect();
        assert_eq!(ids, vec!["a", "b", "z", "aa", "ab", "zz"]);
    }

    #[tokio::test]
    async fn rbd_mirror_disabled_applies_nothing() {
        let (client, _handle) = mock_client();
        DeploymentDaemons::new(client)
            .start(
                DaemonKind::RbdMirror,
                &cluster(),
                &cluster_info("rook-ceph", "AQA"),
                3,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn applies_rbd_mirror_deployment() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().path(),
                "/apis/apps/v1/namespaces/rook-ceph/deployments/rook-ceph-rbd-mirror"
            );
            let body = to_bytes(request.into_body()).await.unwrap();
            let deployment: Deployment = serde_json::from_slice(&body).unwrap();
            let spec = deployment.spec.unwrap();
            assert_eq!(spec.replicas, Some(2));
            let pod = spec.template.spec.unwrap();
            let container = &pod.containers[0];
            assert_eq!(container.image.as_deref(), Some("quay.io/ceph/ceph:v19.2.3"));
            assert_eq!(container.command, Some(vec!["rbd-mirror".to_owned()]));
            assert!(container
                .args
                .as_ref()
                .unwrap()
                .contains(&"--mon-host=10.0.0.1:6789,10.0.0.2:6789".to_owned()));
            assert_eq!(
                deployment
                    .metadata
                    .labels
                    .unwrap()
                    .get("app.kubernetes.io/managed-by")
                    .map(String::as_str),
                Some("rook-ceph-operator")
            );
            send.send_response(json_response(&Deployment::default()));
        });

        let mut cluster = cluster();
        cluster.spec.rbd_mirroring = Some(RbdMirroringSpec { workers: 2 });
        DeploymentDaemons::new(client)
            .start(
                DaemonKind::RbdMirror,
                &cluster,
                &cluster_info("rook-ceph", "AQA"),
                3,
            )
            .await
            .unwrap();
        timeout_after_1s(server).await;
    }

    #[tokio::test]
    async fn mons_get_service_and_deployment() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(
                request.uri().path(),
                "/api/v1/namespaces/rook-ceph/services/rook-ceph-mon-a"
            );
            send.send_response(json_response(&Service::default()));

            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(
                request.uri().path(),
                "/apis/apps/v1/namespaces/rook-ceph/deployments/rook-ceph-mon-a"
            );
            let body = to_bytes(request.into_body()).await.unwrap();
            let deployment: Deployment = serde_json::from_slice(&body).unwrap();
            let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];
            expect![[r#"
                [
                    "--fsid=e5ba1a6a-1f0e-4e4c-8f0b-3a6d0a2f0c11",
                    "--id=a",
                    "--foreground",
                    "--mon-data=/var/lib/rook/mon-a/data",
                ]
            "#]]
            .assert_debug_eq(container.args.as_ref().unwrap());
            send.send_response(json_response(&Deployment::default()));
        });

        DeploymentDaemons::new(client)
            .start(
                DaemonKind::Mon,
                &cluster(),
                &cluster_info("rook-ceph", "AQA"),
                1,
            )
            .await
            .unwrap();
        timeout_after_1s(server).await;
    }
}
