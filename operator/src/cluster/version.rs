//! Finds the Ceph version of an image and decides whether moving to it is allowed.
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::{
    batch::v1::{Job, JobSpec},
    core::v1::{Container, Pod, PodSpec, PodTemplateSpec},
};
use kube::{
    api::{ListParams, LogParams},
    core::ObjectMeta,
    Api, Client, Resource, ResourceExt,
};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::{
    ceph::{
        client::DaemonsVersions,
        version::{CephVersion, MINIMUM, TENTACLE},
    },
    cluster::CephCluster,
    error::{Error, Result},
    labels::selector_labels,
    utils::{apply_job, delete_job},
};

/// Name of the job that runs `ceph --version` in the desired image.
pub const DETECT_VERSION_JOB_NAME: &str = "rook-ceph-detect-version";
/// Health status that allows an upgrade.
pub const HEALTH_OK: &str = "HEALTH_OK";

/// Define how the version of an image is found.
#[async_trait]
pub trait VersionDetector: Send + Sync {
    /// Version of Ceph shipped in `image`, for `cluster`.
    async fn detect(&self, cluster: &CephCluster, image: &str) -> Result<CephVersion>;
}

/// Runs the image as a job and parses its `ceph --version` output.
pub struct JobVersionDetector {
    client: Client,
    timeout: Duration,
    poll_interval: Duration,
}

impl JobVersionDetector {
    /// Detector waiting at most `timeout` for the job.
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            poll_interval: Duration::from_secs(2),
        }
    }

    #[cfg(test)]
    fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn wait_for_job(&self, namespace: &str) -> Result<()> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let deadline = Instant::now() + self.timeout;
        loop {
            let status = jobs
                .get_opt(DETECT_VERSION_JOB_NAME)
                .await?
                .and_then(|job| job.status)
                .unwrap_or_default();
            if status.succeeded.unwrap_or_default() > 0 {
                return Ok(());
            }
            if status.failed.unwrap_or_default() > 0 {
                return Err(Error::backend(anyhow::anyhow!(
                    "version detection job {DETECT_VERSION_JOB_NAME} failed"
                )));
            }
            if Instant::now() >= deadline {
                return Err(Error::backend(anyhow::anyhow!(
                    "version detection job {DETECT_VERSION_JOB_NAME} did not finish within {}s",
                    self.timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn job_output(&self, namespace: &str) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("job-name={DETECT_VERSION_JOB_NAME}"));
        let pod = pods
            .list(&params)
            .await?
            .items
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("pod of job {DETECT_VERSION_JOB_NAME}")))?;
        Ok(pods.logs(&pod.name_any(), &LogParams::default()).await?)
    }
}

fn detect_job_spec(image: &str) -> JobSpec {
    JobSpec {
        backoff_limit: Some(0),
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(selector_labels(DETECT_VERSION_JOB_NAME)),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "cmd-reporter".to_owned(),
                    image: Some(image.to_owned()),
                    command: Some(vec!["ceph".to_owned()]),
                    args: Some(vec!["--version".to_owned()]),
                    ..Default::default()
                }],
                restart_policy: Some("Never".to_owned()),
                ..Default::default()
            }),
        },
        ..Default::default()
    }
}

#[async_trait]
impl VersionDetector for JobVersionDetector {
    #[instrument(skip(self, cluster), fields(cluster = %cluster.name_any()))]
    async fn detect(&self, cluster: &CephCluster, image: &str) -> Result<CephVersion> {
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::Validation("CephCluster has no namespace".to_owned()))?;
        let orefs = cluster
            .controller_owner_ref(&())
            .map(|oref| vec![oref])
            .unwrap_or_default();

        // A finished job from an earlier image would be reported as is.
        delete_job(&self.client, &namespace, DETECT_VERSION_JOB_NAME).await?;
        apply_job(
            &self.client,
            &namespace,
            orefs,
            DETECT_VERSION_JOB_NAME,
            detect_job_spec(image),
        )
        .await?;

        self.wait_for_job(&namespace).await?;
        let output = self.job_output(&namespace).await?;
        delete_job(&self.client, &namespace, DETECT_VERSION_JOB_NAME).await?;
        let version = CephVersion::extract(&output)?;
        info!(%image, %version, "detected ceph version");
        Ok(version)
    }
}

/// Refuse versions the operator does not support, unless explicitly allowed.
pub fn check_supported(version: &CephVersion, allow_unsupported: bool) -> Result<()> {
    if version.is_supported() || allow_unsupported {
        return Ok(());
    }
    if !version.is_at_least(&MINIMUM) {
        return Err(Error::Policy(format!(
            "ceph version {version} is older than the minimum supported {MINIMUM}"
        )));
    }
    Err(Error::Policy(format!(
        "ceph version {version} is newer than the latest supported release {}, set \
         allowUnsupported to run it",
        TENTACLE.release_name()
    )))
}

/// How the desired version relates to what the cluster runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpgradeKind {
    /// No daemon runs yet.
    NewCluster,
    /// Every daemon already runs the desired version.
    NoChange,
    /// Daemons have to move to the desired version.
    Upgrade {
        /// Version of the least up to date monitor.
        from: CephVersion,
    },
}

/// Classify moving the cluster to `desired`. Downgrades are refused.
pub fn upgrade_kind(desired: &CephVersion, running: &DaemonsVersions) -> Result<UpgradeKind> {
    let all = running.all()?;
    let Some(oldest) = all.first().copied() else {
        return Ok(UpgradeKind::NewCluster);
    };
    let reference = running.least_uptodate_mon()?.unwrap_or(oldest);
    if desired.is_inferior(&reference) {
        return Err(Error::Policy(format!(
            "downgrading from {reference} to {desired} is not supported"
        )));
    }
    if all.len() == 1 && all[0].is_identical(desired) {
        return Ok(UpgradeKind::NoChange);
    }
    debug!(from = %reference, to = %desired, "upgrade required");
    Ok(UpgradeKind::Upgrade { from: reference })
}

/// Refuse to upgrade a cluster that is not healthy, unless checks are skipped.
pub fn check_upgrade_health(health: &str, skip_upgrade_checks: bool) -> Result<()> {
    if skip_upgrade_checks || health == HEALTH_OK {
        return Ok(());
    }
    Err(Error::Policy(format!(
        "refusing to upgrade, cluster health is {health}"
    )))
}

#[cfg(test)]
mod tests {
    use expect_test::expect;
    use hyper::Body;
    use k8s_openapi::api::batch::v1::JobStatus;

    use super::*;
    use crate::{
        cluster::CephClusterSpec,
        utils::test::{json_response, mock_client, status_response, timeout_after_1s, Request},
    };

    fn versions(mon: &[&str], others: &[&str]) -> DaemonsVersions {
        let line = |v: &&str| (format!("ceph version {v} (abc) squid (stable)"), 1);
        DaemonsVersions {
            mon: mon.iter().map(line).collect(),
            overall: mon.iter().chain(others).map(line).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn supported_versions() {
        assert!(check_supported(&CephVersion::new(19, 2, 3), false).is_ok());
        assert!(check_supported(&CephVersion::new(18, 2, 0), false).is_ok());
        let err = check_supported(&CephVersion::new(17, 2, 7), false).unwrap_err();
        assert!(matches!(err, Error::Policy(_)), "{err}");
        assert!(check_supported(&CephVersion::new(21, 0, 0), false).is_err());
        assert!(check_supported(&CephVersion::new(21, 0, 0), true).is_ok());
    }

    #[test]
    fn upgrade_classification() {
        let desired = CephVersion::new(19, 2, 3);
        assert_eq!(
            upgrade_kind(&desired, &DaemonsVersions::default()).unwrap(),
            UpgradeKind::NewCluster
        );
        assert_eq!(
            upgrade_kind(&desired, &versions(&["19.2.3"], &["19.2.3"])).unwrap(),
            UpgradeKind::NoChange
        );
        assert_eq!(
            upgrade_kind(&desired, &versions(&["19.2.2"], &["19.2.3"])).unwrap(),
            UpgradeKind::Upgrade {
                from: CephVersion::new(19, 2, 2)
            }
        );
        // A partially upgraded cluster.
        assert_eq!(
            upgrade_kind(&desired, &versions(&["19.2.3"], &["18.2.4"])).unwrap(),
            UpgradeKind::Upgrade {
                from: CephVersion::new(19, 2, 3)
            }
        );
        let err = upgrade_kind(&CephVersion::new(18, 2, 4), &versions(&["19.2.3"], &[]))
            .unwrap_err();
        expect![[r#"downgrading from 19.2.3-0 squid to 18.2.4-0 reef is not supported"#]]
            .assert_eq(&err.to_string());
    }

    #[test]
    fn health_gate() {
        assert!(check_upgrade_health(HEALTH_OK, false).is_ok());
        assert!(check_upgrade_health("HEALTH_WARN", true).is_ok());
        let err = check_upgrade_health("HEALTH_WARN", false).unwrap_err();
        assert!(matches!(err, Error::Policy(_)), "{err}");
    }

    #[tokio::test]
    async fn detects_version_with_job() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let job_path = "/apis/batch/v1/namespaces/rook-ceph/jobs/rook-ceph-detect-version";

            let (request, send) = handle.next_request().await.expect("delete stale job");
            assert_eq!(request.method(), http::Method::DELETE);
            assert_eq!(request.uri().path(), job_path);
            send.send_response(status_response(404, "NotFound"));

            let (request, send) = handle.next_request().await.expect("apply job");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(request.uri().path(), job_path);
            let request = Request::from_request(request).await.unwrap();
            expect![[r#"
                {
                  "apiVersion": "batch/v1",
                  "kind": "Job",
                  "metadata": {
                    "labels": {
                      "app.kubernetes.io/managed-by": "rook-ceph-operator"
                    },
                    "name": "rook-ceph-detect-version",
                    "ownerReferences": []
                  },
                  "spec": {
                    "backoffLimit": 0,
                    "template": {
                      "metadata": {
                        "labels": {
                          "app": "rook-ceph-detect-version"
                        }
                      },
                      "spec": {
                        "containers": [
                          {
                            "args": [
                              "--version"
                            ],
                            "command": [
                              "ceph"
                            ],
                            "image": "quay.io/ceph/ceph:v19.2.3",
                            "name": "cmd-reporter"
                          }
                        ],
                        "restartPolicy": "Never"
                      }
                    }
                  }
                }
            "#]]
            .assert_debug_eq(&request.body);
            send.send_response(json_response(&Job::default()));

            let (request, send) = handle.next_request().await.expect("poll job");
            assert_eq!(request.method(), http::Method::GET);
            let mut job = Job::default();
            job.status = Some(JobStatus {
                succeeded: Some(1),
                ..Default::default()
            });
            send.send_response(json_response(&job));

            let (request, send) = handle.next_request().await.expect("list pods");
            assert_eq!(request.uri().path(), "/api/v1/namespaces/rook-ceph/pods");
            let mut pod = Pod::default();
            pod.metadata.name = Some("rook-ceph-detect-version-x7k2p".to_owned());
            send.send_response(json_response(&serde_json::json!({
                "apiVersion": "v1",
                "kind": "PodList",
                "metadata": {},
                "items": [pod],
            })));

            let (request, send) = handle.next_request().await.expect("read log");
            assert_eq!(
                request.uri().path(),
                "/api/v1/namespaces/rook-ceph/pods/rook-ceph-detect-version-x7k2p/log"
            );
            send.send_response(
                http::Response::builder()
                    .body(Body::from(
                        "ceph version 19.2.3 (c92aebb279828e9c3c1f5d24613efca272649e62) squid (stable)\n",
                    ))
                    .unwrap(),
            );

            let (request, send) = handle.next_request().await.expect("delete job");
            assert_eq!(request.method(), http::Method::DELETE);
            send.send_response(json_response(&Job::default()));
        });

        let mut cluster = CephCluster::new("my-cluster", CephClusterSpec::default());
        cluster.metadata.namespace = Some("rook-ceph".to_owned());
        let version = JobVersionDetector::new(client, Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(1))
            .detect(&cluster, "quay.io/ceph/ceph:v19.2.3")
            .await
            .unwrap();
        assert_eq!(version, CephVersion::new(19, 2, 3));
        timeout_after_1s(server).await;
    }

    #[tokio::test]
    async fn failed_job_is_backend_error() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (_request, send) = handle.next_request().await.expect("job setup");
                send.send_response(json_response(&Job::default()));
            }
            let (_request, send) = handle.next_request().await.expect("poll job");
            let mut job = Job::default();
            job.status = Some(JobStatus {
                failed: Some(1),
                ..Default::default()
            });
            send.send_response(json_response(&job));
        });

        let mut cluster = CephCluster::new("my-cluster", CephClusterSpec::default());
        cluster.metadata.namespace = Some("rook-ceph".to_owned());
        let err = JobVersionDetector::new(client, Duration::from_secs(5))
            .detect(&cluster, "quay.io/ceph/ceph:v19.2.3")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend { .. }), "{err}");
        timeout_after_1s(server).await;
    }
}
