//! Utils is shared functions and constants for the operator and the agent
pub mod exec;

use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    os::unix::fs::PermissionsExt,
    path::Path,
    time::Duration,
};

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStatus},
        batch::v1::{Job, JobSpec, JobStatus},
        core::v1::{ConfigMap, Service, ServiceSpec},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{
    api::{DeleteParams, Patch, PatchParams, PropagationPolicy},
    client::Client,
    core::ObjectMeta,
    Api,
};
use tracing::debug;

use crate::{
    error::{Error, Result},
    labels::{managed_labels, managed_labels_extend},
    CONTROLLER_NAME,
};

/// Apply a Service with extra labels
pub async fn apply_service(
    client: &Client,
    ns: &str,
    orefs: Vec<OwnerReference>,
    name: &str,
    spec: ServiceSpec,
    labels: Option<BTreeMap<String, String>>,
) -> Result<Service, kube::Error> {
    let serverside = PatchParams::apply(CONTROLLER_NAME);
    let services: Api<Service> = Api::namespaced(client.clone(), ns);

    // Server-side apply service
    let service: Service = Service {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            owner_references: Some(orefs),
            labels: managed_labels_extend(labels),
            ..ObjectMeta::default()
        },
        spec: Some(spec),
        ..Default::default()
    };
    services
        .patch(name, &serverside, &Patch::Apply(service))
        .await
}

/// Apply a deployment in namespace with extra labels
pub async fn apply_deployment(
    client: &Client,
    ns: &str,
    orefs: Vec<OwnerReference>,
    name: &str,
    spec: DeploymentSpec,
    labels: Option<BTreeMap<String, String>>,
) -> Result<Option<DeploymentStatus>, kube::Error> {
    let serverside = PatchParams::apply(CONTROLLER_NAME);
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), ns);

    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            owner_references: Some(orefs),
            labels: managed_labels_extend(labels),
            ..ObjectMeta::default()
        },
        spec: Some(spec),
        ..Default::default()
    };
    let deployment = deployments
        .patch(name, &serverside, &Patch::Apply(deployment))
        .await?;
    Ok(deployment.status)
}

/// Apply a Job
pub async fn apply_job(
    client: &Client,
    ns: &str,
    orefs: Vec<OwnerReference>,
    name: &str,
    spec: JobSpec,
) -> Result<Option<JobStatus>, kube::Error> {
    let serverside = PatchParams::apply(CONTROLLER_NAME);
    let jobs: Api<Job> = Api::namespaced(client.clone(), ns);

    // Server-side apply job
    let job: Job = Job {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            owner_references: Some(orefs),
            labels: managed_labels(),
            ..ObjectMeta::default()
        },
        spec: Some(spec),
        ..Default::default()
    };
    let job = jobs.patch(name, &serverside, &Patch::Apply(job)).await?;
    Ok(job.status)
}

/// Delete a job and its pods
pub async fn delete_job(client: &Client, ns: &str, name: &str) -> Result<(), kube::Error> {
    let jobs: Api<Job> = Api::namespaced(client.clone(), ns);
    let params = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    };
    match jobs.delete(name, &params).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
        Err(e) => Err(e),
    }
}

/// Apply a config map
pub async fn apply_config_map(
    client: &Client,
    ns: &str,
    orefs: Vec<OwnerReference>,
    name: &str,
    data: BTreeMap<String, String>,
) -> Result<(), kube::Error> {
    let serverside = PatchParams::apply(CONTROLLER_NAME);
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), ns);
    // Apply config map
    let map_data = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            owner_references: Some(orefs),
            labels: managed_labels(),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..Default::default()
    };
    config_maps
        .patch(name, &serverside, &Patch::Apply(map_data))
        .await?;
    Ok(())
}

/// Write a file so that readers only ever observe the old or the new content.
///
/// The content goes to a dot prefixed sibling first and is renamed over `path` once synced.
pub fn write_file_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Validation(format!("{} has no parent directory", path.display())))?;
    let name = path
        .file_name()
        .ok_or_else(|| Error::Validation(format!("{} has no file name", path.display())))?;
    fs::create_dir_all(dir).map_err(anyhow::Error::from)?;

    let tmp = dir.join(format!(".{}", name.to_string_lossy()));
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.set_permissions(fs::Permissions::from_mode(mode))?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|err| {
        let _ = fs::remove_file(&tmp);
        anyhow::anyhow!("failed to write {}: {err}", path.display())
    })?;
    debug!(path = %path.display(), "wrote file");
    Ok(())
}

/// Run `op` until it succeeds, fails with a non conflict error, or `attempts` are used up.
pub async fn retry_on_conflict<T, F, Fut>(attempts: usize, interval: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_conflict() && attempt < attempts => {
                debug!(attempt, %err, "retrying after conflict");
                attempt += 1;
                tokio::time::sleep(interval).await;
            }
            res => return res,
        }
    }
}
