//! Administrative commands issued to a running cluster.
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::{
    ceph::{info::ClusterInfo, version::CephVersion},
    error::{Error, Result},
    utils::exec::CommandExecutor,
};

/// Who a command runs as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandIdentity {
    /// Entity name, e.g. client.admin
    pub username: String,
    /// Keyring holding the entity's key
    pub keyring: PathBuf,
}

/// One entry of `ceph auth ls`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct AuthEntry {
    /// Entity name
    pub entity: String,
    /// Cephx key
    #[serde(default)]
    pub key: String,
    /// Capabilities by subsystem
    #[serde(default)]
    pub caps: BTreeMap<String, String>,
}

/// Output of `ceph auth ls`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct AuthList {
    /// Every authenticated entity
    #[serde(default)]
    pub auth_dump: Vec<AuthEntry>,
}

impl AuthList {
    /// Whether `entity` is known to the cluster.
    pub fn contains(&self, entity: &str) -> bool {
        self.auth_dump.iter().any(|entry| entry.entity == entity)
    }
}

/// Output of `ceph versions`: daemon count by version string per daemon type.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct DaemonsVersions {
    /// Monitors
    #[serde(default)]
    pub mon: BTreeMap<String, u32>,
    /// Managers
    #[serde(default)]
    pub mgr: BTreeMap<String, u32>,
    /// OSDs
    #[serde(default)]
    pub osd: BTreeMap<String, u32>,
    /// Every daemon
    #[serde(default)]
    pub overall: BTreeMap<String, u32>,
}

impl DaemonsVersions {
    /// Distinct versions running in the cluster.
    pub fn all(&self) -> Result<Vec<CephVersion>> {
        let mut versions = self
            .overall
            .keys()
            .map(|key| CephVersion::extract(key))
            .collect::<Result<Vec<_>>>()?;
        versions.sort();
        versions.dedup();
        Ok(versions)
    }

    /// Oldest version any monitor runs.
    pub fn least_uptodate_mon(&self) -> Result<Option<CephVersion>> {
        Ok(self
            .mon
            .keys()
            .map(|key| CephVersion::extract(key))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .min())
    }
}

/// Define the behavior we consume from a running cluster.
#[async_trait]
pub trait CephClient: Send + Sync {
    /// `ceph auth ls`
    async fn auth_list(&self, cluster: &ClusterInfo, id: &CommandIdentity) -> Result<AuthList>;
    /// `ceph auth get-or-create-key`, returning the key.
    async fn auth_get_or_create_key(
        &self,
        cluster: &ClusterInfo,
        id: &CommandIdentity,
        entity: &str,
        caps: &[&str],
    ) -> Result<String>;
    /// `ceph auth rotate`, returning the new key.
    async fn auth_rotate(
        &self,
        cluster: &ClusterInfo,
        id: &CommandIdentity,
        entity: &str,
    ) -> Result<String>;
    /// `ceph auth del`. Deleting an unknown entity succeeds.
    async fn auth_delete(&self, cluster: &ClusterInfo, id: &CommandIdentity, entity: &str)
        -> Result<()>;
    /// `ceph versions`
    async fn versions(&self, cluster: &ClusterInfo, id: &CommandIdentity)
        -> Result<DaemonsVersions>;
    /// `ceph health`, returning the status string such as HEALTH_OK.
    async fn health(&self, cluster: &ClusterInfo, id: &CommandIdentity) -> Result<String>;
}

/// Runs commands through the `ceph` CLI.
pub struct CephCli<E> {
    executor: E,
    config_dir: PathBuf,
    timeout: Duration,
}

impl<E: CommandExecutor> CephCli<E> {
    /// Create a client writing and reading config below `config_dir`.
    pub fn new(executor: E, config_dir: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            executor,
            config_dir: config_dir.as_ref().to_owned(),
            timeout,
        }
    }

    fn args(&self, cluster: &ClusterInfo, id: &CommandIdentity, command: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = command.iter().map(|arg| (*arg).to_owned()).collect();
        args.extend([
            format!("--connect-timeout={}", self.timeout.as_secs()),
            format!("--cluster={}", cluster.namespace),
            format!("--conf={}", cluster.config_path(&self.config_dir).display()),
            format!("--name={}", id.username),
            format!("--keyring={}", id.keyring.display()),
            "--format=json".to_owned(),
        ]);
        args
    }

    async fn run(
        &self,
        cluster: &ClusterInfo,
        id: &CommandIdentity,
        command: &[&str],
    ) -> Result<String> {
        let args = self.args(cluster, id, command);
        debug!(namespace = %cluster.namespace, user = %id.username, ?command, "running ceph command");
        self.executor
            .execute("ceph", &args, self.timeout)
            .await
            .map_err(Error::backend)
    }
}

fn parse<'a, T: Deserialize<'a>>(command: &str, output: &'a str) -> Result<T> {
    serde_json::from_str(output).map_err(|err| {
        Error::backend(anyhow::anyhow!(
            "failed to parse output of ceph {command}: {err}"
        ))
    })
}

#[async_trait]
impl<E: CommandExecutor> CephClient for CephCli<E> {
    #[instrument(skip_all, fields(namespace = %cluster.namespace, user = %id.username))]
    async fn auth_list(&self, cluster: &ClusterInfo, id: &CommandIdentity) -> Result<AuthList> {
        let out = self.run(cluster, id, &["auth", "ls"]).await?;
        parse("auth ls", &out)
    }

    #[instrument(skip_all, fields(namespace = %cluster.namespace, entity = %entity))]
    async fn auth_get_or_create_key(
        &self,
        cluster: &ClusterInfo,
        id: &CommandIdentity,
        entity: &str,
        caps: &[&str],
    ) -> Result<String> {
        #[derive(Deserialize)]
        struct Key {
            key: String,
        }
        let mut command = vec!["auth", "get-or-create-key", entity];
        command.extend_from_slice(caps);
        let out = self.run(cluster, id, &command).await?;
        Ok(parse::<Key>("auth get-or-create-key", &out)?.key)
    }

    #[instrument(skip_all, fields(namespace = %cluster.namespace, entity = %entity))]
    async fn auth_rotate(
        &self,
        cluster: &ClusterInfo,
        id: &CommandIdentity,
        entity: &str,
    ) -> Result<String> {
        let out = self.run(cluster, id, &["auth", "rotate", entity]).await?;
        // Reported as a one element list by current releases.
        let entry = match parse::<Vec<AuthEntry>>("auth rotate", &out) {
            Ok(mut entries) if !entries.is_empty() => entries.swap_remove(0),
            _ => parse::<AuthEntry>("auth rotate", &out)?,
        };
        if entry.key.is_empty() {
            return Err(Error::backend(anyhow::anyhow!(
                "ceph auth rotate returned no key for {entity}"
            )));
        }
        Ok(entry.key)
    }

    #[instrument(skip_all, fields(namespace = %cluster.namespace, entity = %entity))]
    async fn auth_delete(
        &self,
        cluster: &ClusterInfo,
        id: &CommandIdentity,
        entity: &str,
    ) -> Result<()> {
        match self.run(cluster, id, &["auth", "del", entity]).await {
            Err(Error::Backend { source }) if source.to_string().contains("does not exist") => {
                Ok(())
            }
            res => res.map(|_| ()),
        }
    }

    async fn versions(
        &self,
        cluster: &ClusterInfo,
        id: &CommandIdentity,
    ) -> Result<DaemonsVersions> {
        let out = self.run(cluster, id, &["versions"]).await?;
        parse("versions", &out)
    }

    async fn health(&self, cluster: &ClusterInfo, id: &CommandIdentity) -> Result<String> {
        #[derive(Deserialize)]
        struct Health {
            status: String,
        }
        let out = self.run(cluster, id, &["health"]).await?;
        Ok(parse::<Health>("health", &out)?.status)
    }
}
