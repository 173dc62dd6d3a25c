//! Cluster identity and the on-disk connection config derived from it.
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use k8s_openapi::ByteString;
use rand::RngCore;

use crate::{
    ceph::{
        client::CommandIdentity,
        keyring::{admin_keyring, gen_keyring, generate_cephx_key, ADMIN_USERNAME},
        version::CephVersion,
    },
    error::{Error, Result},
    utils::write_file_atomic,
};

/// Secret holding the cluster identity.
pub const MON_SECRET_NAME: &str = "rook-ceph-mon";
/// ConfigMap holding the monitor endpoints.
pub const MON_ENDPOINTS_CONFIG_MAP_NAME: &str = "rook-ceph-mon-endpoints";
/// Key of the endpoint list in the monitor endpoints ConfigMap.
pub const MON_ENDPOINTS_KEY: &str = "data";

const FSID_KEY: &str = "fsid";
const MON_SECRET_KEY: &str = "mon-secret";
const USERNAME_KEY: &str = "ceph-username";
const SECRET_KEY: &str = "ceph-secret";
const LEGACY_ADMIN_SECRET_KEY: &str = "admin-secret";

/// Credential used to run administrative commands.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CephCred {
    /// Entity name, e.g. client.admin
    pub username: String,
    /// Cephx key
    pub secret: String,
}

/// A monitor and the address clients reach it on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MonInfo {
    /// Monitor id, a letter for operator run clusters
    pub name: String,
    /// ip:port
    pub endpoint: String,
}

/// Identity of a cluster and how to reach it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterInfo {
    /// Namespace of the CephCluster
    pub namespace: String,
    /// Name of the CephCluster
    pub name: String,
    /// Cluster fsid
    pub fsid: String,
    /// Key shared by the monitors
    pub monitor_secret: String,
    /// Administrative credential
    pub ceph_cred: CephCred,
    /// Monitors by name
    pub monitors: BTreeMap<String, MonInfo>,
    /// Version the cluster runs, unknown until detected
    pub ceph_version: CephVersion,
    /// Use this keyring instead of the generated one, for external clusters
    pub keyring_file_override: Option<PathBuf>,
}

impl ClusterInfo {
    /// Create the identity of a new cluster with fresh keys.
    pub fn generate(namespace: &str, name: &str, rng: &mut impl RngCore) -> Self {
        Self {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            fsid: uuid::Uuid::new_v4().to_string(),
            monitor_secret: generate_cephx_key(rng),
            ceph_cred: CephCred {
                username: ADMIN_USERNAME.to_owned(),
                secret: generate_cephx_key(rng),
            },
            ..Default::default()
        }
    }

    /// Rebuild the identity from the persisted secret data and monitor endpoint list.
    pub fn from_secret_data(
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, ByteString>,
        endpoints: Option<&str>,
    ) -> Result<Self> {
        let get = |key: &str| -> Option<String> {
            data.get(key)
                .map(|value| String::from_utf8_lossy(&value.0).into_owned())
                .filter(|value| !value.is_empty())
        };
        let missing = |key: &str| {
            Error::Validation(format!(
                "secret {MON_SECRET_NAME} in namespace {namespace} is missing {key}"
            ))
        };

        let fsid = get(FSID_KEY).ok_or_else(|| missing(FSID_KEY))?;
        let monitor_secret = get(MON_SECRET_KEY).ok_or_else(|| missing(MON_SECRET_KEY))?;
        let username = get(USERNAME_KEY).unwrap_or_else(|| ADMIN_USERNAME.to_owned());
        let secret = get(SECRET_KEY)
            .or_else(|| get(LEGACY_ADMIN_SECRET_KEY))
            .ok_or_else(|| missing(SECRET_KEY))?;

        Ok(Self {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            fsid,
            monitor_secret,
            ceph_cred: CephCred { username, secret },
            monitors: endpoints.map(parse_mon_endpoints).unwrap_or_default(),
            ..Default::default()
        })
    }

    /// Data for the persisted cluster access secret.
    pub fn secret_data(&self) -> BTreeMap<String, String> {
        BTreeMap::from_iter(vec![
            (FSID_KEY.to_owned(), self.fsid.clone()),
            (MON_SECRET_KEY.to_owned(), self.monitor_secret.clone()),
            (USERNAME_KEY.to_owned(), self.ceph_cred.username.clone()),
            (SECRET_KEY.to_owned(), self.ceph_cred.secret.clone()),
        ])
    }

    /// Monitor endpoints ordered by monitor name.
    pub fn monitor_endpoints(&self) -> Vec<String> {
        self.monitors
            .values()
            .map(|mon| mon.endpoint.clone())
            .collect()
    }

    /// Directory holding this cluster's config under `config_dir`.
    pub fn config_dir(&self, config_dir: &Path) -> PathBuf {
        config_dir.join(&self.namespace)
    }

    /// Path of the generated ceph.conf.
    pub fn config_path(&self, config_dir: &Path) -> PathBuf {
        self.config_dir(config_dir).join("ceph.conf")
    }

    /// Path of the keyring for the administrative credential.
    pub fn keyring_path(&self, config_dir: &Path) -> PathBuf {
        match &self.keyring_file_override {
            Some(path) => path.clone(),
            None => self
                .config_dir(config_dir)
                .join(format!("{}.keyring", self.ceph_cred.username)),
        }
    }

    /// Identity for commands run with the administrative credential.
    pub fn admin_identity(&self, config_dir: &Path) -> CommandIdentity {
        CommandIdentity {
            username: self.ceph_cred.username.clone(),
            keyring: self.keyring_path(config_dir),
        }
    }
}

/// Parse `a=10.0.0.1:6789,b=10.0.0.2:6789`.
pub fn parse_mon_endpoints(data: &str) -> BTreeMap<String, MonInfo> {
    data.split(',')
        .filter_map(|entry| entry.trim().split_once('='))
        .filter(|(name, endpoint)| !name.is_empty() && !endpoint.is_empty())
        .map(|(name, endpoint)| {
            (
                name.to_owned(),
                MonInfo {
                    name: name.to_owned(),
                    endpoint: endpoint.to_owned(),
                },
            )
        })
        .collect()
}

/// Inverse of [`parse_mon_endpoints`].
pub fn format_mon_endpoints(monitors: &BTreeMap<String, MonInfo>) -> String {
    monitors
        .values()
        .map(|mon| format!("{}={}", mon.name, mon.endpoint))
        .collect::<Vec<_>>()
        .join(",")
}

/// Render the ceph.conf clients use to reach the cluster.
pub fn render_ceph_conf(info: &ClusterInfo, keyring: &Path) -> String {
    let members = info.monitors.keys().cloned().collect::<Vec<_>>().join(" ");
    let hosts = info.monitor_endpoints().join(",");
    format!(
        "[global]\n\
         fsid = {}\n\
         mon initial members = {members}\n\
         mon host = {hosts}\n\
         \n\
         [{}]\n\
         keyring = {}\n",
        info.fsid,
        info.ceph_cred.username,
        keyring.display()
    )
}

/// Write ceph.conf and the admin keyring for `info` below `config_dir`.
pub fn write_connection_config(config_dir: &Path, info: &ClusterInfo) -> Result<()> {
    let keyring_path = info.keyring_path(config_dir);
    if info.keyring_file_override.is_none() {
        let keyring = if info.ceph_cred.username == ADMIN_USERNAME {
            admin_keyring(&info.ceph_cred.secret)?
        } else {
            gen_keyring(&info.ceph_cred.username, &info.ceph_cred.secret, &[])?
        };
        write_file_atomic(&keyring_path, keyring.as_bytes(), 0o600)?;
    }
    write_file_atomic(
        &info.config_path(config_dir),
        render_ceph_conf(info, &keyring_path).as_bytes(),
        0o644,
    )
}
