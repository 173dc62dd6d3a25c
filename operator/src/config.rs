//! Settings read from the operator ConfigMap, overridable from the environment.
use std::{collections::BTreeMap, time::Duration};

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use tracing::debug;

use crate::error::{Error, Result};

/// ConfigMap in the operator namespace holding the settings.
pub const OPERATOR_CONFIG_MAP_NAME: &str = "rook-ceph-operator-config";

const COMMANDS_TIMEOUT_KEY: &str = "ROOK_CEPH_COMMANDS_TIMEOUT_SECONDS";
const DETECT_VERSION_TIMEOUT_KEY: &str = "ROOK_DETECT_VERSION_TIMEOUT_SECONDS";
const RESYNC_PERIOD_KEY: &str = "ROOK_RECONCILE_RESYNC_SECONDS";
const CSI_KUBELET_DIR_KEY: &str = "ROOK_CSI_KUBELET_DIR_PATH";

/// Operator wide settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Timeout of every ceph and rbd command.
    pub commands_timeout: Duration,
    /// How long the version detection job may run.
    pub detect_version_timeout: Duration,
    /// How often an unchanged cluster is orchestrated again.
    pub resync_period: Duration,
    /// Kubelet directory used by CSI drivers.
    pub csi_kubelet_dir_path: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            commands_timeout: Duration::from_secs(15),
            detect_version_timeout: Duration::from_secs(15 * 60),
            resync_period: Duration::from_secs(10 * 60),
            csi_kubelet_dir_path: None,
        }
    }
}

impl OperatorConfig {
    /// Resolve every key from `env`, then `data`, then the default.
    pub fn resolve(
        data: &BTreeMap<String, String>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let lookup = |key: &str| {
            env(key)
                .or_else(|| data.get(key).cloned())
                .filter(|value| !value.trim().is_empty())
        };
        let seconds = |key: &str, default: Duration| -> Result<Duration> {
            match lookup(key) {
                Some(value) => value
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|err| Error::Validation(format!("{key}={value:?}: {err}"))),
                None => Ok(default),
            }
        };
        let defaults = Self::default();
        Ok(Self {
            commands_timeout: seconds(COMMANDS_TIMEOUT_KEY, defaults.commands_timeout)?,
            detect_version_timeout: seconds(
                DETECT_VERSION_TIMEOUT_KEY,
                defaults.detect_version_timeout,
            )?,
            resync_period: seconds(RESYNC_PERIOD_KEY, defaults.resync_period)?,
            csi_kubelet_dir_path: lookup(CSI_KUBELET_DIR_KEY),
        })
    }

    /// Load the settings of the operator running in `namespace`. A missing ConfigMap means
    /// defaults.
    pub async fn load(client: Client, namespace: &str) -> Result<Self> {
        let config_maps: Api<ConfigMap> = Api::namespaced(client, namespace);
        let data = config_maps
            .get_opt(OPERATOR_CONFIG_MAP_NAME)
            .await?
            .and_then(|cm| cm.data)
            .unwrap_or_default();
        let config = Self::resolve(&data, |key| std::env::var(key).ok())?;
        debug!(?config, "loaded operator config");
        Ok(config)
    }
}
