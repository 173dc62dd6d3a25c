//! Checks a CephCluster spec before anything is orchestrated.
use tracing::warn;

use crate::{
    cluster::{CephClusterSpec, StretchClusterSpec},
    error::{Error, Result},
};

/// Monitors run when the spec asks for none.
pub const DEFAULT_MON_COUNT: i32 = 3;
/// Most monitors a cluster may run.
pub const MAX_MON_COUNT: i32 = 9;
/// Host paths daemons would clobber or that belong to the host's own ceph install.
pub const FORBIDDEN_DATA_DIR_HOST_PATHS: &[&str] = &["/etc/ceph", "/rook", "/var/log/ceph"];

/// Settings derived from a valid spec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedSpec {
    /// Monitors to run after defaulting and clamping.
    pub mon_count: i32,
}

/// Validate `spec`, returning the effective settings.
pub fn validate(spec: &CephClusterSpec) -> Result<ValidatedSpec> {
    if !spec.external.enable {
        validate_data_dir(spec)?;
    }
    if let Some(stretch) = &spec.mon.stretch_cluster {
        validate_stretch(stretch)?;
    }
    Ok(ValidatedSpec {
        mon_count: mon_count(spec.mon.count)?,
    })
}

fn validate_data_dir(spec: &CephClusterSpec) -> Result<()> {
    let path = spec.data_dir_host_path.trim_end_matches('/');
    if spec.data_dir_host_path.is_empty() {
        if !spec.ceph_version.image.is_empty() {
            return Err(Error::Validation(
                "dataDirHostPath is required when an image is given".to_owned(),
            ));
        }
        return Ok(());
    }
    if FORBIDDEN_DATA_DIR_HOST_PATHS.contains(&path) {
        return Err(Error::Validation(format!(
            "dataDirHostPath {} is reserved, choose another path",
            spec.data_dir_host_path
        )));
    }
    Ok(())
}

fn validate_stretch(stretch: &StretchClusterSpec) -> Result<()> {
    if stretch.zones.iter().any(|zone| zone.name.is_empty()) {
        return Err(Error::Validation(
            "stretch cluster zones must be named".to_owned(),
        ));
    }
    let arbiters = stretch.zones.iter().filter(|zone| zone.arbiter).count();
    if arbiters != 1 {
        return Err(Error::Validation(format!(
            "stretch cluster requires exactly one arbiter zone, found {arbiters}"
        )));
    }
    if stretch.zones.len() < 3 {
        return Err(Error::Validation(format!(
            "stretch cluster requires at least three zones, found {}",
            stretch.zones.len()
        )));
    }
    Ok(())
}

/// Apply the default and the upper bound to the requested monitor count.
pub fn mon_count(requested: i32) -> Result<i32> {
    let count = match requested {
        n if n < 0 => {
            return Err(Error::Validation(format!(
                "mon count {n} must not be negative"
            )))
        }
        0 => DEFAULT_MON_COUNT,
        n if n > MAX_MON_COUNT => {
            warn!(
                requested = n,
                max = MAX_MON_COUNT,
                "mon count too high, running the maximum instead"
            );
            MAX_MON_COUNT
        }
        n => n,
    };
    if count % 2 == 0 {
        warn!(count, "an even number of mons does not improve availability, use an odd count");
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{CephVersionSpec, MonSpec, StretchClusterZone};

    fn spec() -> CephClusterSpec {
        CephClusterSpec {
            ceph_version: CephVersionSpec {
                image: "quay.io/ceph/ceph:v19.2.3".to_owned(),
                allow_unsupported: false,
            },
            data_dir_host_path: "/var/lib/rook".to_owned(),
            ..Default::default()
        }
    }

    fn zone(name: &str, arbiter: bool) -> StretchClusterZone {
        StretchClusterZone {
            name: name.to_owned(),
            arbiter,
        }
    }

    #[test]
    fn mon_counts() {
        assert_eq!(mon_count(0).unwrap(), 3);
        assert_eq!(mon_count(1).unwrap(), 1);
        assert_eq!(mon_count(4).unwrap(), 4);
        assert_eq!(mon_count(12).unwrap(), MAX_MON_COUNT);
        assert!(matches!(mon_count(-1), Err(Error::Validation(_))));
    }

    #[test]
    fn data_dir_host_path() {
        assert_eq!(validate(&spec()).unwrap().mon_count, 3);

        let mut missing = spec();
        missing.data_dir_host_path.clear();
        assert!(validate(&missing).is_err());

        // External clusters and clusters without an image do not need one.
        missing.external.enable = true;
        assert!(validate(&missing).is_ok());
        missing.external.enable = false;
        missing.ceph_version.image.clear();
        assert!(validate(&missing).is_ok());

        for path in ["/etc/ceph", "/rook/", "/var/log/ceph"] {
            let mut reserved = spec();
            reserved.data_dir_host_path = path.to_owned();
            assert!(validate(&reserved).is_err(), "{path}");
        }
    }

    #[test]
    fn stretch_topology() {
        let mut spec = spec();
        spec.mon = MonSpec {
            count: 5,
            stretch_cluster: Some(StretchClusterSpec {
                failure_domain_label: None,
                zones: vec![zone("a", true), zone("b", false), zone("c", false)],
            }),
            ..Default::default()
        };
        assert_eq!(validate(&spec).unwrap().mon_count, 5);

        let stretch = spec.mon.stretch_cluster.as_mut().unwrap();
        stretch.zones[1].arbiter = true;
        let err = validate(&spec).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid: stretch cluster requires exactly one arbiter zone, found 2"
        );

        let stretch = spec.mon.stretch_cluster.as_mut().unwrap();
        stretch.zones = vec![zone("a", true), zone("b", false)];
        assert!(validate(&spec).is_err());

        let stretch = spec.mon.stretch_cluster.as_mut().unwrap();
        stretch.zones = vec![zone("a", true), zone("", false), zone("c", false)];
        assert!(validate(&spec).is_err());
    }
}
