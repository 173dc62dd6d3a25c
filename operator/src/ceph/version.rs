//! Ceph release versions and their ordering.
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Version of a Ceph release, e.g. `ceph version 19.2.3-0`.
///
/// Ordering compares all four components, build included.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CephVersion {
    /// Major release, 19 is squid
    pub major: u32,
    /// Minor release
    pub minor: u32,
    /// Point release
    pub extra: u32,
    /// Downstream build number, zero when absent
    pub build: u32,
}

/// Reef, the oldest release the operator can run.
pub const REEF: CephVersion = CephVersion::new(18, 0, 0);
/// Squid
pub const SQUID: CephVersion = CephVersion::new(19, 0, 0);
/// Tentacle
pub const TENTACLE: CephVersion = CephVersion::new(20, 0, 0);
/// Minimum version the operator will deploy.
pub const MINIMUM: CephVersion = CephVersion::new(18, 2, 0);
/// First release able to rotate the admin key with `ceph auth rotate`.
pub const CEPHX_KEY_ROTATION: CephVersion = CephVersion::new(20, 2, 0);

static VERSION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"ceph version (\d+)\.(\d+)\.(\d+)(?:-(\d+))?").expect("valid version pattern")
});
static STATUS_VERSION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\.(\d+)\.(\d+)-(\d+)$").expect("valid status pattern"));

fn number(captures: &regex::Captures, idx: usize, text: &str) -> Result<u32> {
    match captures.get(idx) {
        Some(m) => m
            .as_str()
            .parse()
            .map_err(|_| Error::Validation(format!("version component too large in {text:?}"))),
        None => Ok(0),
    }
}

impl CephVersion {
    /// Version with build zero.
    pub const fn new(major: u32, minor: u32, extra: u32) -> Self {
        Self {
            major,
            minor,
            extra,
            build: 0,
        }
    }

    /// Extract the version from the output of `ceph --version` or a `ceph versions` key.
    pub fn extract(text: &str) -> Result<Self> {
        let captures = VERSION_PATTERN
            .captures(text)
            .ok_or_else(|| Error::Validation(format!("failed to parse version from {text:?}")))?;
        Ok(Self {
            major: number(&captures, 1, text)?,
            minor: number(&captures, 2, text)?,
            extra: number(&captures, 3, text)?,
            build: number(&captures, 4, text)?,
        })
    }

    /// Parse the `major.minor.extra-build` form recorded in the cephx status.
    pub fn parse_status(text: &str) -> Result<Self> {
        let captures = STATUS_VERSION_PATTERN.captures(text).ok_or_else(|| {
            Error::Validation(format!(
                "failed to parse cephx key version {text:?}, expected major.minor.extra-build"
            ))
        })?;
        Ok(Self {
            major: number(&captures, 1, text)?,
            minor: number(&captures, 2, text)?,
            extra: number(&captures, 3, text)?,
            build: number(&captures, 4, text)?,
        })
    }

    /// The `major.minor.extra-build` form recorded in the cephx status.
    pub fn status_string(&self) -> String {
        format!(
            "{}.{}.{}-{}",
            self.major, self.minor, self.extra, self.build
        )
    }

    /// Release code name.
    pub fn release_name(&self) -> &'static str {
        match self.major {
            18 => "reef",
            19 => "squid",
            20 => "tentacle",
            _ => "unknown",
        }
    }

    /// Whether the version is detected at all. Unknown versions have major zero.
    pub fn is_known(&self) -> bool {
        self.major != 0
    }

    /// True if this version is the same as or newer than `other`, ignoring the build number.
    pub fn is_at_least(&self, other: &CephVersion) -> bool {
        (self.major, self.minor, self.extra) >= (other.major, other.minor, other.extra)
    }

    /// True if all components including the build match.
    pub fn is_identical(&self, other: &CephVersion) -> bool {
        self == other
    }

    /// True if this version is strictly newer than `other`.
    pub fn is_superior(&self, other: &CephVersion) -> bool {
        self > other
    }

    /// True if this version is strictly older than `other`.
    pub fn is_inferior(&self, other: &CephVersion) -> bool {
        self < other
    }

    /// Whether the release is one the operator is tested against.
    pub fn is_supported(&self) -> bool {
        self.is_at_least(&MINIMUM) && self.major <= TENTACLE.major
    }

    /// Whether the cluster can run `ceph auth rotate`.
    pub fn supports_cephx_key_rotation(&self) -> bool {
        self.is_at_least(&CEPHX_KEY_ROTATION)
    }
}

impl fmt::Display for CephVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status_string(), self.release_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_version_output() {
        let v = CephVersion::extract(
            "ceph version 19.2.3 (c92aebb279828e9c3c1f5d24613efca272649e62) squid (stable)",
        )
        .unwrap();
        assert_eq!(v, CephVersion::new(19, 2, 3));

        let v = CephVersion::extract("ceph version 20.3.0-1254 (abc) tentacle (dev)").unwrap();
        assert_eq!(
            v,
            CephVersion {
                major: 20,
                minor: 3,
                extra: 0,
                build: 1254
            }
        );
        assert!(CephVersion::extract("ceph version blah").is_err());
    }

    #[test]
    fn status_string_round_trips() {
        let v = CephVersion::parse_status("19.2.3-0").unwrap();
        assert_eq!(v, CephVersion::new(19, 2, 3));
        assert_eq!(v.status_string(), "19.2.3-0");
        assert!(CephVersion::parse_status("19.2.3").is_err());
        assert!(CephVersion::parse_status("Uninitialized").is_err());
    }

    #[test]
    fn comparisons() {
        let base = CephVersion::new(19, 2, 3);
        let build = CephVersion { build: 4, ..base };
        assert!(base.is_at_least(&build));
        assert!(build.is_superior(&base));
        assert!(base.is_inferior(&build));
        assert!(!base.is_identical(&build));
        assert!(CephVersion::new(20, 0, 0).is_superior(&CephVersion::new(19, 9, 9)));
    }

    #[test]
    fn support_windows() {
        assert!(!CephVersion::new(17, 2, 7).is_supported());
        assert!(!CephVersion::new(18, 1, 0).is_supported());
        assert!(CephVersion::new(18, 2, 0).is_supported());
        assert!(CephVersion::new(20, 3, 0).is_supported());
        assert!(!CephVersion::new(21, 0, 0).is_supported());
        assert!(!CephVersion::new(19, 2, 4).supports_cephx_key_rotation());
        assert!(CephVersion::new(20, 2, 0).supports_cephx_key_rotation());
    }

    #[test]
    fn display() {
        assert_eq!(CephVersion::new(19, 2, 3).to_string(), "19.2.3-0 squid");
    }
}
