//! Paths used by the kubelet and the driver.
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Pod UID and persistent volume name encoded in a mount dir of the form
/// `<root>/pods/<podID>/volumes/<vendor~driver>/<pvName>`.
pub fn pod_and_pv_from_mount_dir(mount_dir: &str) -> Result<(String, String)> {
    let segments: Vec<&str> = mount_dir.trim_end_matches('/').split('/').collect();
    if segments.len() < 5 {
        return Err(Error::Validation(format!(
            "failed to parse mount dir {mount_dir:?}, expected <root>/pods/<podID>/volumes/<driver>/<pvName>"
        )));
    }
    let pod_id = segments[segments.len() - 4];
    let pv_name = segments[segments.len() - 1];
    if pod_id.is_empty() || pv_name.is_empty() {
        return Err(Error::Validation(format!(
            "failed to parse mount dir {mount_dir:?}, empty pod id or volume name"
        )));
    }
    Ok((pod_id.to_owned(), pv_name.to_owned()))
}

/// Vendor and driver from the `vendor~driver` segment of `driver_dir` nearest its end.
///
/// Segments are scanned from the end, so a matching parent directory never shadows the driver
/// directory itself.
pub fn vendor_and_driver(driver_dir: &str) -> Result<(String, String)> {
    for segment in driver_dir.rsplit('/') {
        let Some((vendor, driver)) = segment.split_once('~') else {
            continue;
        };
        if driver.contains('~') {
            return Err(Error::Validation(format!(
                "invalid flex driver directory segment {segment:?}, expected vendor~driver"
            )));
        }
        if vendor.is_empty() || driver.is_empty() {
            continue;
        }
        return Ok((vendor.to_owned(), driver.to_owned()));
    }
    Err(Error::Validation(format!(
        "no vendor~driver segment in flex driver directory {driver_dir:?}"
    )))
}

/// `<kubeletRoot>/plugins/<vendor>/<driver>/mounts/<volumeName>`
pub fn global_mount_path(kubelet_root: &Path, vendor: &str, driver: &str, volume: &str) -> PathBuf {
    kubelet_root
        .join("plugins")
        .join(vendor)
        .join(driver)
        .join("mounts")
        .join(volume)
}

/// Directory the driver named `driver` is installed in.
pub fn driver_dir(flexvolume_dir: &Path, vendor: &str, driver: &str) -> PathBuf {
    flexvolume_dir.join(format!("{vendor}~{driver}"))
}
