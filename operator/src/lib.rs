//! Provides API for the operator, the node agent and the flexvolume driver.
#![warn(missing_docs)]

/// Agent module running the per node volume coordinator.
#[cfg(feature = "controller")]
pub mod agent;
/// Ceph module for talking to a running cluster.
#[cfg(feature = "controller")]
pub mod ceph;
/// Cluster module for managing Ceph clusters.
pub mod cluster;
/// Config module for operator wide settings.
#[cfg(feature = "controller")]
pub mod config;
/// Error module shared by every component.
#[cfg(feature = "controller")]
pub mod error;
/// Flexvolume module for attaching volumes into pods.
#[cfg(feature = "controller")]
pub mod flexvolume;
/// Labels module for managing resource labels.
#[cfg(feature = "controller")]
pub(crate) mod labels;
/// Utils module for shared utility functions.
#[cfg(feature = "controller")]
pub mod utils;
/// Volume module for recording volume attachments.
pub mod volume;

#[cfg(feature = "controller")]
pub use error::{Error, Result};

/// A list of constants used in various K8s resources
#[cfg(feature = "controller")]
const CONTROLLER_NAME: &str = "rook-ceph-operator";
