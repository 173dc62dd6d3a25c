//! CephCluster is the k8s custom resource that defines a Ceph cluster run by the operator.

// Export all spec types
mod spec;
pub use spec::*;

// All other mods are behind the controller flag to keep the deps to a minimum
#[cfg(feature = "controller")]
pub mod cephx;
#[cfg(feature = "controller")]
pub(crate) mod compare;
#[cfg(feature = "controller")]
pub(crate) mod controller;
#[cfg(feature = "controller")]
pub mod daemons;
#[cfg(feature = "controller")]
pub(crate) mod orchestration;
#[cfg(feature = "controller")]
pub mod resources;
#[cfg(feature = "controller")]
pub(crate) mod validation;
#[cfg(feature = "controller")]
pub mod version;

#[cfg(test)]
#[cfg(feature = "controller")]
pub mod stub;

#[cfg(feature = "controller")]
pub use controller::{run, FINALIZER};
