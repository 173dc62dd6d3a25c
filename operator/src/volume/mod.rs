//! Volume is the k8s custom resource recording which pods a persistent volume is attached to.

// Export all spec types
mod spec;
pub use spec::*;

#[cfg(feature = "controller")]
mod store;
#[cfg(feature = "controller")]
pub use store::{AttachmentStore, KubeAttachmentStore, StoreError};

#[cfg(test)]
#[cfg(feature = "controller")]
pub mod stub;
