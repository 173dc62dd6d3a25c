//! Talking to Ceph: release versions, cluster identity, keyrings and administrative commands.
pub mod client;
pub mod info;
pub mod keyring;
pub mod version;
