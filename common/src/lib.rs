//! Provides types and functions that are common to the operator, the node agent and the
//! flexvolume driver.
#![deny(missing_docs)]
#[cfg(feature = "telemetry")]
pub mod telemetry;
