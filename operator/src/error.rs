//! Errors shared by the coordinator, the reconciliation engine and the key rotator.
use crate::volume::StoreError;

/// Sentinel message returned after the administrative key has been rotated.
pub const SUCCESSFUL_ADMIN_KEY_ROTATION: &str =
    "successful admin cephx key rotation requires the current cluster reconcile to restart";

/// Errors produced by the operator and the node agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An optimistic concurrency clash or a duplicate attach. Safe to retry.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The spec, an option blob or recovered state is malformed.
    #[error("invalid: {0}")]
    Validation(String),
    /// An access mode, security mode or upgrade rule refused the request.
    #[error("{0}")]
    Policy(String),
    /// A storage backend command failed.
    #[error("backend: {source:#}")]
    Backend {
        /// Underlying command failure
        source: anyhow::Error,
    },
    /// An expected record or resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The administrative key was rotated and the process must reload before doing more work.
    #[error("{}", SUCCESSFUL_ADMIN_KEY_ROTATION)]
    SuccessfulAdminKeyRotation,
    /// Error from the Kubernetes API.
    #[error("Kube error: {source}")]
    Kube {
        /// Underlying API error
        #[from]
        source: kube::Error,
    },
    /// Any other failure.
    #[error("App error: {source:#}")]
    App {
        /// Underlying error
        #[from]
        source: anyhow::Error,
    },
}

impl Error {
    /// Wrap a failed backend command.
    pub fn backend(source: impl Into<anyhow::Error>) -> Self {
        Error::Backend {
            source: source.into(),
        }
    }

    /// Reports whether the operation may succeed if retried.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kube {
                source: kube::Error::Api(resp),
            } => resp.code == 409,
            _ => false,
        }
    }

    /// Reports whether the error means the target is already gone.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Kube {
                source: kube::Error::Api(resp),
            } => resp.code == 404,
            _ => false,
        }
    }

    /// Reports whether this is the reload sentinel.
    pub fn is_successful_rotation(&self) -> bool {
        matches!(self, Error::SuccessfulAdminKeyRotation)
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(name) => Error::NotFound(format!("volume record {name}")),
            StoreError::AlreadyExists(name) => {
                Error::Conflict(format!("volume record {name} already exists"))
            }
            StoreError::Conflict(name) => {
                Error::Conflict(format!("volume record {name} was modified concurrently"))
            }
            StoreError::Kube(source) => Error::Kube { source },
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
