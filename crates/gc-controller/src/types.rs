use thiserror::Error;

use crate::backoff::DeleteError;
use crate::rate_limit::RateLimitError;
use crate::watch::WatchError;

/// Finalizer that lets the controller observe policy deletion and tear down its watch
pub const POLICY_FINALIZER_NAME: &str = "gc.platform/policy-cleanup";

/// Field manager used for status patches
pub const FIELD_MANAGER: &str = "gc-controller";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(#[from] PolicyError),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("Deletion error: {0}")]
    Delete(#[from] DeleteError),

    #[error("Rate limiter error: {0}")]
    RateLimit(#[from] RateLimitError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Structural problems that make a policy's target unusable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("targetResource.{field} is empty")]
    EmptyTargetField { field: &'static str },

    #[error("targetResource.apiVersion '{0}' is malformed")]
    MalformedApiVersion(String),

    #[error("policy has no namespace and its target does not set one")]
    MissingNamespace,
}
