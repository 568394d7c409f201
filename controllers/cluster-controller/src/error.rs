//! Controller-specific error types.
//!
//! Setup failures are all fatal: `main` prints them to stderr and exits
//! with status 1. Runtime variants only travel inside controller tasks.

use crate::lifecycle::IllegalTransition;
use thiserror::Error;
use kube::Error as KubeError;

/// Option validation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `--kubeconfig` was not supplied
    #[error("--kubeconfig is required")]
    MissingConnectionPath,

    /// A flag value was rejected by its owning option set
    #[error("invalid value for {flag}: {reason}")]
    InvalidFlag { flag: &'static str, reason: String },

    /// Two flags that cannot be combined were both set
    #[error("{0}")]
    Conflict(String),
}

/// Errors that can occur in the Cluster Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Invalid or missing options
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Kubeconfig could not be read or resolved
    #[error("failed to resolve credentials from {path}: {reason}")]
    CredentialResolution { path: String, reason: String },

    /// API client could not be built or the API server is unreachable
    #[error("failed to construct {family} client: {source}")]
    ClientConstruction {
        family: &'static str,
        #[source]
        source: KubeError,
    },

    /// A controller could not be constructed from its options
    #[error("failed to construct {controller} controller: {reason}")]
    ControllerConstruction { controller: &'static str, reason: String },

    /// A shutdown signal handler could not be installed
    #[error("failed to install {signal} handler: {source}")]
    Signal {
        signal: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The process attempted a lifecycle transition it does not allow
    #[error(transparent)]
    Lifecycle(#[from] IllegalTransition),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),
}
