//! Connection resolution.
//!
//! Turns a kubeconfig path into a `kube::Config` for the control plane. The
//! raw kubeconfig is handed back separately, wrapped so that only the syncer
//! can read it.

use crate::error::ControllerError;
use crate::reconciler::syncer::SyncerCredentials;
use kube::config::{KubeConfigOptions, Kubeconfig};
use std::path::Path;
use tracing::{debug, info};

/// Resolved connection to the control plane.
#[derive(Debug, Clone)]
pub struct Connection {
    config: kube::Config,
}

impl Connection {
    /// Client configuration for building API clients.
    pub fn config(&self) -> &kube::Config {
        &self.config
    }

    /// API server URL this connection points at.
    pub fn server(&self) -> String {
        self.config.cluster_url.to_string()
    }
}

/// Reads the kubeconfig at `path` and resolves its current context.
///
/// Every failure is fatal to startup; there is no retry.
pub async fn resolve(path: &str) -> Result<(Connection, SyncerCredentials), ControllerError> {
    let failed = |reason: String| ControllerError::CredentialResolution {
        path: path.to_string(),
        reason,
    };

    debug!("Loading kubeconfig from {}", path);
    let kubeconfig = Kubeconfig::read_from(Path::new(path)).map_err(|e| failed(e.to_string()))?;

    let context = kubeconfig
        .current_context
        .clone()
        .ok_or_else(|| failed("kubeconfig has no current-context".to_string()))?;

    let options = KubeConfigOptions {
        context: Some(context.clone()),
        ..Default::default()
    };
    let config = kube::Config::from_custom_kubeconfig(kubeconfig.clone(), &options)
        .await
        .map_err(|e| failed(e.to_string()))?;

    info!("Resolved context {} ({})", context, config.cluster_url);

    Ok((Connection { config }, SyncerCredentials::new(kubeconfig)))
}
