//! API clients, one per resource family.

use crate::connection::Connection;
use crate::error::ControllerError;
use kube::Client;
use tracing::info;

/// Client family serving WorkloadClusters, APIResourceImports and NegotiatedAPIResources.
pub const KCP_FAMILY: &str = "kcp";
/// Client family serving CustomResourceDefinitions.
pub const CRD_FAMILY: &str = "apiextensions";

/// One API client per resource family.
#[derive(Clone)]
pub struct ClientBundle {
    pub kcp: Client,
    pub crd: Client,
}

impl ClientBundle {
    /// Builds both clients and checks that each answers. Fails on the first family that can't be reached.
    pub async fn new(connection: &Connection) -> Result<Self, ControllerError> {
        let kcp = connect(KCP_FAMILY, connection).await?;
        let crd = connect(CRD_FAMILY, connection).await?;
        Ok(Self { kcp, crd })
    }
}

async fn connect(family: &'static str, connection: &Connection) -> Result<Client, ControllerError> {
    let client = Client::try_from(connection.config().clone())
        .map_err(|source| ControllerError::ClientConstruction { family, source })?;

    // Client construction is lazy; ask for the version so an unreachable API fails startup here
    let version = client
        .apiserver_version()
        .await
        .map_err(|source| ControllerError::ClientConstruction { family, source })?;

    info!(
        "{} client connected to {} (Kubernetes {})",
        family,
        connection.server(),
        version.git_version
    );
    Ok(client)
}
