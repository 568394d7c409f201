//! Reconcilers run by the cluster controller.
//!
//! - `api_importer`: reports which resources each workload cluster has imported
//! - `api_resource`: negotiates a common API resource per imported group/version/resource
//! - `syncer`: installs or runs a syncer per workload cluster (optional, see `--pull-mode`/`--push-mode`)
//!
//! Every reconciler is constructed up front and subscribes to the watch
//! caches it reads from. It is started only after those caches have synced,
//! and runs as a `kube_runtime::Controller` over the shared stores.

pub mod api_importer;
pub mod api_resource;
pub mod syncer;
#[cfg(test)]
mod activation_test;

use crate::cache::{CacheBundle, CachedResource, WatchCache};
use crate::clients::ClientBundle;
use crate::error::ControllerError;
use crate::options::Options;
use api_importer::ApiImporter;
use api_resource::ApiResource;
use async_trait::async_trait;
use crds::{APIResourceImport, NegotiatedAPIResource, WorkloadCluster};
use futures::{Stream, StreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::Api;
use kube_runtime::controller::{Action, Error as RunError};
use kube_runtime::reflector::{ObjectRef, ReflectHandle};
use kube_runtime::watcher;
use syncer::{Syncer, SyncerCredentials};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "cluster-controller";

/// Logged once when neither sync mode is selected.
pub const SYNCER_DISABLED_MESSAGE: &str = "syncer not enabled. To enable, supply --pull-mode or --push-mode";

/// A constructed controller that runs until its token is cancelled.
#[async_trait]
pub trait Reconciler: Send {
    fn name(&self) -> &'static str;

    /// Run entry point. Returns once `token` fires.
    async fn start(self: Box<Self>, token: CancellationToken) -> Result<(), ControllerError>;
}

/// Subscribes `controller` to changes in `cache`.
fn subscribe<K: CachedResource>(
    cache: &WatchCache<K>,
    controller: &'static str,
) -> Result<ReflectHandle<K>, ControllerError> {
    cache.subscribe().ok_or_else(|| ControllerError::ControllerConstruction {
        controller,
        reason: format!("{} cache is already running", cache.kind()),
    })
}

/// Drives a controller's result stream until it ends, logging failed reconciles.
async fn report<K, S>(controller: &'static str, results: S)
where
    K: CachedResource,
    S: Stream<Item = Result<(ObjectRef<K>, Action), RunError<ControllerError, watcher::Error>>>,
{
    results
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("{} reconciled {}", controller, obj),
                // Watch mappings may point at objects that do not exist (yet)
                Err(RunError::ObjectNotFound(obj)) => debug!("{} skipped missing {}", controller, obj),
                Err(e) => error!("{} controller error: {}", controller, e),
            }
        })
        .await;
}

/// The watch caches reconcilers are bound to.
#[derive(Clone)]
pub struct ControllerCaches {
    pub clusters: WatchCache<WorkloadCluster>,
    pub imports: WatchCache<APIResourceImport>,
    pub negotiated: WatchCache<NegotiatedAPIResource>,
    pub crds: WatchCache<CustomResourceDefinition>,
}

impl ControllerCaches {
    /// Arms one cache per kind: three from the kcp family, one from the CRD family.
    pub fn watch(bundle: &mut CacheBundle, clients: &ClientBundle) -> Self {
        Self {
            clusters: bundle.watch("WorkloadCluster", Api::all(clients.kcp.clone())),
            imports: bundle.watch("APIResourceImport", Api::all(clients.kcp.clone())),
            negotiated: bundle.watch("NegotiatedAPIResource", Api::all(clients.kcp.clone())),
            crds: bundle.watch("CustomResourceDefinition", Api::all(clients.crd.clone())),
        }
    }
}

/// The controllers selected for this process.
pub struct ReconcilerSet {
    pub api_importer: ApiImporter,
    pub api_resource: ApiResource,
    pub syncer: Option<Syncer>,
}

impl ReconcilerSet {
    /// Constructs the importer and resource controllers, and the syncer when a sync mode is selected.
    ///
    /// The raw credentials are only kept when the syncer is built.
    pub fn build(
        options: &Options,
        clients: &ClientBundle,
        caches: &ControllerCaches,
        credentials: SyncerCredentials,
    ) -> Result<Self, ControllerError> {
        let api_importer = ApiImporter::new(
            clients.kcp.clone(),
            caches.clusters.clone(),
            caches.imports.clone(),
            &options.api_importer.resources_to_sync,
        )?;

        let api_resource = ApiResource::new(
            clients.kcp.clone(),
            caches.negotiated.clone(),
            caches.imports.clone(),
            caches.crds.clone(),
            options.api_resource.auto_publish_apis,
            options.api_resource.num_threads,
        )?;

        let syncer = match syncer::activate(options.syncer.mode(), &options.syncer.resources_to_sync) {
            None => {
                info!("{}", SYNCER_DISABLED_MESSAGE);
                None
            }
            Some(config) => Some(Syncer::new(
                clients.kcp.clone(),
                caches.clusters.clone(),
                caches.imports.clone(),
                credentials,
                config,
            )?),
        };

        Ok(Self {
            api_importer,
            api_resource,
            syncer,
        })
    }

    pub fn into_reconcilers(self) -> Vec<Box<dyn Reconciler>> {
        let mut reconcilers: Vec<Box<dyn Reconciler>> =
            vec![Box::new(self.api_importer), Box::new(self.api_resource)];
        if let Some(syncer) = self.syncer {
            reconcilers.push(Box::new(syncer));
        }
        reconcilers
    }
}
