//! Syncer controller
//!
//! Optional. Ensures that every WorkloadCluster has a syncer for the
//! resources it has imported. Where the syncer runs depends on the mode:
//!
//! - pull: a syncer Deployment is installed into the workload cluster and
//!   connects back to the control plane with the controller's own kubeconfig
//! - push: a syncer task runs in this process, one per workload cluster;
//!   the task only holds the cluster's slot and does not copy objects yet
//!
//! The raw control-plane kubeconfig is only visible inside this module.

use super::{report, subscribe, Reconciler, FIELD_MANAGER};
use crate::backoff::Retries;
use crate::cache::WatchCache;
use crate::error::ControllerError;
use crate::options::SyncMode;
use async_trait::async_trait;
use crds::{APIResourceImport, WorkloadCluster};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::reflector::{ObjectRef, ReflectHandle};
use kube_runtime::Controller;
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Namespace the pull-mode syncer is installed into.
pub const SYNCER_NAMESPACE: &str = "kcp-syncer";
const SYNCER_NAME: &str = "kcp-syncer";
const SYNCER_KUBECONFIG_KEY: &str = "kubeconfig";

/// How often syncers of deleted WorkloadClusters are looked for.
const SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// The unredacted control-plane kubeconfig, passed through for the syncer only.
pub struct SyncerCredentials {
    kubeconfig: Kubeconfig,
}

impl SyncerCredentials {
    pub(crate) fn new(kubeconfig: Kubeconfig) -> Self {
        Self { kubeconfig }
    }

    pub fn current_context(&self) -> Option<&str> {
        self.kubeconfig.current_context.as_deref()
    }

    fn to_yaml(&self) -> Result<String, ControllerError> {
        serde_yaml::to_string(&self.kubeconfig)
            .map_err(|e| ControllerError::Reconciliation(format!("failed to serialize syncer kubeconfig: {}", e)))
    }
}

impl fmt::Debug for SyncerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncerCredentials")
            .field("current_context", &self.current_context())
            .field("kubeconfig", &"<redacted>")
            .finish()
    }
}

/// Where syncers run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerKind {
    Pull { image: String },
    Push,
}

/// Configuration of an activated syncer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncerConfig {
    pub manager: ManagerKind,
    pub resources_to_sync: Vec<String>,
}

/// Activation policy: the syncer runs only when a sync mode was selected.
pub fn activate(mode: SyncMode, resources_to_sync: &[String]) -> Option<SyncerConfig> {
    let manager = match mode {
        SyncMode::Disabled => return None,
        SyncMode::Pull { image } => ManagerKind::Pull { image },
        SyncMode::Push => ManagerKind::Push,
    };
    Some(SyncerConfig {
        manager,
        resources_to_sync: resources_to_sync.to_vec(),
    })
}

/// Starts and stops syncers for individual workload clusters.
#[async_trait]
pub trait SyncerManager: Send + Sync {
    fn mode(&self) -> &'static str;

    /// Makes sure `cluster` has a syncer for exactly `resources`.
    async fn ensure(
        &self,
        cluster: &WorkloadCluster,
        resources: &[String],
        credentials: &SyncerCredentials,
        parent: &CancellationToken,
    ) -> Result<(), ControllerError>;

    /// Stops the syncer of `name`.
    ///
    /// `cluster` is `None` when the WorkloadCluster itself was deleted, in
    /// which case its kubeconfig is gone too.
    async fn remove(&self, name: &str, cluster: Option<&WorkloadCluster>) -> Result<(), ControllerError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds a client for the workload cluster from the kubeconfig in its spec.
async fn workload_client(cluster: &WorkloadCluster) -> Result<Client, ControllerError> {
    let name = cluster.name_any();
    let invalid = |reason: String| {
        ControllerError::Reconciliation(format!("WorkloadCluster {} has an unusable kubeconfig: {}", name, reason))
    };

    let kubeconfig = Kubeconfig::from_yaml(&cluster.spec.kubeconfig).map_err(|e| invalid(e.to_string()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| invalid(e.to_string()))?;
    Ok(Client::try_from(config)?)
}

/// Installs a syncer Deployment into each workload cluster.
///
/// Every `ensure` applies the full set of objects again. Server-side apply
/// makes that a no-op when nothing changed, and restores anything that was
/// deleted from the workload cluster in the meantime.
pub struct PullSyncerManager {
    image: String,
}

impl PullSyncerManager {
    pub fn new(image: String) -> Self {
        Self { image }
    }

    fn deployment(&self, cluster: &str, resources: &[String]) -> serde_json::Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": SYNCER_NAME, "namespace": SYNCER_NAMESPACE },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": { "app": SYNCER_NAME } },
                "template": {
                    "metadata": { "labels": { "app": SYNCER_NAME } },
                    "spec": {
                        "containers": [{
                            "name": SYNCER_NAME,
                            "image": self.image,
                            "args": [
                                "--cluster", cluster,
                                "--from-kubeconfig", format!("/kcp/{}", SYNCER_KUBECONFIG_KEY),
                                "--resources", resources.join(","),
                            ],
                            "volumeMounts": [{ "name": "kcp-config", "mountPath": "/kcp", "readOnly": true }]
                        }],
                        "volumes": [{ "name": "kcp-config", "secret": { "secretName": SYNCER_NAME } }]
                    }
                }
            }
        })
    }
}

#[async_trait]
impl SyncerManager for PullSyncerManager {
    fn mode(&self) -> &'static str {
        "pull"
    }

    async fn ensure(
        &self,
        cluster: &WorkloadCluster,
        resources: &[String],
        credentials: &SyncerCredentials,
        _parent: &CancellationToken,
    ) -> Result<(), ControllerError> {
        let name = cluster.name_any();
        let client = workload_client(cluster).await?;
        let params = PatchParams::apply(FIELD_MANAGER).force();

        let namespace = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": SYNCER_NAMESPACE }
        });
        Api::<Namespace>::all(client.clone())
            .patch(SYNCER_NAMESPACE, &params, &Patch::Apply(&namespace))
            .await?;

        let secret = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": SYNCER_NAME, "namespace": SYNCER_NAMESPACE },
            "stringData": { SYNCER_KUBECONFIG_KEY: credentials.to_yaml()? }
        });
        Api::<Secret>::namespaced(client.clone(), SYNCER_NAMESPACE)
            .patch(SYNCER_NAME, &params, &Patch::Apply(&secret))
            .await?;

        Api::<Deployment>::namespaced(client, SYNCER_NAMESPACE)
            .patch(SYNCER_NAME, &params, &Patch::Apply(&self.deployment(&name, resources)))
            .await?;

        debug!("Applied syncer {} to {} for {}", self.image, name, resources.join(", "));
        Ok(())
    }

    async fn remove(&self, name: &str, cluster: Option<&WorkloadCluster>) -> Result<(), ControllerError> {
        let Some(cluster) = cluster else {
            warn!("WorkloadCluster {} was removed; its pull syncer is left installed", name);
            return Ok(());
        };

        let client = workload_client(cluster).await?;
        match Api::<Deployment>::namespaced(client, SYNCER_NAMESPACE)
            .delete(SYNCER_NAME, &DeleteParams::default())
            .await
        {
            Ok(_) => info!("Removed pull syncer from {}", name),
            Err(kube::Error::Api(e)) if e.code == 404 => debug!("{} has no pull syncer installed", name),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

struct RunningSyncer {
    resources: Vec<String>,
    token: CancellationToken,
}

/// Runs one syncer task per workload cluster in this process.
///
/// Each task gets a child of the controller's token, so stopping the
/// controller stops every syncer while a single cluster can still be
/// stopped on its own.
#[derive(Default)]
pub struct PushSyncerManager {
    running: Mutex<HashMap<String, RunningSyncer>>,
}

impl PushSyncerManager {
    /// Names of clusters with a running syncer.
    #[cfg(test)]
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.running).keys().cloned().collect();
        names.sort();
        names
    }
}

/// Holds the slot of one in-process syncer until `token` fires.
///
/// This only checks that the workload cluster answers and then waits; it
/// does not copy any objects. It stands in for the syncer loop so that
/// start, restart and stop can be driven per cluster.
async fn run_push_syncer(cluster: String, client: Client, resources: Vec<String>, token: CancellationToken) {
    match client.apiserver_version().await {
        Ok(version) => info!(
            "Push syncer slot for {} reached Kubernetes {} (resources: {})",
            cluster,
            version.git_version,
            resources.join(", ")
        ),
        Err(e) => warn!("Push syncer slot for {} can't reach the cluster yet: {}", cluster, e),
    }
    token.cancelled().await;
    info!("Push syncer slot for {} released", cluster);
}

#[async_trait]
impl SyncerManager for PushSyncerManager {
    fn mode(&self) -> &'static str {
        "push"
    }

    async fn ensure(
        &self,
        cluster: &WorkloadCluster,
        resources: &[String],
        _credentials: &SyncerCredentials,
        parent: &CancellationToken,
    ) -> Result<(), ControllerError> {
        let name = cluster.name_any();
        if lock(&self.running).get(&name).is_some_and(|r| r.resources.as_slice() == resources) {
            return Ok(());
        }

        let client = workload_client(cluster).await?;
        let token = parent.child_token();
        let previous = lock(&self.running).insert(
            name.clone(),
            RunningSyncer {
                resources: resources.to_vec(),
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!("Restarting push syncer for {} with new resources", name);
            previous.token.cancel();
        }

        tokio::spawn(run_push_syncer(name, client, resources.to_vec(), token));
        Ok(())
    }

    async fn remove(&self, name: &str, _cluster: Option<&WorkloadCluster>) -> Result<(), ControllerError> {
        if let Some(running) = lock(&self.running).remove(name) {
            info!("Stopping push syncer for WorkloadCluster {}", name);
            running.token.cancel();
        }
        Ok(())
    }
}

pub struct Syncer {
    clusters_changed: ReflectHandle<WorkloadCluster>,
    imports_changed: ReflectHandle<APIResourceImport>,
    context: Context,
}

struct Context {
    api: Api<WorkloadCluster>,
    clusters: WatchCache<WorkloadCluster>,
    imports: WatchCache<APIResourceImport>,
    resources_to_sync: Vec<String>,
    credentials: SyncerCredentials,
    manager: Box<dyn SyncerManager>,
    /// Clusters that currently have a syncer
    active: Mutex<BTreeSet<String>>,
    /// Parent of every push syncer's token; the controller's token once started
    parent: CancellationToken,
    retries: Retries,
}

impl Syncer {
    pub fn new(
        client: Client,
        clusters: WatchCache<WorkloadCluster>,
        imports: WatchCache<APIResourceImport>,
        credentials: SyncerCredentials,
        config: SyncerConfig,
    ) -> Result<Self, ControllerError> {
        if credentials.current_context().is_none() {
            return Err(ControllerError::ControllerConstruction {
                controller: "syncer",
                reason: "kubeconfig has no current context to hand to syncers".to_string(),
            });
        }

        let manager: Box<dyn SyncerManager> = match config.manager {
            ManagerKind::Pull { image } => Box::new(PullSyncerManager::new(image)),
            ManagerKind::Push => Box::new(PushSyncerManager::default()),
        };

        Ok(Self {
            clusters_changed: subscribe(&clusters, "syncer")?,
            imports_changed: subscribe(&imports, "syncer")?,
            context: Context {
                api: Api::all(client),
                clusters,
                imports,
                resources_to_sync: config.resources_to_sync,
                credentials,
                manager,
                active: Mutex::new(BTreeSet::new()),
                parent: CancellationToken::new(),
                retries: Retries::default(),
            },
        })
    }
}

impl Context {
    async fn reconcile(&self, cluster: &WorkloadCluster) -> Result<Action, ControllerError> {
        self.sweep().await;

        let name = cluster.name_any();
        let resources = syncable_resources(&self.resources_to_sync, &self.imports.list(), &name);
        if resources.is_empty() {
            if lock(&self.active).contains(&name) {
                info!("WorkloadCluster {} has no imported resources left to sync", name);
                self.manager.remove(&name, Some(cluster)).await?;
                lock(&self.active).remove(&name);
            } else {
                debug!("WorkloadCluster {} has not imported any resource to sync yet", name);
            }
        } else {
            self.manager
                .ensure(cluster, &resources, &self.credentials, &self.parent)
                .await?;
            lock(&self.active).insert(name.clone());
        }

        let recorded = cluster.status.as_ref().map(|s| s.synced_resources.as_slice()).unwrap_or_default();
        if recorded != resources.as_slice() {
            let patch = json!({ "status": { "syncedResources": resources } });
            self.api
                .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
        Ok(Action::await_change())
    }

    /// Stops the syncers of clusters that are no longer in the cache.
    async fn sweep(&self) {
        let gone: Vec<String> = lock(&self.active)
            .iter()
            .filter(|name| self.clusters.get(name).is_none())
            .cloned()
            .collect();

        for name in gone {
            match self.manager.remove(&name, None).await {
                Ok(()) => {
                    lock(&self.active).remove(&name);
                }
                Err(e) => warn!("Failed to stop syncer of removed WorkloadCluster {}: {}", name, e),
            }
        }
    }
}

#[async_trait]
impl Reconciler for Syncer {
    fn name(&self) -> &'static str {
        "syncer"
    }

    async fn start(self: Box<Self>, token: CancellationToken) -> Result<(), ControllerError> {
        let Self {
            clusters_changed,
            imports_changed,
            mut context,
        } = *self;
        context.parent = token.clone();
        info!(
            "Starting syncer in {} mode for {}",
            context.manager.mode(),
            context.resources_to_sync.join(", ")
        );

        let reconcile = |cluster: Arc<WorkloadCluster>, ctx: Arc<Context>| async move {
            let action = ctx.reconcile(&cluster).await?;
            ctx.retries.succeeded(&cluster.name_any());
            Ok::<_, ControllerError>(action)
        };
        let error_policy = |cluster: Arc<WorkloadCluster>, error: &ControllerError, ctx: Arc<Context>| {
            let name = cluster.name_any();
            let delay = ctx.retries.failed(&name);
            warn!("Failed to sync WorkloadCluster {}, retrying in {:?}: {}", name, delay, error);
            Action::requeue(delay)
        };

        let context = Arc::new(context);
        let controller = Controller::for_shared_stream(clusters_changed, context.clusters.store())
            .watches_shared_stream(imports_changed, |import: Arc<APIResourceImport>| {
                Some(ObjectRef::new(&import.spec.location))
            })
            .with_config(ControllerConfig::default().concurrency(1))
            .graceful_shutdown_on(token.clone().cancelled_owned());

        // Deletions never trigger a reconcile, so removed clusters are swept on a timer
        let sweeper = async {
            let mut ticks = tokio::time::interval(SWEEP_PERIOD);
            while !token.is_cancelled() {
                ticks.tick().await;
                context.sweep().await;
            }
        };

        tokio::select! {
            () = report("syncer", controller.run(reconcile, error_policy, context.clone())) => {}
            () = sweeper => {}
        }

        info!("Syncer stopped");
        Ok(())
    }
}

/// Resources from `resources_to_sync` that `cluster` has imported, in flag order.
pub(crate) fn syncable_resources(
    resources_to_sync: &[String],
    imports: &[Arc<APIResourceImport>],
    cluster: &str,
) -> Vec<String> {
    let imported: HashSet<String> = imports
        .iter()
        .filter(|i| i.spec.location == cluster)
        .map(|i| i.spec.group_resource())
        .collect();

    resources_to_sync
        .iter()
        .filter(|r| imported.contains(r.as_str()))
        .cloned()
        .collect()
}
