//! API importer controller
//!
//! Tracks, per WorkloadCluster, which of the `--resources-to-sync` have been
//! imported from that cluster and reports it as the `APIImportsReady` condition.

use super::{report, subscribe, Reconciler};
use crate::backoff::Retries;
use crate::cache::WatchCache;
use crate::error::ControllerError;
use crate::reconcile_helpers::{conditions_patch, upsert_condition};
use async_trait::async_trait;
use crds::{APIResourceImport, Condition, ConditionStatus, WorkloadCluster};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::reflector::{ObjectRef, ReflectHandle};
use kube_runtime::Controller;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Condition type written to WorkloadCluster status.
pub const API_IMPORTS_READY: &str = "APIImportsReady";

pub struct ApiImporter {
    clusters_changed: ReflectHandle<WorkloadCluster>,
    imports_changed: ReflectHandle<APIResourceImport>,
    context: Context,
}

struct Context {
    api: Api<WorkloadCluster>,
    clusters: WatchCache<WorkloadCluster>,
    imports: WatchCache<APIResourceImport>,
    resources_to_sync: Vec<String>,
    retries: Retries,
}

impl ApiImporter {
    pub fn new(
        client: Client,
        clusters: WatchCache<WorkloadCluster>,
        imports: WatchCache<APIResourceImport>,
        resources_to_sync: &[String],
    ) -> Result<Self, ControllerError> {
        let mut seen = HashSet::new();
        let resources_to_sync: Vec<String> = resources_to_sync
            .iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty() && seen.insert(r.clone()))
            .collect();

        if resources_to_sync.is_empty() {
            return Err(ControllerError::ControllerConstruction {
                controller: "api-importer",
                reason: "no resources to import".to_string(),
            });
        }

        Ok(Self {
            clusters_changed: subscribe(&clusters, "api-importer")?,
            imports_changed: subscribe(&imports, "api-importer")?,
            context: Context {
                api: Api::all(client),
                clusters,
                imports,
                resources_to_sync,
                retries: Retries::default(),
            },
        })
    }
}

impl Context {
    async fn reconcile(&self, cluster: &WorkloadCluster) -> Result<Action, ControllerError> {
        let name = cluster.name_any();
        let missing = missing_imports(&self.resources_to_sync, &self.imports.list(), &name);
        let condition = imports_condition(&missing);
        let existing = cluster
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default();

        let Some(conditions) = upsert_condition(existing, condition) else {
            return Ok(Action::await_change());
        };

        if missing.is_empty() {
            info!("WorkloadCluster {} has imported all resources", name);
        } else {
            info!("WorkloadCluster {} is missing imports: {}", name, missing.join(", "));
        }

        self.api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&conditions_patch(&conditions)))
            .await?;
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler for ApiImporter {
    fn name(&self) -> &'static str {
        "api-importer"
    }

    async fn start(self: Box<Self>, token: CancellationToken) -> Result<(), ControllerError> {
        let Self {
            clusters_changed,
            imports_changed,
            context,
        } = *self;
        info!("Starting API importer for {}", context.resources_to_sync.join(", "));

        let reconcile = |cluster: Arc<WorkloadCluster>, ctx: Arc<Context>| async move {
            let action = ctx.reconcile(&cluster).await?;
            ctx.retries.succeeded(&cluster.name_any());
            Ok::<_, ControllerError>(action)
        };
        let error_policy = |cluster: Arc<WorkloadCluster>, error: &ControllerError, ctx: Arc<Context>| {
            let name = cluster.name_any();
            let delay = ctx.retries.failed(&name);
            warn!("Failed to reconcile WorkloadCluster {}, retrying in {:?}: {}", name, delay, error);
            Action::requeue(delay)
        };

        let controller = Controller::for_shared_stream(clusters_changed, context.clusters.store())
            .watches_shared_stream(imports_changed, |import: Arc<APIResourceImport>| {
                Some(ObjectRef::new(&import.spec.location))
            })
            .with_config(ControllerConfig::default().concurrency(1))
            .graceful_shutdown_on(token.cancelled_owned());
        report("api-importer", controller.run(reconcile, error_policy, Arc::new(context))).await;

        info!("API importer stopped");
        Ok(())
    }
}

/// Resources from `resources_to_sync` that `cluster` has not imported yet, in flag order.
pub(crate) fn missing_imports(
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
        .filter(|r| !imported.contains(r.as_str()))
        .cloned()
        .collect()
}

fn imports_condition(missing: &[String]) -> Condition {
    if missing.is_empty() {
        Condition::new(API_IMPORTS_READY, ConditionStatus::True, "AllImported", "All resources imported")
    } else {
        Condition::new(
            API_IMPORTS_READY,
            ConditionStatus::False,
            "ImportsPending",
            format!("Waiting for imports of {}", missing.join(", ")),
        )
    }
}
