//! API resource controller
//!
//! Ensures a NegotiatedAPIResource exists for every imported
//! group/version/resource, and marks it for publishing when
//! `--auto-publish-apis` is set and no CRD serves that resource yet.

use super::{report, subscribe, Reconciler, FIELD_MANAGER};
use crate::backoff::Retries;
use crate::cache::WatchCache;
use crate::error::ControllerError;
use async_trait::async_trait;
use crds::{APIResourceImport, NegotiatedAPIResource, NegotiatedAPIResourceSpec};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::reflector::{ObjectRef, ReflectHandle};
use kube_runtime::Controller;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reconciles per import; every import of the same resource maps to one negotiated object.
pub struct ApiResource {
    imports_changed: ReflectHandle<APIResourceImport>,
    negotiated_changed: ReflectHandle<NegotiatedAPIResource>,
    crds_changed: ReflectHandle<CustomResourceDefinition>,
    workers: usize,
    context: Context,
}

struct Context {
    api: Api<NegotiatedAPIResource>,
    negotiated: WatchCache<NegotiatedAPIResource>,
    imports: WatchCache<APIResourceImport>,
    crds: WatchCache<CustomResourceDefinition>,
    auto_publish_apis: bool,
    retries: Retries,
}

impl ApiResource {
    pub fn new(
        client: Client,
        negotiated: WatchCache<NegotiatedAPIResource>,
        imports: WatchCache<APIResourceImport>,
        crds: WatchCache<CustomResourceDefinition>,
        auto_publish_apis: bool,
        workers: usize,
    ) -> Result<Self, ControllerError> {
        if workers == 0 {
            return Err(ControllerError::ControllerConstruction {
                controller: "api-resource",
                reason: "at least one worker is required".to_string(),
            });
        }

        Ok(Self {
            imports_changed: subscribe(&imports, "api-resource")?,
            negotiated_changed: subscribe(&negotiated, "api-resource")?,
            crds_changed: subscribe(&crds, "api-resource")?,
            workers,
            context: Context {
                api: Api::all(client),
                negotiated,
                imports,
                crds,
                auto_publish_apis,
                retries: Retries::default(),
            },
        })
    }
}

impl Context {
    async fn reconcile(&self, import: &APIResourceImport) -> Result<Action, ControllerError> {
        let key = import.spec.negotiated_name();
        let imports: Vec<Arc<APIResourceImport>> = self
            .imports
            .list()
            .into_iter()
            .filter(|i| i.spec.negotiated_name() == key)
            .collect();
        let existing = self.negotiated.get(&key);
        let crd_exists = self.crds.get(&crd_name(import)).is_some();

        let Some(spec) = desired_spec(&imports, existing.as_deref(), crd_exists, self.auto_publish_apis) else {
            debug!("NegotiatedAPIResource {} is up to date", key);
            return Ok(Action::await_change());
        };

        info!(
            "Applying NegotiatedAPIResource {} (publish: {}, imported by {} clusters)",
            key,
            spec.publish,
            imports.len()
        );

        let body = json!({
            "apiVersion": NegotiatedAPIResource::api_version(&()),
            "kind": NegotiatedAPIResource::kind(&()),
            "metadata": { "name": key },
            "spec": spec,
        });
        self.api
            .patch(&key, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&body))
            .await?;
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler for ApiResource {
    fn name(&self) -> &'static str {
        "api-resource"
    }

    async fn start(self: Box<Self>, token: CancellationToken) -> Result<(), ControllerError> {
        let Self {
            imports_changed,
            negotiated_changed,
            crds_changed,
            workers,
            context,
        } = *self;
        info!(
            "Starting API resource controller with {} workers (auto-publish: {})",
            workers, context.auto_publish_apis
        );

        let reconcile = |import: Arc<APIResourceImport>, ctx: Arc<Context>| async move {
            let action = ctx.reconcile(&import).await?;
            ctx.retries.succeeded(&import.name_any());
            Ok::<_, ControllerError>(action)
        };
        let error_policy = |import: Arc<APIResourceImport>, error: &ControllerError, ctx: Arc<Context>| {
            let name = import.name_any();
            let delay = ctx.retries.failed(&name);
            warn!("Failed to negotiate APIResourceImport {}, retrying in {:?}: {}", name, delay, error);
            Action::requeue(delay)
        };

        let by_negotiated = context.imports.clone();
        let by_crd = context.imports.clone();
        let controller = Controller::for_shared_stream(imports_changed, context.imports.store())
            .watches_shared_stream(negotiated_changed, move |negotiated: Arc<NegotiatedAPIResource>| {
                imports_for(&by_negotiated, &[negotiated.name_any()])
            })
            .watches_shared_stream(crds_changed, move |crd: Arc<CustomResourceDefinition>| {
                imports_for(&by_crd, &crd_keys(&crd))
            })
            .with_config(ControllerConfig::default().concurrency(u16::try_from(workers).unwrap_or(u16::MAX)))
            .graceful_shutdown_on(token.cancelled_owned());
        report("api-resource", controller.run(reconcile, error_policy, Arc::new(context))).await;

        info!("API resource controller stopped");
        Ok(())
    }
}

/// Imports whose negotiated resource is one of `keys`.
fn imports_for(imports: &WatchCache<APIResourceImport>, keys: &[String]) -> Vec<ObjectRef<APIResourceImport>> {
    imports
        .list()
        .iter()
        .filter(|i| keys.contains(&i.spec.negotiated_name()))
        .map(|i| ObjectRef::from_obj(i.as_ref()))
        .collect()
}

/// Name a CRD serving the imported resource would have (`<plural>.<group>`).
fn crd_name(import: &APIResourceImport) -> String {
    format!("{}.{}", import.spec.plural, import.spec.group_version.group)
}

/// Negotiated resource keys affected by a CRD, one per served version.
fn crd_keys(crd: &CustomResourceDefinition) -> Vec<String> {
    crd.spec
        .versions
        .iter()
        .map(|v| format!("{}.{}.{}", crd.spec.names.plural, v.name, crd.spec.group))
        .collect()
}

/// The spec the negotiated resource should have, or `None` if nothing needs writing.
///
/// The schema is taken from the import of the alphabetically first cluster so
/// every replica of this controller picks the same one. Once published, a
/// resource stays published.
pub(crate) fn desired_spec(
    imports: &[Arc<APIResourceImport>],
    existing: Option<&NegotiatedAPIResource>,
    crd_exists: bool,
    auto_publish_apis: bool,
) -> Option<NegotiatedAPIResourceSpec> {
    let source = imports.iter().min_by(|a, b| a.spec.location.cmp(&b.spec.location))?;

    let already_published = existing.is_some_and(|n| n.spec.publish);
    let publishable = !source.spec.group_version.group.is_empty() && !crd_exists;
    let spec = NegotiatedAPIResourceSpec {
        group_version: source.spec.group_version.clone(),
        plural: source.spec.plural.clone(),
        kind: source.spec.kind.clone(),
        scope: source.spec.scope,
        publish: already_published || (auto_publish_apis && publishable),
    };

    if existing.is_some_and(|n| n.spec == spec) {
        return None;
    }
    Some(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{api_resource_import, feed, offline_client};
    use kube_runtime::watcher;

    fn negotiated(spec: NegotiatedAPIResourceSpec) -> NegotiatedAPIResource {
        NegotiatedAPIResource::new("deployments.v1.apps", spec)
    }

    #[test]
    fn test_no_imports_means_nothing_to_write() {
        assert!(desired_spec(&[], None, false, true).is_none());
    }

    #[test]
    fn test_first_cluster_wins() {
        let imports = vec![
            Arc::new(api_resource_import("west", "apps", "deployments")),
            Arc::new(api_resource_import("east", "apps", "deployments")),
        ];
        let mut east = imports[1].as_ref().clone();
        east.spec.kind = "EastDeployment".to_string();
        let imports = vec![imports[0].clone(), Arc::new(east)];

        let spec = desired_spec(&imports, None, false, false).unwrap();
        assert_eq!(spec.kind, "EastDeployment");
        assert!(!spec.publish);
    }

    #[test]
    fn test_auto_publish_only_without_crd() {
        let imports = vec![Arc::new(api_resource_import("east", "apps", "deployments"))];

        assert!(desired_spec(&imports, None, false, true).unwrap().publish);
        assert!(!desired_spec(&imports, None, true, true).unwrap().publish);
    }

    #[test]
    fn test_core_group_is_never_auto_published() {
        let imports = vec![Arc::new(api_resource_import("east", "", "configmaps"))];
        assert!(!desired_spec(&imports, None, false, true).unwrap().publish);
    }

    #[test]
    fn test_unchanged_spec_is_skipped_and_publish_is_sticky() {
        let imports = vec![Arc::new(api_resource_import("east", "apps", "deployments"))];
        let published = desired_spec(&imports, None, false, true).unwrap();
        let existing = negotiated(published);

        // A CRD appearing later does not unpublish
        assert!(desired_spec(&imports, Some(&existing), true, false).is_none());
    }

    #[test]
    fn test_crd_keys_cover_every_version() {
        let crd: CustomResourceDefinition = serde_json::from_value(json!({
            "metadata": { "name": "widgets.example.io" },
            "spec": {
                "group": "example.io",
                "names": { "plural": "widgets", "kind": "Widget" },
                "scope": "Namespaced",
                "versions": [
                    { "name": "v1", "served": true, "storage": true },
                    { "name": "v2", "served": true, "storage": false }
                ]
            }
        }))
        .unwrap();

        assert_eq!(crd_keys(&crd), vec!["widgets.v1.example.io", "widgets.v2.example.io"]);
    }

    #[tokio::test]
    async fn test_imports_for_matches_negotiated_names() {
        let imports = WatchCache::new("APIResourceImport");
        let feed = feed(&imports);
        feed.unbounded_send(watcher::Event::Init).unwrap();
        for import in [
            api_resource_import("east", "apps", "deployments"),
            api_resource_import("west", "apps", "deployments"),
            api_resource_import("east", "", "configmaps"),
        ] {
            feed.unbounded_send(watcher::Event::InitApply(import)).unwrap();
        }
        feed.unbounded_send(watcher::Event::InitDone).unwrap();
        assert!(imports.wait_synced().await);

        let mut names: Vec<String> = imports_for(&imports, &["deployments.v1.apps".to_string()])
            .into_iter()
            .map(|r| r.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["deployments.east", "deployments.west"]);

        let core = imports_for(&imports, &["configmaps.v1.core".to_string()]);
        assert_eq!(core.len(), 1);
        assert!(imports_for(&imports, &["widgets.v1.example.io".to_string()]).is_empty());
    }

    #[tokio::test]
    async fn test_new_requires_a_worker() {
        let negotiated = WatchCache::new("NegotiatedAPIResource");
        let imports = WatchCache::new("APIResourceImport");
        let crds = WatchCache::new("CustomResourceDefinition");

        let result = ApiResource::new(offline_client(), negotiated, imports, crds, false, 0);
        assert!(matches!(result, Err(ControllerError::ControllerConstruction { .. })));
    }
}
