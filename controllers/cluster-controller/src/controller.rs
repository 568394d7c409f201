//! Main controller implementation.
//!
//! `Controller::new` performs every fallible setup step in order: option
//! validation, connection resolution, clients, watch caches and controller
//! construction. `Controller::run` then starts the caches, waits for them
//! to sync and supervises the controllers until shutdown.

use crate::cache::{CacheBundle, RESYNC_PERIOD};
use crate::clients::ClientBundle;
use crate::connection;
use crate::error::ControllerError;
use crate::lifecycle::{Lifecycle, Phase};
use crate::options::Options;
use crate::reconciler::{ControllerCaches, Reconciler, ReconcilerSet};
use crate::supervisor::{supervise, SupervisorReport};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Controller {
    lifecycle: Lifecycle,
    caches: CacheBundle,
    reconcilers: Vec<Box<dyn Reconciler>>,
}

impl Controller {
    /// Creates a new controller instance. Nothing is watched or started yet.
    pub async fn new(options: &Options) -> Result<Self, ControllerError> {
        options.validate()?;

        let (connection, credentials) = connection::resolve(&options.kubeconfig_path).await?;
        let clients = ClientBundle::new(&connection).await?;

        let mut caches = CacheBundle::new(RESYNC_PERIOD);
        let controller_caches = ControllerCaches::watch(&mut caches, &clients);
        let reconcilers = ReconcilerSet::build(options, &clients, &controller_caches, credentials)?.into_reconcilers();

        info!(
            "Constructed {} controllers over {} watch caches",
            reconcilers.len(),
            caches.len()
        );

        Ok(Self {
            lifecycle: Lifecycle::new(),
            caches,
            reconcilers,
        })
    }

    /// Runs the controller until `token` fires.
    pub async fn run(mut self, token: CancellationToken) -> Result<Option<SupervisorReport>, ControllerError> {
        run_until_shutdown(
            &mut self.lifecycle,
            &mut self.caches,
            self.reconcilers,
            &token,
        )
        .await
    }
}

/// Starts the caches, waits on the cache-sync barrier and supervises `reconcilers`.
///
/// Returns `None` if shutdown was requested before the caches synced, in
/// which case no reconciler is started.
pub(crate) async fn run_until_shutdown(
    lifecycle: &mut Lifecycle,
    caches: &mut CacheBundle,
    reconcilers: Vec<Box<dyn Reconciler>>,
    token: &CancellationToken,
) -> Result<Option<SupervisorReport>, ControllerError> {
    lifecycle.transition(Phase::WaitingForCacheSync)?;
    caches.start(token);
    info!("Waiting for {} caches to sync", caches.len());

    if !caches.wait_for_sync(token).await {
        lifecycle.transition(Phase::ShuttingDown)?;
        lifecycle.transition(Phase::Stopped)?;
        info!("Stopped before controllers were started");
        return Ok(None);
    }

    lifecycle.transition(Phase::Running)?;
    info!("Caches synced, starting {} controllers", reconcilers.len());
    let report = supervise(reconcilers, token).await;

    lifecycle.transition(Phase::ShuttingDown)?;
    lifecycle.transition(Phase::Stopped)?;
    debug!("Lifecycle: {:?}", lifecycle.history());
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::WatchCache;
    use crate::error::ConfigError;
    use crate::test_utils::{feed, workload_cluster, LogCapture};
    use async_trait::async_trait;
    use clap::Parser;
    use crds::WorkloadCluster;
    use kube_runtime::watcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Records whether `start` ran and whether the caches were synced by then.
    struct StartRecorder {
        cache: WatchCache<WorkloadCluster>,
        started: Arc<AtomicUsize>,
        started_unsynced: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Reconciler for StartRecorder {
        fn name(&self) -> &'static str {
            "start-recorder"
        }

        async fn start(self: Box<Self>, token: CancellationToken) -> Result<(), ControllerError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let synced = tokio::time::timeout(Duration::ZERO, self.cache.wait_synced()).await;
            if synced != Ok(true) {
                self.started_unsynced.fetch_add(1, Ordering::SeqCst);
            }
            token.cancelled().await;
            Ok(())
        }
    }

    struct Starts {
        started: Arc<AtomicUsize>,
        started_unsynced: Arc<AtomicUsize>,
    }

    fn recorders(cache: &WatchCache<WorkloadCluster>, count: usize) -> (Vec<Box<dyn Reconciler>>, Starts) {
        let starts = Starts {
            started: Arc::new(AtomicUsize::new(0)),
            started_unsynced: Arc::new(AtomicUsize::new(0)),
        };
        let reconcilers = (0..count)
            .map(|_| {
                Box::new(StartRecorder {
                    cache: cache.clone(),
                    started: starts.started.clone(),
                    started_unsynced: starts.started_unsynced.clone(),
                }) as Box<dyn Reconciler>
            })
            .collect();
        (reconcilers, starts)
    }

    #[tokio::test]
    async fn test_shutdown_during_cache_sync_launches_nothing() {
        let token = CancellationToken::new();
        let mut lifecycle = Lifecycle::new();
        let mut caches = CacheBundle::new(RESYNC_PERIOD);
        let cache = WatchCache::<WorkloadCluster>::new("WorkloadCluster");
        caches.track(&cache);
        let (reconcilers, starts) = recorders(&cache, 2);

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let report = run_until_shutdown(&mut lifecycle, &mut caches, reconcilers, &token)
            .await
            .unwrap();

        assert!(report.is_none());
        assert_eq!(starts.started.load(Ordering::SeqCst), 0);
        assert_eq!(
            lifecycle.history(),
            &[Phase::Starting, Phase::WaitingForCacheSync, Phase::ShuttingDown, Phase::Stopped]
        );
    }

    #[tokio::test]
    async fn test_controllers_start_only_after_caches_sync() {
        let token = CancellationToken::new();
        let mut lifecycle = Lifecycle::new();
        let mut caches = CacheBundle::new(RESYNC_PERIOD);
        let cache = WatchCache::<WorkloadCluster>::new("WorkloadCluster");
        let feed = feed(&cache);
        caches.track(&cache);
        let (reconcilers, starts) = recorders(&cache, 2);

        let driver = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(starts.started.load(Ordering::SeqCst), 0);

            feed.unbounded_send(watcher::Event::Init).unwrap();
            feed.unbounded_send(watcher::Event::InitApply(workload_cluster("east"))).unwrap();
            feed.unbounded_send(watcher::Event::InitDone).unwrap();

            while starts.started.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            token.cancel();
        };

        let (report, ()) = tokio::join!(
            run_until_shutdown(&mut lifecycle, &mut caches, reconcilers, &token),
            driver
        );
        let report = report.unwrap().unwrap();
        assert_eq!(report.launched, 2);
        assert_eq!(report.detached + report.completed, 2);
        assert_eq!(starts.started_unsynced.load(Ordering::SeqCst), 0);
        assert_eq!(lifecycle.phase(), Phase::Stopped);
        assert!(lifecycle.history().contains(&Phase::Running));
    }

    #[tokio::test]
    async fn test_empty_kubeconfig_fails_before_any_construction() {
        let options = Options::try_parse_from(["cluster-controller"]).unwrap();
        let capture = LogCapture::default();

        let dispatch = capture.subscriber();
        let result = {
            let _guard = tracing::dispatcher::set_default(&dispatch);
            Controller::new(&options).await
        };

        assert!(matches!(
            result,
            Err(ControllerError::Config(ConfigError::MissingConnectionPath))
        ));
        // Resolution and client construction both log when they run
        assert_eq!(capture.count("Loading kubeconfig"), 0);
        assert_eq!(capture.count("client connected"), 0);
    }
}
