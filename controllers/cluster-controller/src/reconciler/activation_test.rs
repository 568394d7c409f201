//! Tests for which controllers get constructed from the sync mode flags.

use super::*;
use crate::cache::RESYNC_PERIOD;
use crate::connection::resolve;
use crate::test_utils::{offline_clients, write_kubeconfig, LogCapture};
use clap::Parser;

async fn build_with(args: &[&str], capture: &LogCapture) -> Result<ReconcilerSet, ControllerError> {
    let file = write_kubeconfig("admin", "http://127.0.0.1:1");
    let path = file.path().to_str().unwrap().to_string();

    let mut argv = vec!["cluster-controller", "--kubeconfig", path.as_str()];
    argv.extend_from_slice(args);
    let options = Options::try_parse_from(argv).unwrap();
    options.validate().unwrap();

    let (_, credentials) = resolve(&options.kubeconfig_path).await.unwrap();
    let clients = offline_clients();
    let mut bundle = CacheBundle::new(RESYNC_PERIOD);
    let caches = ControllerCaches::watch(&mut bundle, &clients);
    assert_eq!(bundle.len(), 4);

    let dispatch = capture.subscriber();
    tracing::dispatcher::with_default(&dispatch, || {
        ReconcilerSet::build(&options, &clients, &caches, credentials)
    })
}

#[tokio::test]
async fn test_no_sync_mode_builds_two_controllers_and_logs_once() {
    let capture = LogCapture::default();
    let set = build_with(&[], &capture).await.unwrap();

    assert!(set.syncer.is_none());
    assert_eq!(capture.count(SYNCER_DISABLED_MESSAGE), 1);

    let reconcilers = set.into_reconcilers();
    assert_eq!(reconcilers.len(), 2);
    let names: Vec<&str> = reconcilers.iter().map(|r| r.name()).collect();
    assert_eq!(names, vec!["api-importer", "api-resource"]);
}

#[tokio::test]
async fn test_push_mode_builds_three_controllers() {
    let capture = LogCapture::default();
    let set = build_with(&["--push-mode"], &capture).await.unwrap();

    assert_eq!(capture.count(SYNCER_DISABLED_MESSAGE), 0);

    let reconcilers = set.into_reconcilers();
    assert_eq!(reconcilers.len(), 3);
    let names: Vec<&str> = reconcilers.iter().map(|r| r.name()).collect();
    assert_eq!(names, vec!["api-importer", "api-resource", "syncer"]);
}

#[tokio::test]
async fn test_pull_mode_builds_three_controllers() {
    let capture = LogCapture::default();
    let set = build_with(&["--pull-mode", "--syncer-image", "kcp-syncer:latest"], &capture)
        .await
        .unwrap();

    assert!(set.syncer.is_some());
    assert_eq!(set.into_reconcilers().len(), 3);
}

#[tokio::test]
async fn test_zero_workers_fails_construction() {
    let file = write_kubeconfig("admin", "http://127.0.0.1:1");
    let options = Options::try_parse_from([
        "cluster-controller",
        "--kubeconfig",
        file.path().to_str().unwrap(),
        "--apiresource-workers",
        "0",
    ])
    .unwrap();

    let (_, credentials) = resolve(&options.kubeconfig_path).await.unwrap();
    let clients = offline_clients();
    let mut bundle = CacheBundle::new(RESYNC_PERIOD);
    let caches = ControllerCaches::watch(&mut bundle, &clients);

    let result = ReconcilerSet::build(&options, &clients, &caches, credentials);
    assert!(matches!(
        result,
        Err(ControllerError::ControllerConstruction { controller: "api-resource", .. })
    ));
}
