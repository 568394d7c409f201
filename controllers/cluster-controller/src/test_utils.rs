//! Test utilities for unit testing the controller
//!
//! Builders for test objects, kubeconfig files and clients that never reach a server.

#[cfg(test)]
use crate::cache::{reflect, CachedResource, WatchCache};
#[cfg(test)]
use crate::clients::ClientBundle;
#[cfg(test)]
use crds::*;
#[cfg(test)]
use futures::channel::mpsc;
#[cfg(test)]
use futures::StreamExt;
#[cfg(test)]
use kube::Client;
#[cfg(test)]
use kube_runtime::watcher;
#[cfg(test)]
use std::io::Write;
#[cfg(test)]
use std::sync::{Arc, Mutex};

/// Kubeconfig YAML with a single context named `context` pointing at `server`
#[cfg(test)]
pub fn kubeconfig_yaml(context: &str, server: &str) -> String {
    format!(
        "apiVersion: v1
kind: Config
current-context: {context}
clusters:
- name: {context}
  cluster:
    server: {server}
contexts:
- name: {context}
  context:
    cluster: {context}
    user: {context}
users:
- name: {context}
  user:
    token: test-token
"
    )
}

/// Writes a kubeconfig to a temp file that is removed when dropped
#[cfg(test)]
pub fn write_kubeconfig(context: &str, server: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .prefix("valid")
        .suffix(".kubeconfig")
        .tempfile()
        .unwrap();
    file.write_all(kubeconfig_yaml(context, server).as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// Helper to create test WorkloadCluster CRD
#[cfg(test)]
pub fn workload_cluster(name: &str) -> WorkloadCluster {
    WorkloadCluster::new(name, WorkloadClusterSpec::default())
}

/// Helper to create test APIResourceImport CRD (version v1)
#[cfg(test)]
pub fn api_resource_import(location: &str, group: &str, plural: &str) -> APIResourceImport {
    APIResourceImport::new(
        &format!("{}.{}", plural, location),
        APIResourceImportSpec {
            location: location.to_string(),
            group_version: GroupVersion {
                group: group.to_string(),
                version: "v1".to_string(),
            },
            plural: plural.to_string(),
            kind: "Deployment".to_string(),
            scope: ResourceScope::Namespaced,
        },
    )
}

/// Client for a port nothing listens on. Must be called inside a tokio runtime.
#[cfg(test)]
pub fn offline_client() -> Client {
    Client::try_from(kube::Config::new("http://127.0.0.1:1".parse().unwrap())).unwrap()
}

#[cfg(test)]
pub fn offline_clients() -> ClientBundle {
    ClientBundle {
        kcp: offline_client(),
        crd: offline_client(),
    }
}

/// Starts `cache` on a channel instead of a watcher. Dropping the sender stops it.
#[cfg(test)]
pub fn feed<K: CachedResource>(cache: &WatchCache<K>) -> mpsc::UnboundedSender<watcher::Event<K>> {
    let (tx, rx) = mpsc::unbounded();
    let writer = cache.take_writer().expect("cache already started");
    tokio::spawn(reflect(cache.kind(), writer, rx.map(Ok)));
    tx
}

/// Polls `condition` until it holds, failing the test after five seconds.
#[cfg(test)]
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let reached = async {
        while !condition() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(std::time::Duration::from_secs(5), reached)
        .await
        .expect("condition not reached in time");
}

/// Collects formatted log output for assertions
#[cfg(test)]
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl LogCapture {
    /// A subscriber writing plain, uncolored lines into this capture
    pub fn subscriber(&self) -> tracing::Dispatch {
        let capture = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || capture.clone())
            .finish();
        tracing::Dispatch::new(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Number of captured lines containing `needle`
    pub fn count(&self, needle: &str) -> usize {
        self.contents().lines().filter(|line| line.contains(needle)).count()
    }
}

#[cfg(test)]
impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
