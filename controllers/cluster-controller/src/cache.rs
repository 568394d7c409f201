//! Watch caches and the cache-sync barrier.
//!
//! Each `WatchCache` is a shared kube-runtime reflector store kept up to date
//! by a background watcher. Creating a cache only arms it; `CacheBundle::start`
//! spawns the reflection tasks. Controllers must not run until
//! `CacheBundle::wait_for_sync` returns `true`.
//!
//! Controllers subscribe to a cache before it starts. Every resync period the
//! watcher is restarted, which relists the collection and hands every cached
//! object to the subscribers again.

use futures::future::{BoxFuture, join_all};
use futures::{Stream, StreamExt, stream};
use kube::{Api, Resource};
use kube_runtime::reflector::{self, ObjectRef, ReflectHandle, Store, store::Writer};
use kube_runtime::watcher;
use kube_runtime::WatchStreamExt;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Resync period for every watch cache.
pub const RESYNC_PERIOD: Duration = Duration::from_secs(10 * 60 * 60);

/// Change notifications buffered per cache before the watcher waits for slow subscribers.
const EVENT_BUFFER: usize = 1024;

/// Resources that can be held in a watch cache.
pub trait CachedResource:
    Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
}

impl<K> CachedResource for K where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
}

/// Read handle to a locally replicated collection.
///
/// Cheap to clone; all clones share the same store. The writer stays with
/// the cache until its reflection task takes it.
pub struct WatchCache<K: CachedResource> {
    kind: &'static str,
    store: Store<K>,
    writer: Arc<Mutex<Option<Writer<K>>>>,
}

impl<K: CachedResource> Clone for WatchCache<K> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            store: self.store.clone(),
            writer: self.writer.clone(),
        }
    }
}

impl<K: CachedResource> WatchCache<K> {
    /// Creates an empty, unsynced cache.
    pub(crate) fn new(kind: &'static str) -> Self {
        let (store, writer) = reflector::store_shared(EVENT_BUFFER);
        Self {
            kind,
            store,
            writer: Arc::new(Mutex::new(Some(writer))),
        }
    }

    /// Kind name used in logs.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Looks up a cluster-scoped object by name.
    pub fn get(&self, name: &str) -> Option<Arc<K>> {
        self.store.get(&ObjectRef::new(name))
    }

    /// Snapshot of every cached object.
    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    /// The underlying reader, for binding a `kube_runtime::Controller`.
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Subscribes to applied objects, and to every cached object each time a listing completes.
    ///
    /// Returns `None` once the cache has started; subscriptions must be taken
    /// while controllers are being constructed. A subscriber that is never
    /// polled eventually stalls the watcher, so drop handles that go unused.
    pub fn subscribe(&self) -> Option<ReflectHandle<K>> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Writer::subscribe)
    }

    /// Hands the writer to a reflection task. Only the first call gets it.
    pub(crate) fn take_writer(&self) -> Option<Writer<K>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Resolves once the initial listing has completed.
    ///
    /// Returns `false` if the writer was dropped before that happened.
    pub async fn wait_synced(&self) -> bool {
        self.store.wait_until_ready().await.is_ok()
    }
}

/// Applies `events` to the store behind `writer` and notifies subscribers, until `events` ends.
pub(crate) async fn reflect<K, S>(kind: &'static str, writer: Writer<K>, events: S)
where
    K: CachedResource,
    S: Stream<Item = watcher::Result<watcher::Event<K>>>,
{
    reflector::reflector(writer, events)
        .for_each(|event| async move {
            match event {
                Ok(watcher::Event::InitDone) => debug!("{} cache listed", kind),
                Ok(_) => {}
                // The backoff retries the watch; the error is only informational
                Err(e) => warn!("{} watch error: {}", kind, e),
            }
        })
        .await;
}

/// Watcher events for `api`, restarting the watch (a full relist) every `resync_period`.
fn watch_events<K: CachedResource>(
    kind: &'static str,
    api: Api<K>,
    resync_period: Duration,
) -> impl Stream<Item = watcher::Result<watcher::Event<K>>> + Send {
    let mut listings = 0u64;
    stream::repeat_with(move || {
        if listings > 0 {
            debug!("Resyncing {} watch cache", kind);
        }
        listings += 1;
        watcher(api.clone(), watcher::Config::default())
            .default_backoff()
            .take_until(tokio::time::sleep(resync_period))
    })
    .flatten()
}

/// Something the cache-sync barrier can wait on.
pub trait HasSynced: Send + Sync {
    fn kind(&self) -> &'static str;
    fn wait_synced(&self) -> BoxFuture<'_, bool>;
}

impl<K: CachedResource> HasSynced for WatchCache<K> {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn wait_synced(&self) -> BoxFuture<'_, bool> {
        Box::pin(WatchCache::wait_synced(self))
    }
}

/// Blocks until every cache has synced, or returns `false` as soon as `token` fires.
pub async fn wait_for_cache_sync(caches: &[Box<dyn HasSynced>], token: &CancellationToken) -> bool {
    let all_synced = join_all(caches.iter().map(|cache| async move {
        let synced = cache.wait_synced().await;
        if synced {
            debug!("{} cache synced", cache.kind());
        } else {
            warn!("{} cache stopped before syncing", cache.kind());
        }
        synced
    }));

    tokio::select! {
        biased;
        () = token.cancelled() => {
            info!("Shutdown requested before caches synced");
            false
        }
        results = all_synced => results.into_iter().all(|synced| synced),
    }
}

type Reflection = Box<dyn FnOnce(CancellationToken) -> Option<BoxFuture<'static, ()>> + Send>;

/// All watch caches of the process, armed but not running until `start`.
pub struct CacheBundle {
    resync_period: Duration,
    pending: Vec<Reflection>,
    caches: Vec<Box<dyn HasSynced>>,
}

impl CacheBundle {
    pub fn new(resync_period: Duration) -> Self {
        Self {
            resync_period,
            pending: Vec::new(),
            caches: Vec::new(),
        }
    }

    /// Arms a watch cache over `api`. Nothing is listed until `start`.
    pub fn watch<K: CachedResource>(&mut self, kind: &'static str, api: Api<K>) -> WatchCache<K> {
        let cache = WatchCache::new(kind);
        let armed = cache.clone();
        let resync_period = self.resync_period;
        self.pending.push(Box::new(move |token| {
            let writer = armed.take_writer()?;
            let events = watch_events(kind, api, resync_period).take_until(token.cancelled_owned());
            let task: BoxFuture<'static, ()> = Box::pin(async move {
                info!("Starting {} watch cache", kind);
                reflect(kind, writer, events).await;
                debug!("{} watch cache stopped", kind);
            });
            Some(task)
        }));
        self.caches.push(Box::new(cache.clone()));
        cache
    }

    /// Registers a cache fed by something other than a watcher.
    #[cfg(test)]
    pub(crate) fn track<K: CachedResource>(&mut self, cache: &WatchCache<K>) {
        self.caches.push(Box::new(cache.clone()));
    }

    /// Number of caches the barrier waits on.
    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    /// Spawns every armed cache's reflection task. Tasks stop when `token` fires.
    pub fn start(&mut self, token: &CancellationToken) {
        for reflection in self.pending.drain(..) {
            match reflection(token.clone()) {
                Some(task) => {
                    tokio::spawn(task);
                }
                None => warn!("Skipping a watch cache whose writer was already taken"),
            }
        }
    }

    /// The cache-sync barrier over every cache in the bundle.
    pub async fn wait_for_sync(&self, token: &CancellationToken) -> bool {
        wait_for_cache_sync(&self.caches, token).await
    }
}
