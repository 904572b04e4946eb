//! Query client: the owned cache instance and its consumer bindings.
//!
//! Inspired by TanStack Query. A [`QueryClient`] is created once, handed to every
//! consumer, and disposed at shutdown. Reads go through [`EntityQuery`], writes
//! through [`QueryClient::mutate`].
//!
//! # Example
//!
//! ```ignore
//! let client = QueryClient::create(config.cache.clone());
//! let api = api.clone();
//! let mut members = client.use_entity(key, move || {
//!     let api = api.clone();
//!     async move { api.members(7).await }
//! }, client.options_for(&key));
//!
//! // Start fetching
//! members.fetch();
//!
//! // In event loop tick
//! if members.poll() {
//!     // Entry changed, trigger re-render
//! }
//!
//! // In render
//! match members.entry().status {
//!     EntryStatus::Loading => render_spinner(),
//!     EntryStatus::Success => render_data(members.data()?),
//!     EntryStatus::Error => render_error(members.error()),
//!     EntryStatus::Idle => {}
//! }
//! ```

use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::{
  CacheEntry, CacheKey, EntityStore, FetchCoordinator, FetchOptions, KeyPattern,
  Mutation, MutationEngine, NotificationBus, RemoteError, Result, Subscription,
};
use crate::config::CacheConfig;

struct ClientInner {
  config: CacheConfig,
  fetcher: Arc<FetchCoordinator>,
  mutations: MutationEngine,
}

/// Process-wide cache handle. Cheap to clone; all clones share one store.
#[derive(Clone)]
pub struct QueryClient {
  inner: Arc<ClientInner>,
}

impl QueryClient {
  /// Create an empty cache.
  pub fn create(config: CacheConfig) -> Self {
    let store = Arc::new(EntityStore::new(NotificationBus::new()));
    let fetcher = Arc::new(FetchCoordinator::new(store));
    let mutations = MutationEngine::new(Arc::clone(&fetcher));
    debug!(stale_time_ms = config.stale_time_ms, "query client created");

    Self {
      inner: Arc::new(ClientInner {
        config,
        fetcher,
        mutations,
      }),
    }
  }

  /// Tear the cache down: entries and subscribers are dropped and every later
  /// fetch or mutation fails with `Disposed`.
  pub fn dispose(&self) {
    self.store().dispose();
    self.inner.fetcher.clear();
  }

  pub fn is_disposed(&self) -> bool {
    self.store().is_disposed()
  }

  pub fn config(&self) -> &CacheConfig {
    &self.inner.config
  }

  /// Fetch options configured for the resource of `key`.
  pub fn options_for(&self, key: &CacheKey) -> FetchOptions {
    FetchOptions::with_stale_time(self.inner.config.stale_time_for(key.resource()))
  }

  /// Read-only view of the entry for `key`.
  pub fn get(&self, key: &CacheKey) -> CacheEntry {
    self.store().get(key)
  }

  /// Keys currently held in the cache.
  pub fn cached_keys(&self) -> Vec<CacheKey> {
    self.store().keys()
  }

  pub fn subscribe<F>(&self, key: CacheKey, callback: F) -> Subscription
  where
    F: Fn(&CacheEntry) + Send + Sync + 'static,
  {
    self.store().bus().subscribe(key, callback)
  }

  pub fn watch(&self, key: CacheKey) -> (Subscription, mpsc::UnboundedReceiver<CacheEntry>) {
    self.store().bus().watch(key)
  }

  /// Fetch and decode `key` with the configured stale time for its resource.
  pub async fn fetch<T, F, Fut>(&self, key: &CacheKey, loader: F) -> Result<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<T, RemoteError>> + Send + 'static,
  {
    let options = self.options_for(key);
    self.inner.fetcher.fetch(key, loader, options).await
  }

  pub async fn fetch_with<T, F, Fut>(&self, key: &CacheKey, loader: F, options: FetchOptions) -> Result<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<T, RemoteError>> + Send + 'static,
  {
    self.inner.fetcher.fetch(key, loader, options).await
  }

  pub async fn fetch_value<F, Fut>(&self, key: &CacheKey, loader: F, options: FetchOptions) -> Result<Value>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<Value, RemoteError>> + Send + 'static,
  {
    self.inner.fetcher.fetch_value(key, loader, options).await
  }

  /// Mark everything under `pattern` for refetch, keeping the stale data visible.
  pub fn invalidate(&self, pattern: &KeyPattern) -> Vec<CacheKey> {
    self.inner.fetcher.invalidate(pattern)
  }

  /// Write binding: run `mutation` with optimistic patching and rollback.
  pub async fn mutate<R: Send + 'static>(&self, mutation: Mutation<R>) -> Result<R> {
    self.inner.mutations.mutate(mutation).await
  }

  /// Read binding for one key.
  ///
  /// The returned query observes `key` immediately; call [`EntityQuery::fetch`] to
  /// load it.
  pub fn use_entity<T, F, Fut>(&self, key: CacheKey, loader: F, options: FetchOptions) -> EntityQuery<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, RemoteError>> + Send + 'static,
  {
    let loader: LoaderFn = Arc::new(move || {
      let pending = loader();
      async move {
        let data = pending.await?;
        serde_json::to_value(&data).map_err(|e| RemoteError::new("encode", e.to_string()))
      }
      .boxed()
    });

    let (subscription, changes) = self.watch(key.clone());
    let entry = self.get(&key);
    EntityQuery {
      client: self.clone(),
      refetch_on_invalidate: self.inner.config.refetch_on_invalidate,
      key,
      loader,
      options,
      entry,
      changes,
      subscription,
      task: None,
      _marker: PhantomData,
    }
  }

  fn store(&self) -> &Arc<EntityStore> {
    self.inner.fetcher.store()
  }
}

impl std::fmt::Debug for QueryClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryClient")
      .field("config", &self.inner.config)
      .field("entries", &self.store().len())
      .field("disposed", &self.is_disposed())
      .finish()
  }
}

/// A factory function that creates futures for fetching JSON data
type LoaderFn = Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<Value, RemoteError>> + Send + Sync>;

/// Observed view of one cache key.
///
/// EntityQuery<T> encapsulates:
/// - The fetching logic (via a closure)
/// - The latest entry for its key, refreshed from change notifications
/// - A background fetch that is cancelled when the query is dropped
pub struct EntityQuery<T> {
  client: QueryClient,
  key: CacheKey,
  loader: LoaderFn,
  options: FetchOptions,
  entry: CacheEntry,
  changes: mpsc::UnboundedReceiver<CacheEntry>,
  subscription: Subscription,
  task: Option<JoinHandle<()>>,
  refetch_on_invalidate: bool,
  _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> EntityQuery<T> {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Latest entry seen for the key.
  pub fn entry(&self) -> &CacheEntry {
    &self.entry
  }

  /// Decoded data, if any is cached (possibly stale or alongside an error).
  pub fn data(&self) -> Result<Option<T>> {
    self.entry.decode(&self.key)
  }

  pub fn error(&self) -> Option<&RemoteError> {
    self.entry.error.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    self.entry.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.entry.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.entry.is_error()
  }

  /// Start fetching in the background unless this query already is.
  pub fn fetch(&mut self) {
    if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
      return;
    }
    self.spawn_fetch(self.options);
  }

  /// Fetch again regardless of staleness, replacing this query's own pending fetch.
  pub fn refetch(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
    self.spawn_fetch(FetchOptions::always_fetch());
  }

  /// Drain change notifications.
  ///
  /// Returns `true` if the entry changed. Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    while let Ok(entry) = self.changes.try_recv() {
      changed |= self.accept(entry);
    }
    if changed {
      self.refetch_if_invalidated();
    }
    changed
  }

  /// Wait for the next change. Returns `None` once the client is disposed.
  pub async fn changed(&mut self) -> Option<&CacheEntry> {
    loop {
      let entry = self.changes.recv().await?;
      if self.accept(entry) {
        break;
      }
    }
    self.refetch_if_invalidated();
    Some(&self.entry)
  }

  /// Keep `entry` if it is newer than the one held. Writers notify after releasing
  /// the store lock, so deliveries from different tasks can arrive out of order.
  fn accept(&mut self, entry: CacheEntry) -> bool {
    if entry.version <= self.entry.version {
      debug!(
        key = %self.key,
        version = entry.version,
        held = self.entry.version,
        "stale notification ignored"
      );
      return false;
    }
    self.entry = entry;
    true
  }

  /// Stop observing and cancel any pending fetch.
  pub fn close(&mut self) {
    self.subscription.unsubscribe();
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }

  fn refetch_if_invalidated(&mut self) {
    if self.refetch_on_invalidate && self.entry.is_idle() && self.subscription.is_active() {
      debug!(key = %self.key, "observed entry invalidated, refetching");
      self.fetch();
    }
  }

  fn spawn_fetch(&mut self, options: FetchOptions) {
    let client = self.client.clone();
    let key = self.key.clone();
    let loader = Arc::clone(&self.loader);
    self.task = Some(tokio::spawn(async move {
      // Outcome is recorded in the entry and reaches us through the subscription
      let _ = client.fetch_value(&key, move || loader(), options).await;
    }));
  }
}

impl<T> Drop for EntityQuery<T> {
  fn drop(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}

impl<T> std::fmt::Debug for EntityQuery<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EntityQuery")
      .field("key", &self.key)
      .field("entry", &self.entry)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}
