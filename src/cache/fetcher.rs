//! Fetch coordination: freshness checks and single-flight loading.

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::error::{CacheError, RemoteError, Result};
use super::key::{CacheKey, KeyPattern};
use super::lock;
use super::store::EntityStore;
use super::traits::{decode_value, EntryStatus};

/// Stale time used when neither the caller nor the configuration picks one.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(60);

/// Per-fetch options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
  /// How long successful data is served without calling the loader
  pub stale_time: Duration,
}

impl FetchOptions {
  pub fn with_stale_time(stale_time: Duration) -> Self {
    Self { stale_time }
  }

  /// Always call the loader unless a fetch is already in flight.
  pub fn always_fetch() -> Self {
    Self::with_stale_time(Duration::ZERO)
  }
}

impl Default for FetchOptions {
  fn default() -> Self {
    Self::with_stale_time(DEFAULT_STALE_TIME)
  }
}

type LoadFuture = BoxFuture<'static, Result<Value>>;

struct InFlight {
  id: u64,
  handle: WeakShared<LoadFuture>,
}

#[derive(Default)]
struct InFlightMap {
  next_id: u64,
  by_key: HashMap<CacheKey, InFlight>,
}

impl InFlightMap {
  fn remove_if(&mut self, key: &CacheKey, id: u64) {
    if self.by_key.get(key).map(|f| f.id) == Some(id) {
      self.by_key.remove(key);
    }
  }
}

enum Resolved {
  Cached(Value),
  Pending(Shared<LoadFuture>),
}

/// Resolves keys from the store or from one shared loader call per key.
///
/// The in-flight map only holds weak handles: once every caller waiting on a fetch
/// has gone away, the loader future is dropped, which cancels the remote call.
pub struct FetchCoordinator {
  store: Arc<EntityStore>,
  in_flight: Arc<Mutex<InFlightMap>>,
}

impl FetchCoordinator {
  pub fn new(store: Arc<EntityStore>) -> Self {
    Self {
      store,
      in_flight: Arc::new(Mutex::new(InFlightMap::default())),
    }
  }

  pub fn store(&self) -> &Arc<EntityStore> {
    &self.store
  }

  /// Fetch `key` as JSON.
  ///
  /// 1. Fresh successful data is returned without calling `loader`
  /// 2. A fetch already in flight for `key` is joined
  /// 3. Otherwise `loader` runs once and its outcome is written to the store
  pub async fn fetch_value<F, Fut>(
    &self,
    key: &CacheKey,
    loader: F,
    options: FetchOptions,
  ) -> Result<Value>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<Value, RemoteError>> + Send + 'static,
  {
    match self.resolve(key, loader, options)? {
      Resolved::Cached(data) => Ok(data),
      Resolved::Pending(shared) => shared.await,
    }
  }

  /// Fetch `key` and decode it into `T`.
  pub async fn fetch<T, F, Fut>(&self, key: &CacheKey, loader: F, options: FetchOptions) -> Result<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<T, RemoteError>> + Send + 'static,
  {
    let value = self
      .fetch_value(
        key,
        move || {
          let pending = loader();
          async move {
            let data = pending.await?;
            serde_json::to_value(&data).map_err(|e| RemoteError::new("encode", e.to_string()))
          }
        },
        options,
      )
      .await?;
    decode_value(key, value)
  }

  /// Invalidate `pattern` in the store and detach matching in-flight fetches, so the
  /// next fetch goes back to the server instead of joining an older request.
  pub fn invalidate(&self, pattern: &KeyPattern) -> Vec<CacheKey> {
    let touched = self.store.invalidate(pattern);
    let detached = {
      let mut in_flight = lock(&self.in_flight);
      let before = in_flight.by_key.len();
      in_flight.by_key.retain(|key, _| !pattern.matches(key));
      before - in_flight.by_key.len()
    };
    if detached > 0 {
      debug!(%pattern, detached, "detached in-flight fetches");
    }
    touched
  }

  /// Number of fetches that still have at least one waiter.
  pub fn in_flight_count(&self) -> usize {
    // Upgraded handles are dropped after the lock is released: dropping the last
    // one runs the load guard, which takes the same lock.
    let live: Vec<Shared<LoadFuture>> = lock(&self.in_flight)
      .by_key
      .values()
      .filter_map(|f| f.handle.upgrade())
      .collect();
    live.len()
  }

  /// Forget every in-flight fetch. Running loaders finish for their current waiters.
  pub fn clear(&self) {
    lock(&self.in_flight).by_key.clear();
  }

  fn resolve<F, Fut>(&self, key: &CacheKey, loader: F, options: FetchOptions) -> Result<Resolved>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<Value, RemoteError>> + Send + 'static,
  {
    if self.store.is_disposed() {
      return Err(CacheError::Disposed);
    }

    let entry = self.store.get(key);
    if entry.is_fresh(options.stale_time) {
      if let Some(data) = entry.data {
        debug!(%key, "cache hit");
        return Ok(Resolved::Cached(data));
      }
    }

    let mut in_flight = lock(&self.in_flight);
    if let Some(shared) = in_flight.by_key.get(key).and_then(|f| f.handle.upgrade()) {
      debug!(%key, "joining in-flight fetch");
      return Ok(Resolved::Pending(shared));
    }

    in_flight.next_id += 1;
    let id = in_flight.next_id;
    let shared = load(
      Arc::clone(&self.store),
      Arc::clone(&self.in_flight),
      key.clone(),
      id,
      loader,
    )
    .boxed()
    .shared();
    if let Some(handle) = shared.downgrade() {
      in_flight.by_key.insert(key.clone(), InFlight { id, handle });
    }
    debug!(%key, fingerprint = %key.fingerprint(), "cache miss, loading");
    Ok(Resolved::Pending(shared))
  }
}

/// Undoes the loading mark if the load future is dropped before it settles.
struct LoadGuard {
  store: Arc<EntityStore>,
  in_flight: Arc<Mutex<InFlightMap>>,
  key: CacheKey,
  id: u64,
  loading_version: u64,
  prior: EntryStatus,
  settled: bool,
}

impl LoadGuard {
  fn settle(mut self) {
    self.settled = true;
  }
}

impl Drop for LoadGuard {
  fn drop(&mut self) {
    lock(&self.in_flight).remove_if(&self.key, self.id);
    if self.settled {
      return;
    }

    let prior = self.prior;
    let outcome = self
      .store
      .finish_load(&self.key, self.loading_version, |entry| entry.with_status(prior));
    debug!(key = %self.key, ?outcome, "fetch abandoned by all waiters");
  }
}

async fn load<F, Fut>(
  store: Arc<EntityStore>,
  in_flight: Arc<Mutex<InFlightMap>>,
  key: CacheKey,
  id: u64,
  loader: F,
) -> Result<Value>
where
  F: FnOnce() -> Fut,
  Fut: Future<Output = std::result::Result<Value, RemoteError>>,
{
  let prior = store.get(&key).status;
  let loading_version = store.mark_loading(&key);
  let guard = LoadGuard {
    store: Arc::clone(&store),
    in_flight,
    key: key.clone(),
    id,
    loading_version,
    prior,
    settled: false,
  };

  let result = loader().await;

  // Anything written since the loading mark wins, unless it was rolled back to it.
  let outcome = match &result {
    Ok(data) => {
      let data = data.clone();
      store.finish_load(&key, loading_version, move |entry| entry.into_success(data))
    }
    Err(error) => {
      warn!(%key, %error, "fetch failed");
      let error = error.clone();
      store.finish_load(&key, loading_version, move |entry| entry.into_error(error))
    }
  };
  if !outcome.applied() {
    debug!(%key, ?outcome, "fetch result superseded by a newer write");
  }
  guard.settle();

  result.map_err(CacheError::Network)
}
