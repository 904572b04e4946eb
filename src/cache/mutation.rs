//! Mutation engine: optimistic patches, remote call, rollback or invalidation.

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::{CacheError, RemoteError, Result};
use super::fetcher::FetchCoordinator;
use super::key::{CacheKey, KeyPattern};
use super::store::EntityStore;
use super::traits::{CacheEntry, PatchOutcome};

type Updater = Box<dyn FnOnce(Option<&Value>) -> Result<Option<Value>> + Send>;
type RemoteCall<R> = Box<dyn FnOnce() -> BoxFuture<'static, std::result::Result<R, RemoteError>> + Send>;
type Confirm<R> = Box<dyn FnOnce(&R, Option<&Value>) -> Option<Value> + Send>;

/// Description of one write against the remote collaborator.
///
/// # Example
///
/// ```ignore
/// let mutation = Mutation::new(move || async move { api.create("members", body).await })
///   .named("create_member")
///   .invalidates(KeyPattern::any().param("teamId", 7));
/// client.mutate(mutation).await?;
/// ```
pub struct Mutation<R> {
  name: Cow<'static, str>,
  optimistic: Vec<(CacheKey, Updater)>,
  remote: RemoteCall<R>,
  confirmed: Vec<(CacheKey, Confirm<R>)>,
  invalidates: Vec<KeyPattern>,
}

impl<R: Send + 'static> Mutation<R> {
  /// Create a mutation around a deferred remote call.
  pub fn new<F, Fut>(remote: F) -> Self
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<R, RemoteError>> + Send + 'static,
  {
    Self {
      name: Cow::Borrowed("mutation"),
      optimistic: Vec::new(),
      remote: Box::new(move || remote().boxed()),
      confirmed: Vec::new(),
      invalidates: Vec::new(),
    }
  }

  /// Label used in log events.
  pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
    self.name = name.into();
    self
  }

  /// Rewrite `key` before the remote call.
  ///
  /// The updater gets the cached data (if any) and returns the optimistic value,
  /// `None` to leave the key alone, or an error to abort the whole mutation before
  /// anything is sent.
  pub fn optimistic<F>(mut self, key: CacheKey, update: F) -> Self
  where
    F: FnOnce(Option<&Value>) -> Result<Option<Value>> + Send + 'static,
  {
    self.optimistic.push((key, Box::new(update)));
    self
  }

  /// Write a value derived from the confirmed result into `key` on success.
  pub fn on_success<F>(mut self, key: CacheKey, confirm: F) -> Self
  where
    F: FnOnce(&R, Option<&Value>) -> Option<Value> + Send + 'static,
  {
    self.confirmed.push((key, Box::new(confirm)));
    self
  }

  /// Invalidate every key under `pattern` once the remote call succeeds.
  pub fn invalidates(mut self, pattern: KeyPattern) -> Self {
    self.invalidates.push(pattern);
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

impl<R> std::fmt::Debug for Mutation<R> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Mutation")
      .field("name", &self.name)
      .field(
        "optimistic",
        &self.optimistic.iter().map(|(k, _)| k).collect::<Vec<_>>(),
      )
      .field(
        "confirmed",
        &self.confirmed.iter().map(|(k, _)| k).collect::<Vec<_>>(),
      )
      .field("invalidates", &self.invalidates)
      .finish_non_exhaustive()
  }
}

/// A key rewritten by an in-progress mutation.
struct Touched {
  key: CacheKey,
  /// Entry as it was before the first optimistic write
  snapshot: CacheEntry,
  /// Version produced by the latest optimistic write
  version: u64,
}

/// Snapshots of optimistically patched keys. Restores them on drop unless confirmed,
/// which covers both remote failure and the mutation future being dropped.
struct Rollback {
  store: Arc<EntityStore>,
  name: Cow<'static, str>,
  touched: Vec<Touched>,
}

impl Rollback {
  fn record(&mut self, key: CacheKey, snapshot: CacheEntry, version: u64) {
    match self.touched.iter_mut().find(|t| t.key == key) {
      Some(existing) => existing.version = version,
      None => self.touched.push(Touched {
        key,
        snapshot,
        version,
      }),
    }
  }

  fn confirm(mut self) {
    self.touched.clear();
  }

  fn restore(&mut self) {
    for Touched {
      key,
      snapshot,
      version,
    } in self.touched.drain(..).rev()
    {
      match self.store.restore(&key, version, snapshot) {
        PatchOutcome::Applied { .. } => debug!(mutation = %self.name, %key, "rolled back"),
        outcome => debug!(mutation = %self.name, %key, ?outcome, "rollback skipped, newer write kept"),
      }
    }
  }
}

impl Drop for Rollback {
  fn drop(&mut self) {
    if !self.touched.is_empty() {
      self.restore();
    }
  }
}

/// Runs [`Mutation`]s against the store.
pub struct MutationEngine {
  fetcher: Arc<FetchCoordinator>,
}

impl MutationEngine {
  pub fn new(fetcher: Arc<FetchCoordinator>) -> Self {
    Self { fetcher }
  }

  /// Execute `mutation`.
  ///
  /// 1. Apply optimistic patches against the versions just read
  /// 2. Call the remote collaborator
  /// 3. On success write confirmed values, then invalidate the declared patterns
  /// 4. On failure restore every patched key that nobody has written since, then
  ///    return the remote error
  pub async fn mutate<R: Send + 'static>(&self, mutation: Mutation<R>) -> Result<R> {
    let Mutation {
      name,
      optimistic,
      remote,
      confirmed,
      invalidates,
    } = mutation;
    let store = self.fetcher.store();
    if store.is_disposed() {
      return Err(CacheError::Disposed);
    }

    let mut rollback = Rollback {
      store: Arc::clone(store),
      name: name.clone(),
      touched: Vec::new(),
    };

    for (key, update) in optimistic {
      let current = store.get(&key);
      let next = match update(current.data.as_ref()) {
        Ok(Some(next)) => next,
        Ok(None) => continue,
        Err(error) => {
          warn!(mutation = %name, %key, %error, "optimistic update failed, nothing sent");
          return Err(error);
        }
      };

      match store.patch(&key, current.version, move |entry| entry.into_success(next)) {
        PatchOutcome::Applied { version } => rollback.record(key, current, version),
        outcome => debug!(mutation = %name, %key, ?outcome, "optimistic patch not applied"),
      }
    }

    match remote().await {
      Ok(value) => {
        rollback.confirm();
        for (key, confirm) in confirmed {
          let current = store.get(&key);
          if let Some(data) = confirm(&value, current.data.as_ref()) {
            store.set(&key, data);
          }
        }
        for pattern in &invalidates {
          self.fetcher.invalidate(pattern);
        }
        debug!(mutation = %name, "mutation confirmed");
        Ok(value)
      }
      Err(error) => {
        warn!(mutation = %name, %error, "mutation failed, rolling back");
        rollback.restore();
        Err(CacheError::Network(error))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::FetchOptions;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;
  use tokio::sync::oneshot;
  use tokio::task::JoinHandle;

  fn engine() -> (MutationEngine, Arc<FetchCoordinator>) {
    let fetcher = Arc::new(FetchCoordinator::new(Arc::new(EntityStore::default())));
    (MutationEngine::new(Arc::clone(&fetcher)), fetcher)
  }

  fn project(id: i64) -> CacheKey {
    CacheKey::builder("project").param("id", id).build().unwrap()
  }

  fn rename(name: &'static str) -> impl FnOnce(Option<&Value>) -> Result<Option<Value>> + Send {
    move |_| Ok(Some(json!({ "name": name })))
  }

  /// Bring `key` to version 3 holding `{name: "A"}`.
  fn seed(store: &EntityStore, key: &CacheKey) {
    store.set(key, json!({"name": "?"}));
    store.mark_loading(key);
    store.set(key, json!({"name": "A"}));
    assert_eq!(store.get(key).version, 3);
  }

  #[tokio::test]
  async fn test_failed_remote_restores_snapshot() {
    let (engine, fetcher) = engine();
    let store = fetcher.store();
    let key = project(1);
    seed(store, &key);
    let before = store.get(&key);

    let observed = Arc::new(std::sync::Mutex::new(None));
    let (reader, sink, k) = (Arc::clone(store), Arc::clone(&observed), key.clone());
    let result = engine
      .mutate(
        Mutation::new(move || async move {
          *sink.lock().unwrap() = reader.get(&k).data;
          Err::<(), _>(RemoteError::new("409", "name taken"))
        })
        .optimistic(key.clone(), rename("B")),
      )
      .await;

    assert_eq!(
      result.unwrap_err(),
      CacheError::Network(RemoteError::new("409", "name taken"))
    );
    assert_eq!(*observed.lock().unwrap(), Some(json!({"name": "B"})));
    let after = store.get(&key);
    assert_eq!(after.data, Some(json!({"name": "A"})));
    assert_eq!(after.status, before.status);
    assert_eq!(after.updated_at, before.updated_at);
    assert!(after.version > before.version);
  }

  #[tokio::test]
  async fn test_rollback_never_clobbers_newer_confirmed_write() {
    let (engine, fetcher) = engine();
    let store = fetcher.store();
    let key = project(1);
    seed(store, &key);

    let (writer, k) = (Arc::clone(store), key.clone());
    let result = engine
      .mutate(
        Mutation::new(move || async move {
          // A confirmed write for the same key lands while the request is out
          writer.set(&k, json!({"name": "C"}));
          Err::<(), _>(RemoteError::new("500", "boom"))
        })
        .optimistic(key.clone(), rename("B")),
      )
      .await;

    assert!(result.is_err());
    assert_eq!(store.get(&key).data, Some(json!({"name": "C"})));
  }

  #[tokio::test]
  async fn test_failing_updater_aborts_before_remote_call() {
    let (engine, fetcher) = engine();
    let store = fetcher.store();
    let (first, second) = (project(1), project(2));
    store.set(&first, json!({"name": "A"}));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let result = engine
      .mutate(
        Mutation::new(move || async move {
          counter.fetch_add(1, Ordering::SeqCst);
          Ok(())
        })
        .optimistic(first.clone(), rename("B"))
        .optimistic(second.clone(), |_| {
          Err(CacheError::OptimisticUpdate {
            key: "project?id=2".into(),
            reason: "not cached".into(),
          })
        }),
      )
      .await;

    assert!(matches!(result, Err(CacheError::OptimisticUpdate { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.get(&first).data, Some(json!({"name": "A"})));
  }

  #[tokio::test]
  async fn test_success_writes_confirmed_values_and_invalidates() {
    let (engine, fetcher) = engine();
    let store = fetcher.store();
    let detail = project(4);
    let list = CacheKey::builder("projects").param("teamId", 7).build().unwrap();
    let other_team = CacheKey::builder("projects").param("teamId", 8).build().unwrap();
    store.set(&list, json!([]));
    store.set(&other_team, json!([]));

    let created = engine
      .mutate(
        Mutation::new(|| async { Ok(json!({"id": 4, "name": "Roadmap"})) })
          .on_success(detail.clone(), |created, _| Some(created.clone()))
          .invalidates(KeyPattern::resource("projects").param("teamId", 7)),
      )
      .await
      .unwrap();

    assert_eq!(created["id"], 4);
    assert_eq!(store.get(&detail).data, Some(json!({"id": 4, "name": "Roadmap"})));
    assert!(store.get(&list).is_idle());
    assert!(store.get(&other_team).is_success());
  }

  #[tokio::test]
  async fn test_repeated_patches_restore_first_snapshot() {
    let (engine, fetcher) = engine();
    let store = fetcher.store();
    let key = project(1);
    store.set(&key, json!({"name": "A"}));

    let result = engine
      .mutate(
        Mutation::new(|| async { Err::<(), _>(RemoteError::new("500", "boom")) })
          .optimistic(key.clone(), rename("B"))
          .optimistic(key.clone(), rename("C")),
      )
      .await;

    assert!(result.is_err());
    assert_eq!(store.get(&key).data, Some(json!({"name": "A"})));
  }

  #[tokio::test]
  async fn test_declined_update_leaves_key_alone() {
    let (engine, fetcher) = engine();
    let store = fetcher.store();
    let key = project(9);

    engine
      .mutate(Mutation::new(|| async { Ok(()) }).optimistic(key.clone(), |_| Ok(None)))
      .await
      .unwrap();

    assert_eq!(store.get(&key).version, 0);
  }

  #[tokio::test]
  async fn test_dropped_mutation_rolls_back() {
    let (engine, fetcher) = engine();
    let engine = Arc::new(engine);
    let store = Arc::clone(fetcher.store());
    let key = project(1);
    store.set(&key, json!({"name": "A"}));

    let task = {
      let (engine, key) = (Arc::clone(&engine), key.clone());
      tokio::spawn(async move {
        engine
          .mutate(
            Mutation::new(|| async {
              futures::future::pending::<()>().await;
              Ok(())
            })
            .optimistic(key, rename("B")),
          )
          .await
      })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.get(&key).data, Some(json!({"name": "B"})));

    task.abort();
    let _ = task.await;
    assert_eq!(store.get(&key).data, Some(json!({"name": "A"})));
  }

  /// Start a fetch of `key` that resolves with whatever is sent on the returned sender.
  async fn gated_fetch(
    fetcher: &Arc<FetchCoordinator>,
    key: &CacheKey,
  ) -> (oneshot::Sender<Value>, JoinHandle<Result<Value>>) {
    let (release, gate) = oneshot::channel::<Value>();
    let (coordinator, k) = (Arc::clone(fetcher), key.clone());
    let task = tokio::spawn(async move {
      let loader =
        move || async move { gate.await.map_err(|_| RemoteError::new("closed", "loader gate dropped")) };
      coordinator.fetch_value(&k, loader, FetchOptions::always_fetch()).await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(fetcher.store().get(key).is_loading());
    (release, task)
  }

  /// Start a rename of `key` to `name` whose remote call answers with whatever is sent.
  async fn gated_rename(
    engine: &Arc<MutationEngine>,
    key: &CacheKey,
    name: &'static str,
  ) -> (oneshot::Sender<std::result::Result<(), RemoteError>>, JoinHandle<Result<()>>) {
    let (answer, gate) = oneshot::channel();
    let (engine, k) = (Arc::clone(engine), key.clone());
    let task = tokio::spawn(async move {
      let remote = move || async move {
        gate
          .await
          .unwrap_or_else(|_| Err(RemoteError::new("closed", "remote gate dropped")))
      };
      engine.mutate(Mutation::new(remote).optimistic(k, rename(name))).await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    (answer, task)
  }

  fn shared_engine() -> (Arc<MutationEngine>, Arc<FetchCoordinator>) {
    let (engine, fetcher) = engine();
    (Arc::new(engine), fetcher)
  }

  #[tokio::test]
  async fn test_failed_mutation_during_fetch_lets_fetch_land() {
    let (engine, fetcher) = shared_engine();
    let store = fetcher.store();
    let key = project(1);
    store.set(&key, json!({"name": "A"}));

    let (release, fetch) = gated_fetch(&fetcher, &key).await;
    let (answer, mutation) = gated_rename(&engine, &key, "B").await;
    assert_eq!(store.get(&key).data, Some(json!({"name": "B"})));

    answer.send(Err(RemoteError::new("409", "name taken"))).unwrap();
    assert!(mutation.await.unwrap().is_err());
    let rolled_back = store.get(&key);
    assert!(rolled_back.is_loading());
    assert_eq!(rolled_back.data, Some(json!({"name": "A"})));

    release.send(json!({"name": "server"})).unwrap();
    assert_eq!(fetch.await.unwrap().unwrap(), json!({"name": "server"}));
    let settled = store.get(&key);
    assert!(settled.is_success());
    assert_eq!(settled.data, Some(json!({"name": "server"})));
    assert_eq!(fetcher.in_flight_count(), 0);
  }

  #[tokio::test]
  async fn test_failed_mutation_after_fetch_leaves_key_refetchable() {
    let (engine, fetcher) = shared_engine();
    let store = fetcher.store();
    let key = project(1);
    store.set(&key, json!({"name": "A"}));

    let (release, fetch) = gated_fetch(&fetcher, &key).await;
    let (answer, mutation) = gated_rename(&engine, &key, "B").await;

    // The fetch settles under the optimistic value; waiters still get the result
    release.send(json!({"name": "server"})).unwrap();
    assert_eq!(fetch.await.unwrap().unwrap(), json!({"name": "server"}));
    assert_eq!(store.get(&key).data, Some(json!({"name": "B"})));

    answer.send(Err(RemoteError::new("500", "boom"))).unwrap();
    assert!(mutation.await.unwrap().is_err());
    let rolled_back = store.get(&key);
    assert!(rolled_back.is_idle());
    assert_eq!(rolled_back.data, Some(json!({"name": "A"})));
    assert_eq!(fetcher.in_flight_count(), 0);

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let loader = move || async move {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(json!({"name": "fresh"}))
    };
    let value = fetcher.fetch_value(&key, loader, FetchOptions::default()).await.unwrap();
    assert_eq!(value, json!({"name": "fresh"}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_confirmed_mutation_outlives_later_fetch_result() {
    let (engine, fetcher) = shared_engine();
    let store = fetcher.store();
    let key = project(1);
    store.set(&key, json!({"name": "A"}));

    let (release, fetch) = gated_fetch(&fetcher, &key).await;
    let (answer, mutation) = gated_rename(&engine, &key, "B").await;
    answer.send(Ok(())).unwrap();
    mutation.await.unwrap().unwrap();

    release.send(json!({"name": "server"})).unwrap();
    assert_eq!(fetch.await.unwrap().unwrap(), json!({"name": "server"}));
    let entry = store.get(&key);
    assert!(entry.is_success());
    assert_eq!(entry.data, Some(json!({"name": "B"})));
    assert_eq!(fetcher.in_flight_count(), 0);
  }

  #[tokio::test]
  async fn test_confirmed_mutation_after_fetch_keeps_optimistic_value() {
    let (engine, fetcher) = shared_engine();
    let store = fetcher.store();
    let key = project(1);
    store.set(&key, json!({"name": "A"}));

    let (release, fetch) = gated_fetch(&fetcher, &key).await;
    let (answer, mutation) = gated_rename(&engine, &key, "B").await;
    release.send(json!({"name": "server"})).unwrap();
    assert_eq!(fetch.await.unwrap().unwrap(), json!({"name": "server"}));

    answer.send(Ok(())).unwrap();
    mutation.await.unwrap().unwrap();
    let entry = store.get(&key);
    assert!(entry.is_success());
    assert_eq!(entry.data, Some(json!({"name": "B"})));
  }

  #[tokio::test]
  async fn test_invalidated_key_refetches() {
    let (engine, fetcher) = engine();
    let key = CacheKey::builder("members").param("teamId", 7).build().unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let load = |calls: &Arc<AtomicU32>| {
      let calls = Arc::clone(calls);
      move || async move { Ok(json!(calls.fetch_add(1, Ordering::SeqCst))) }
    };
    fetcher.fetch_value(&key, load(&calls), FetchOptions::default()).await.unwrap();
    fetcher.fetch_value(&key, load(&calls), FetchOptions::default()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    engine
      .mutate(
        Mutation::new(|| async { Ok(()) }).invalidates(KeyPattern::any().param("teamId", 7)),
      )
      .await
      .unwrap();
    assert!(fetcher.store().get(&key).is_idle());

    let value = fetcher.fetch_value(&key, load(&calls), FetchOptions::default()).await.unwrap();
    assert_eq!(value, json!(1));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }
}
