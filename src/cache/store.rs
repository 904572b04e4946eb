//! Entity store: the single owner of every cache entry.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, trace};

use super::bus::NotificationBus;
use super::error::RemoteError;
use super::key::{CacheKey, KeyPattern};
use super::lock;
use super::traits::{CacheEntry, EntryStatus, PatchOutcome};

#[derive(Default)]
struct StoreState {
  entries: HashMap<CacheKey, CacheEntry>,
  /// Loading mark of the fetch that currently owns each key
  loads: HashMap<CacheKey, u64>,
  /// Last version handed out; shared by all keys so versions are never reused
  last_version: u64,
  disposed: bool,
}

impl StoreState {
  fn next_version(&mut self) -> u64 {
    self.last_version += 1;
    self.last_version
  }

  fn version_of(&self, key: &CacheKey) -> u64 {
    self.entries.get(key).map(|e| e.version).unwrap_or(0)
  }

  fn current(&self, key: &CacheKey) -> CacheEntry {
    self.entries.get(key).cloned().unwrap_or_else(CacheEntry::idle)
  }

  /// Store `next` under a fresh version.
  fn commit(&mut self, key: &CacheKey, mut next: CacheEntry) -> CacheEntry {
    next.version = self.next_version();
    self.entries.insert(key.clone(), next.clone());
    next
  }
}

/// In-memory map from cache key to entry.
///
/// Every write bumps the entry's version and is announced on the bus once the store
/// lock has been released, so subscribers may read the store from their callback.
pub struct EntityStore {
  state: Mutex<StoreState>,
  bus: NotificationBus,
}

impl EntityStore {
  pub fn new(bus: NotificationBus) -> Self {
    Self {
      state: Mutex::new(StoreState::default()),
      bus,
    }
  }

  pub fn bus(&self) -> &NotificationBus {
    &self.bus
  }

  /// Current entry for `key`, or an idle entry if nothing is cached.
  pub fn get(&self, key: &CacheKey) -> CacheEntry {
    lock(&self.state)
      .entries
      .get(key)
      .cloned()
      .unwrap_or_else(CacheEntry::idle)
  }

  /// Store confirmed data.
  pub fn set(&self, key: &CacheKey, data: Value) {
    self.write(key, |entry| entry.into_success(data));
  }

  /// Record a failed fetch, keeping whatever data was cached.
  pub fn set_error(&self, key: &CacheKey, error: RemoteError) {
    self.write(key, |entry| entry.into_error(error));
  }

  /// Apply `updater` only if the entry is still at `base_version`.
  ///
  /// The updater receives the current entry by value and runs under the store lock;
  /// it must not call back into the store.
  pub fn patch<F>(&self, key: &CacheKey, base_version: u64, updater: F) -> PatchOutcome
  where
    F: FnOnce(CacheEntry) -> CacheEntry,
  {
    let entry = {
      let mut state = lock(&self.state);
      if state.disposed {
        return PatchOutcome::Disposed;
      }

      let current = state.version_of(key);
      if current != base_version {
        debug!(%key, base = base_version, current, "stale write rejected");
        return PatchOutcome::StaleWriteRejected {
          base: base_version,
          current,
        };
      }

      let prev = state.current(key);
      state.commit(key, updater(prev))
    };

    trace!(%key, version = entry.version, "patched");
    self.announce(key, entry)
  }

  /// Put a rollback `snapshot` back if the entry is still at `base_version`.
  ///
  /// A snapshot taken while a fetch was loading keeps that status only if the fetch
  /// still owns the key. Otherwise the fetch has settled or been detached, and the
  /// snapshot comes back idle so the next read refetches.
  pub fn restore(
    &self,
    key: &CacheKey,
    base_version: u64,
    mut snapshot: CacheEntry,
  ) -> PatchOutcome {
    let entry = {
      let mut state = lock(&self.state);
      if state.disposed {
        return PatchOutcome::Disposed;
      }

      let current = state.version_of(key);
      if current != base_version {
        debug!(%key, base = base_version, current, "restore rejected, newer write kept");
        return PatchOutcome::StaleWriteRejected {
          base: base_version,
          current,
        };
      }

      if snapshot.is_loading() && !state.loads.contains_key(key) {
        snapshot.status = EntryStatus::Idle;
      }
      state.commit(key, snapshot)
    };

    trace!(%key, version = entry.version, status = ?entry.status, "restored");
    self.announce(key, entry)
  }

  /// Settle the fetch that set loading mark `mark`, releasing its ownership of `key`.
  ///
  /// `updater` runs if nothing has written the key since the mark, or if the entry
  /// was rolled back to a loading state this fetch still owns.
  pub fn finish_load<F>(&self, key: &CacheKey, mark: u64, updater: F) -> PatchOutcome
  where
    F: FnOnce(CacheEntry) -> CacheEntry,
  {
    let entry = {
      let mut state = lock(&self.state);
      if state.disposed {
        return PatchOutcome::Disposed;
      }

      let owned = state.loads.get(key) == Some(&mark);
      if owned {
        state.loads.remove(key);
      }
      let prev = state.current(key);
      if prev.version != mark && !(owned && prev.is_loading()) {
        debug!(%key, base = mark, current = prev.version, "fetch result superseded");
        return PatchOutcome::StaleWriteRejected {
          base: mark,
          current: prev.version,
        };
      }

      state.commit(key, updater(prev))
    };

    trace!(%key, version = entry.version, status = ?entry.status, "load settled");
    self.announce(key, entry)
  }

  /// Mark every entry under `pattern` idle, keeping its data. Returns the keys touched.
  pub fn invalidate(&self, pattern: &KeyPattern) -> Vec<CacheKey> {
    let touched: Vec<(CacheKey, CacheEntry)> = {
      let mut state = lock(&self.state);
      if state.disposed {
        return Vec::new();
      }

      let keys: Vec<CacheKey> = state
        .entries
        .keys()
        .filter(|key| pattern.matches(key))
        .cloned()
        .collect();

      keys
        .into_iter()
        .filter_map(|key| {
          // In-flight fetches are detached and no longer own the key
          state.loads.remove(&key);
          let version = state.next_version();
          let entry = state.entries.get_mut(&key)?;
          entry.status = EntryStatus::Idle;
          entry.version = version;
          Some((key, entry.clone()))
        })
        .collect()
    };

    debug!(%pattern, count = touched.len(), "invalidated");
    for (key, entry) in &touched {
      self.bus.notify(key, entry);
    }
    touched.into_iter().map(|(key, _)| key).collect()
  }

  /// Flag a fetch as started and make it the key's owner until
  /// [`finish_load`](Self::finish_load). Returns the loading mark (0 if disposed).
  pub fn mark_loading(&self, key: &CacheKey) -> u64 {
    let entry = {
      let mut state = lock(&self.state);
      if state.disposed {
        return 0;
      }
      let prev = state.current(key);
      let entry = state.commit(key, prev.with_status(EntryStatus::Loading));
      state.loads.insert(key.clone(), entry.version);
      entry
    };

    trace!(%key, version = entry.version, "loading");
    let mark = entry.version;
    self.bus.notify(key, &entry);
    mark
  }

  pub fn keys(&self) -> Vec<CacheKey> {
    lock(&self.state).entries.keys().cloned().collect()
  }

  pub fn len(&self) -> usize {
    lock(&self.state).entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Drop all entries and subscribers. Later writes are ignored.
  pub fn dispose(&self) {
    {
      let mut state = lock(&self.state);
      state.disposed = true;
      state.entries.clear();
      state.loads.clear();
    }
    self.bus.clear();
    debug!("entity store disposed");
  }

  pub fn is_disposed(&self) -> bool {
    lock(&self.state).disposed
  }

  /// Unconditional write.
  fn write<F>(&self, key: &CacheKey, update: F)
  where
    F: FnOnce(CacheEntry) -> CacheEntry,
  {
    let entry = {
      let mut state = lock(&self.state);
      if state.disposed {
        trace!(%key, "write after dispose ignored");
        return;
      }
      let prev = state.current(key);
      state.commit(key, update(prev))
    };

    trace!(%key, version = entry.version, status = ?entry.status, "written");
    self.bus.notify(key, &entry);
  }

  fn announce(&self, key: &CacheKey, entry: CacheEntry) -> PatchOutcome {
    let version = entry.version;
    self.bus.notify(key, &entry);
    PatchOutcome::Applied { version }
  }
}

impl Default for EntityStore {
  fn default() -> Self {
    Self::new(NotificationBus::new())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  fn members(team: i64) -> CacheKey {
    CacheKey::builder("members").param("teamId", team).build().unwrap()
  }

  #[test]
  fn test_get_absent_is_idle() {
    let store = EntityStore::default();
    let entry = store.get(&members(1));
    assert!(entry.is_idle());
    assert!(entry.data.is_none());
    assert!(store.is_empty());
  }

  #[test]
  fn test_every_write_bumps_version() {
    let store = EntityStore::default();
    let key = members(1);

    store.set(&key, json!([]));
    let v1 = store.get(&key).version;
    store.set_error(&key, RemoteError::new("500", "down"));
    let v2 = store.get(&key).version;
    store.invalidate(&KeyPattern::any());
    let v3 = store.get(&key).version;

    assert!(v1 < v2 && v2 < v3);
    let entry = store.get(&key);
    assert!(entry.is_idle());
    assert_eq!(entry.data, Some(json!([])));
  }

  #[test]
  fn test_patch_checks_base_version() {
    let store = EntityStore::default();
    let key = members(1);
    store.set(&key, json!({"name": "A"}));
    let base = store.get(&key).version;

    // A confirmed write lands first
    store.set(&key, json!({"name": "C"}));

    let outcome = store.patch(&key, base, |e| e.into_success(json!({"name": "B"})));
    assert!(!outcome.applied());
    assert!(matches!(outcome, PatchOutcome::StaleWriteRejected { .. }));
    assert_eq!(store.get(&key).data, Some(json!({"name": "C"})));
  }

  #[test]
  fn test_patch_on_absent_key_uses_version_zero() {
    let store = EntityStore::default();
    let key = members(1);
    let outcome = store.patch(&key, 0, |e| e.into_success(json!([1])));
    assert!(outcome.applied());
    assert_eq!(store.get(&key).data, Some(json!([1])));
  }

  #[test]
  fn test_invalidate_only_touches_matching_keys() {
    let store = EntityStore::default();
    let seven = members(7);
    let seven_projects = CacheKey::builder("projects")
      .param("teamId", 7)
      .param("archived", false)
      .build()
      .unwrap();
    let eight = members(8);
    for key in [&seven, &seven_projects, &eight] {
      store.set(key, json!([]));
    }

    let touched = store.invalidate(&KeyPattern::any().param("teamId", 7));

    assert_eq!(touched.len(), 2);
    assert!(store.get(&seven).is_idle());
    assert!(store.get(&seven_projects).is_idle());
    assert!(store.get(&eight).is_success());
  }

  #[test]
  fn test_writes_notify_subscribers() {
    let store = EntityStore::default();
    let key = members(1);
    let seen = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&seen);
    let _sub = store.bus().subscribe(key.clone(), move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    });

    store.set(&key, json!([]));
    store.mark_loading(&key);
    store.set_error(&key, RemoteError::new("x", "y"));
    store.patch(&key, 0, |e| e); // stale, no notification
    store.invalidate(&KeyPattern::resource("members"));

    assert_eq!(seen.load(Ordering::SeqCst), 4);
  }

  #[test]
  fn test_subscriber_can_read_store() {
    let store = Arc::new(EntityStore::default());
    let key = members(1);
    let observed = Arc::new(Mutex::new(None));
    let (reader, sink, watched) = (Arc::clone(&store), Arc::clone(&observed), key.clone());
    let _sub = store.bus().subscribe(key.clone(), move |_| {
      *lock(&sink) = Some(reader.get(&watched).version);
    });

    store.set(&key, json!(1));
    assert_eq!(*lock(&observed), Some(store.get(&key).version));
  }

  #[test]
  fn test_finish_load_lands_over_restored_loading_mark() {
    let store = EntityStore::default();
    let key = members(1);
    store.set(&key, json!(["a"]));
    let mark = store.mark_loading(&key);
    let snapshot = store.get(&key);

    // An optimistic write and its rollback move the version past the mark
    let outcome = store.patch(&key, mark, |e| e.into_success(json!(["b"])));
    let PatchOutcome::Applied { version } = outcome else {
      panic!("optimistic patch rejected: {outcome:?}");
    };
    assert!(store.restore(&key, version, snapshot).applied());
    assert!(store.get(&key).is_loading());

    assert!(store.finish_load(&key, mark, |e| e.into_success(json!(["server"]))).applied());
    let entry = store.get(&key);
    assert!(entry.is_success());
    assert_eq!(entry.data, Some(json!(["server"])));
  }

  #[test]
  fn test_restore_after_load_settled_comes_back_idle() {
    let store = EntityStore::default();
    let key = members(1);
    store.set(&key, json!(["a"]));
    let mark = store.mark_loading(&key);
    let snapshot = store.get(&key);
    let outcome = store.patch(&key, mark, |e| e.into_success(json!(["b"])));
    let PatchOutcome::Applied { version } = outcome else {
      panic!("optimistic patch rejected: {outcome:?}");
    };

    // The fetch settles under the optimistic value and is rejected
    let settled = store.finish_load(&key, mark, |e| e.into_success(json!(["server"])));
    assert!(!settled.applied());

    assert!(store.restore(&key, version, snapshot).applied());
    let entry = store.get(&key);
    assert!(entry.is_idle());
    assert_eq!(entry.data, Some(json!(["a"])));
  }

  #[test]
  fn test_detached_load_cannot_claim_key() {
    let store = EntityStore::default();
    let key = members(1);
    let old = store.mark_loading(&key);
    store.invalidate(&KeyPattern::resource("members"));
    let fresh = store.mark_loading(&key);

    assert!(!store.finish_load(&key, old, |e| e.into_success(json!("old"))).applied());
    assert!(store.get(&key).is_loading());
    assert!(store.finish_load(&key, fresh, |e| e.into_success(json!("new"))).applied());
    assert_eq!(store.get(&key).data, Some(json!("new")));
  }

  #[test]
  fn test_dispose_drops_entries_and_ignores_writes() {
    let store = EntityStore::default();
    let key = members(1);
    store.set(&key, json!([]));

    store.dispose();
    store.set(&key, json!([1]));

    assert!(store.is_disposed());
    assert!(store.get(&key).is_idle());
    assert_eq!(store.patch(&key, 0, |e| e), PatchOutcome::Disposed);
  }
}
