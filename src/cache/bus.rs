//! Notification bus: per-key subscriptions with synchronous delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::trace;

use super::key::CacheKey;
use super::lock;
use super::traits::CacheEntry;

type Callback = Arc<dyn Fn(&CacheEntry) + Send + Sync>;

struct Subscriber {
  id: u64,
  active: Arc<AtomicBool>,
  callback: Callback,
}

#[derive(Default)]
struct Registry {
  next_id: u64,
  by_key: HashMap<CacheKey, Vec<Subscriber>>,
}

/// Fan-out of entry changes to the consumers observing each concrete key.
///
/// Pattern subscriptions are not supported; a consumer rendering several keys
/// subscribes to each of them.
#[derive(Clone, Default)]
pub struct NotificationBus {
  registry: Arc<Mutex<Registry>>,
}

impl NotificationBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register `callback` for changes to `key`.
  ///
  /// The callback runs synchronously on the writer's task, outside any cache lock.
  pub fn subscribe<F>(&self, key: CacheKey, callback: F) -> Subscription
  where
    F: Fn(&CacheEntry) + Send + Sync + 'static,
  {
    let active = Arc::new(AtomicBool::new(true));
    let mut registry = lock(&self.registry);
    registry.next_id += 1;
    let id = registry.next_id;
    registry
      .by_key
      .entry(key.clone())
      .or_default()
      .push(Subscriber {
        id,
        active: Arc::clone(&active),
        callback: Arc::new(callback),
      });
    trace!(%key, id, "subscribed");

    Subscription {
      registry: Arc::downgrade(&self.registry),
      key,
      id,
      active,
    }
  }

  /// Subscribe through a channel, for consumers driven by an event loop.
  pub fn watch(&self, key: CacheKey) -> (Subscription, mpsc::UnboundedReceiver<CacheEntry>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = self.subscribe(key, move |entry| {
      // Receiver gone means the watcher is being torn down
      let _ = tx.send(entry.clone());
    });
    (subscription, rx)
  }

  /// Deliver `entry` to every active subscriber of `key`.
  pub fn notify(&self, key: &CacheKey, entry: &CacheEntry) {
    let targets: Vec<(Arc<AtomicBool>, Callback)> = {
      let registry = lock(&self.registry);
      match registry.by_key.get(key) {
        Some(subscribers) => subscribers
          .iter()
          .map(|s| (Arc::clone(&s.active), Arc::clone(&s.callback)))
          .collect(),
        None => return,
      }
    };

    for (active, callback) in targets {
      if active.load(Ordering::Acquire) {
        callback(entry);
      }
    }
  }

  pub fn subscriber_count(&self, key: &CacheKey) -> usize {
    lock(&self.registry)
      .by_key
      .get(key)
      .map(Vec::len)
      .unwrap_or(0)
  }

  /// Drop every subscriber. Outstanding handles become inert.
  pub fn clear(&self) {
    // Callbacks are dropped outside the lock; they may own subscriptions
    let removed = std::mem::take(&mut lock(&self.registry).by_key);
    for subscriber in removed.values().flatten() {
      subscriber.active.store(false, Ordering::Release);
    }
  }
}

/// Handle for one subscription. Dropping it unsubscribes.
pub struct Subscription {
  registry: Weak<Mutex<Registry>>,
  key: CacheKey,
  id: u64,
  active: Arc<AtomicBool>,
}

impl Subscription {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn is_active(&self) -> bool {
    self.active.load(Ordering::Acquire)
  }

  /// Stop delivery. Safe to call any number of times.
  pub fn unsubscribe(&self) {
    if !self.active.swap(false, Ordering::AcqRel) {
      return;
    }
    let Some(registry) = self.registry.upgrade() else {
      return;
    };
    let removed = {
      let mut registry = lock(&registry);
      let Some(subscribers) = registry.by_key.get_mut(&self.key) else {
        return;
      };
      let removed = subscribers
        .iter()
        .position(|s| s.id == self.id)
        .map(|index| subscribers.remove(index));
      if subscribers.is_empty() {
        registry.by_key.remove(&self.key);
      }
      removed
    };
    drop(removed);
    trace!(key = %self.key, id = self.id, "unsubscribed");
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.unsubscribe();
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("id", &self.id)
      .field("active", &self.is_active())
      .finish()
  }
}
