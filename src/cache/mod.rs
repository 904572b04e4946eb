//! Generic entity cache and mutation-invalidation engine.
//!
//! This module is resource-agnostic:
//! - Keys are a resource type plus scalar scope parameters
//! - The store owns every entry and versions each write
//! - Concurrent fetches of one key share a single loader call
//! - Mutations patch optimistically and roll back on failure
//! - Subscribers are told about every change to the keys they observe

mod bus;
mod error;
mod fetcher;
mod key;
mod mutation;
mod store;
mod traits;

pub use bus::{NotificationBus, Subscription};
pub use error::{CacheError, RemoteError, Result};
pub use fetcher::{FetchCoordinator, FetchOptions, DEFAULT_STALE_TIME};
pub use key::{build_key, matches_pattern, CacheKey, KeyBuilder, KeyPattern, Scalar};
pub use mutation::{Mutation, MutationEngine};
pub use store::EntityStore;
pub use traits::{CacheEntry, Cacheable, EntryStatus, PatchOutcome};

pub(crate) use traits::{decode_value, encode_value};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a cache mutex. Callbacks never run under these locks, so a poisoned lock
/// still guards consistent state and is recovered rather than propagated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
