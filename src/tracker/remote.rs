use futures::future::BoxFuture;
use serde_json::Value;

use crate::cache::{CacheKey, RemoteError};

/// Collection names used for writes.
pub const MEMBERS: &str = "members";
pub const PROJECTS: &str = "projects";
pub const LISTS: &str = "lists";
pub const TASKS: &str = "tasks";
pub const COMMENTS: &str = "comments";

/// The tracker backend as seen by the cache.
///
/// Implementations own the transport. Reads are addressed by cache key so every
/// [`TrackerQuery`](super::TrackerQuery) maps onto exactly one request; writes are
/// addressed by collection and record id. Returned futures must not borrow `self`.
pub trait Remote: Clone + Send + Sync + 'static {
  fn get(&self, key: &CacheKey) -> BoxFuture<'static, Result<Value, RemoteError>>;

  /// Create a record and return it as stored.
  fn create(&self, collection: &str, body: Value) -> BoxFuture<'static, Result<Value, RemoteError>>;

  /// Apply a partial update and return the record as stored.
  fn update(&self, collection: &str, id: i64, body: Value) -> BoxFuture<'static, Result<Value, RemoteError>>;

  fn delete(&self, collection: &str, id: i64) -> BoxFuture<'static, Result<(), RemoteError>>;
}
