//! Optimistic updaters for cached collections and records.
//!
//! Each helper returns an updater for [`Mutation::optimistic`](crate::cache::Mutation::optimistic).
//! Keys that are not cached are left alone; cached data that does not decode as the
//! expected shape aborts the mutation before anything is sent.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::cache::{CacheError, CacheKey, Cacheable, Result};

fn malformed(key: &CacheKey, error: serde_json::Error) -> CacheError {
  CacheError::OptimisticUpdate {
    key: key.to_string(),
    reason: error.to_string(),
  }
}

/// Decode the cached value at `key` as `T`, edit it, and encode it back.
pub fn edit<T, F>(key: CacheKey, apply: F) -> impl FnOnce(Option<&Value>) -> Result<Option<Value>> + Send + 'static
where
  T: Serialize + DeserializeOwned + 'static,
  F: FnOnce(&mut T) + Send + 'static,
{
  move |current| {
    let Some(current) = current else {
      return Ok(None);
    };
    let mut data: T = serde_json::from_value(current.clone()).map_err(|e| malformed(&key, e))?;
    apply(&mut data);
    serde_json::to_value(&data).map(Some).map_err(|e| malformed(&key, e))
  }
}

pub fn append<T>(key: CacheKey, item: T) -> impl FnOnce(Option<&Value>) -> Result<Option<Value>> + Send + 'static
where
  T: Cacheable + 'static,
{
  edit(key, move |items: &mut Vec<T>| items.push(item))
}

pub fn remove<T>(key: CacheKey, id: i64) -> impl FnOnce(Option<&Value>) -> Result<Option<Value>> + Send + 'static
where
  T: Cacheable + 'static,
{
  edit(key, move |items: &mut Vec<T>| items.retain(|item| item.cache_id() != id))
}

/// Swap the element with the same id as `item`; the list is unchanged if none matches.
pub fn replace<T>(key: CacheKey, item: T) -> impl FnOnce(Option<&Value>) -> Result<Option<Value>> + Send + 'static
where
  T: Cacheable + 'static,
{
  edit(key, move |items: &mut Vec<T>| {
    if let Some(slot) = items.iter_mut().find(|i| i.cache_id() == item.cache_id()) {
      *slot = item;
    }
  })
}
