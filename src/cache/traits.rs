//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

use super::error::{CacheError, RemoteError, Result};

/// Trait for entities that can be cached.
///
/// Implementors name their resource type (used to build detail keys) and expose the
/// server id that list helpers match on.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Server-assigned identifier
  fn cache_id(&self) -> i64;

  /// Resource type name for detail keys (e.g., "task", "team")
  fn resource_type() -> &'static str;
}

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
  /// Never fetched, or invalidated and waiting for the next fetch
  Idle,
  /// A fetch is in flight; previous data (if any) is still available
  Loading,
  /// Holds data confirmed by the server or written optimistically
  Success,
  /// Last fetch failed; previous data (if any) is kept
  Error,
}

/// One cached value plus its bookkeeping.
///
/// Consumers only ever see clones of the store's entries.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub status: EntryStatus,
  pub data: Option<Value>,
  pub error: Option<RemoteError>,
  /// Wall-clock time of the last data or error write
  pub updated_at: Option<DateTime<Utc>>,
  /// Store-wide monotonic write counter; 0 means never written
  pub version: u64,
  /// Monotonic twin of `updated_at`, used for staleness
  written_at: Option<Instant>,
}

impl Default for CacheEntry {
  fn default() -> Self {
    Self::idle()
  }
}

impl CacheEntry {
  /// The entry reported for keys the store has never seen.
  pub fn idle() -> Self {
    Self {
      status: EntryStatus::Idle,
      data: None,
      error: None,
      updated_at: None,
      version: 0,
      written_at: None,
    }
  }

  pub fn is_idle(&self) -> bool {
    self.status == EntryStatus::Idle
  }

  pub fn is_loading(&self) -> bool {
    self.status == EntryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == EntryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == EntryStatus::Error
  }

  /// True when the entry holds successful data written less than `stale_time` ago.
  pub fn is_fresh(&self, stale_time: Duration) -> bool {
    self.is_success()
      && self
        .written_at
        .map(|t| t.elapsed() < stale_time)
        .unwrap_or(false)
  }

  /// Replace the data, marking the entry successful as of now.
  pub fn into_success(mut self, data: Value) -> Self {
    self.status = EntryStatus::Success;
    self.data = Some(data);
    self.error = None;
    self.stamp();
    self
  }

  /// Record a failure, keeping the last known data.
  pub fn into_error(mut self, error: RemoteError) -> Self {
    self.status = EntryStatus::Error;
    self.error = Some(error);
    self.stamp();
    self
  }

  /// Same data, new status. Timestamps are left alone.
  pub fn with_status(mut self, status: EntryStatus) -> Self {
    self.status = status;
    self
  }

  /// Decode the data into `T`.
  pub fn decode<T: DeserializeOwned>(&self, key: &impl std::fmt::Display) -> Result<Option<T>> {
    self
      .data
      .as_ref()
      .map(|data| decode_value(key, data.clone()))
      .transpose()
  }

  fn stamp(&mut self) {
    self.updated_at = Some(Utc::now());
    self.written_at = Some(Instant::now());
  }
}

pub(crate) fn decode_value<T: DeserializeOwned>(
  key: &impl std::fmt::Display,
  value: Value,
) -> Result<T> {
  serde_json::from_value(value).map_err(|e| CacheError::Decode {
    key: key.to_string(),
    reason: e.to_string(),
  })
}

pub(crate) fn encode_value<T: Serialize>(key: &impl std::fmt::Display, value: &T) -> Result<Value> {
  serde_json::to_value(value).map_err(|e| CacheError::Decode {
    key: key.to_string(),
    reason: e.to_string(),
  })
}

/// Result of a versioned [`patch`](super::EntityStore::patch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
  /// The updater ran; the entry now carries `version`.
  Applied { version: u64 },
  /// The entry moved past `base` before the patch landed; nothing was written.
  StaleWriteRejected { base: u64, current: u64 },
  /// The store has been disposed.
  Disposed,
}

impl PatchOutcome {
  pub fn applied(&self) -> bool {
    matches!(self, PatchOutcome::Applied { .. })
  }
}
