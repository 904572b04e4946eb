//! Error taxonomy for the cache engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured rejection returned by the remote collaborator (loader or mutation call).
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RemoteError {
  pub code: String,
  pub message: String,
}

impl RemoteError {
  pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      code: code.into(),
      message: message.into(),
    }
  }
}

/// Errors surfaced by the cache engine to its callers.
///
/// A rejected versioned patch is not an error; it is reported through
/// [`PatchOutcome`](super::PatchOutcome).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError {
  /// The remote collaborator rejected a fetch or mutation.
  #[error("network error: {0}")]
  Network(#[from] RemoteError),

  /// Caller-supplied key parameters were malformed.
  #[error("invalid cache key: {reason}")]
  Validation { reason: String },

  /// Cached JSON did not match the type the caller asked for.
  #[error("failed to decode {key}: {reason}")]
  Decode { key: String, reason: String },

  /// An optimistic updater failed; no remote call was made.
  #[error("optimistic update of {key} failed: {reason}")]
  OptimisticUpdate { key: String, reason: String },

  /// The client was disposed.
  #[error("query client has been disposed")]
  Disposed,
}

impl CacheError {
  pub fn validation(reason: impl Into<String>) -> Self {
    Self::Validation {
      reason: reason.into(),
    }
  }

  /// The remote error, if this came from the network.
  pub fn remote(&self) -> Option<&RemoteError> {
    match self {
      Self::Network(e) => Some(e),
      _ => None,
    }
  }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
