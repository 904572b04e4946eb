//! Client-side entity cache and mutation-invalidation engine for the project
//! tracker.
//!
//! - [`cache`]: keys, store, single-flight fetching, optimistic mutations, notifications
//! - [`client`]: the shared [`QueryClient`] and its [`EntityQuery`] read binding
//! - [`tracker`]: typed tracker resources and their invalidation rules
//! - [`config`] and [`logging`]: application shell

pub mod cache;
pub mod client;
pub mod config;
pub mod logging;
pub mod tracker;

pub use cache::{
  build_key, matches_pattern, CacheEntry, CacheError, CacheKey, EntryStatus, FetchOptions,
  KeyPattern, Mutation, RemoteError, Result, Scalar, Subscription,
};
pub use client::{EntityQuery, QueryClient};
pub use config::Config;
pub use tracker::{Remote, TrackerClient, TrackerQuery};
