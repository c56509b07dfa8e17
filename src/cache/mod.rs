//! Offline resource cache.
//!
//! This module provides the versioned entry store and the strategy engine
//! that sits in front of it:
//! - Requests are fingerprinted into a `CacheKey`
//! - Entries are scoped by `CacheVersion`; only one version is active
//! - CacheFirst, NetworkFirst and StaleWhileRevalidate decide between the
//!   store and the network per request

mod engine;
mod key;
mod storage;
mod traits;

pub use engine::{EngineConfig, StrategyEngine};
pub use key::CacheKey;
pub use storage::SqliteStorage;
pub use traits::{CacheVersion, Entry, EntryStore, VersionLog, VersionRecord, VersionState};
