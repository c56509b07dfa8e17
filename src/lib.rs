//! Offline-first HTTP cache with a durable queue of operations that are
//! replayed against a remote once connectivity returns.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod network;
pub mod notify;
pub mod service;
pub mod sync;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use service::{CacheService, Command, ServiceEvent, ServiceReply};
