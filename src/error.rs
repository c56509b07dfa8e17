//! Error taxonomy shared by the cache and the sync queue.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced inside the core.
///
/// Network-class errors are recovered wherever a fallback source exists; they
/// only reach a caller as a `NoContentAvailable` response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
  /// The fetch could not complete at all
  #[error("network unavailable: {0}")]
  NetworkUnavailable(String),

  #[error("network request timed out after {0:?}")]
  Timeout(Duration),

  /// The remote answered with a non-success status
  #[error("remote rejected request with status {status}")]
  RemoteRejected { status: u16 },

  /// Persistence read or write failed (quota, corruption, closed database)
  #[error("storage failure: {0}")]
  Storage(String),

  /// Neither the cache nor the network produced a usable response
  #[error("no content available for {0}")]
  NoContentAvailable(String),

  #[error("lifecycle error: {0}")]
  Lifecycle(String),

  #[error("invalid configuration: {0}")]
  Config(String),
}

impl Error {
  /// Whether this error came from the network side and can be recovered from cache.
  pub fn is_network(&self) -> bool {
    matches!(
      self,
      Error::NetworkUnavailable(_) | Error::Timeout(_) | Error::RemoteRejected { .. }
    )
  }

  pub(crate) fn storage(context: &str, err: impl std::fmt::Display) -> Self {
    Error::Storage(format!("{}: {}", context, err))
  }
}
