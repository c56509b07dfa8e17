//! Core types and storage traits for the entry store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use super::key::CacheKey;
use crate::error::Result;
use crate::http::{Response, ResponseSource};

/// Generation identifier for the entry store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheVersion(String);

impl CacheVersion {
  pub fn new(version: impl Into<String>) -> Self {
    Self(version.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Name reported to clients for this version under a cache prefix.
  pub fn cache_name(&self, prefix: &str) -> String {
    format!("{}-{}", prefix, self.0)
  }
}

impl fmt::Display for CacheVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for CacheVersion {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
  pub key: CacheKey,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl Entry {
  pub fn from_response(key: CacheKey, response: &Response) -> Self {
    Self {
      key,
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      stored_at: Utc::now(),
    }
  }

  /// Rebuild the response this entry was stored from.
  pub fn to_response(&self) -> Response {
    Response::new(self.status, self.headers.clone(), self.body.clone())
      .with_source(ResponseSource::Cache)
  }
}

/// Lifecycle state of a cache version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionState {
  Installing,
  Installed,
  Active,
  Superseded,
}

impl VersionState {
  pub fn as_str(&self) -> &'static str {
    match self {
      VersionState::Installing => "installing",
      VersionState::Installed => "installed",
      VersionState::Active => "active",
      VersionState::Superseded => "superseded",
    }
  }
}

impl fmt::Display for VersionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for VersionState {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s {
      "installing" => Ok(VersionState::Installing),
      "installed" => Ok(VersionState::Installed),
      "active" => Ok(VersionState::Active),
      "superseded" => Ok(VersionState::Superseded),
      other => Err(format!("unknown version state: {}", other)),
    }
  }
}

/// A row of the version log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
  pub version: CacheVersion,
  pub state: VersionState,
  pub updated_at: DateTime<Utc>,
}

/// Trait for entry store backends.
///
/// `put` replaces atomically. Writes to a superseded version are rejected so a
/// late background refresh cannot resurrect a collected generation.
pub trait EntryStore: Send + Sync {
  /// Store or replace an entry under a version.
  fn put(&self, version: &CacheVersion, entry: &Entry) -> Result<()>;

  /// Get the entry for a key, only if it belongs to `version`.
  fn get(&self, version: &CacheVersion, key: &CacheKey) -> Result<Option<Entry>>;

  /// Delete one entry. Returns whether anything was removed.
  fn delete(&self, version: &CacheVersion, key: &CacheKey) -> Result<bool>;

  /// Every version that currently holds at least one entry.
  fn list_versions(&self) -> Result<BTreeSet<CacheVersion>>;

  /// Delete every entry of a version, returning how many were removed.
  fn delete_version(&self, version: &CacheVersion) -> Result<usize>;

  /// Number of entries stored under a version.
  fn count(&self, version: &CacheVersion) -> Result<usize>;

  /// Delete every entry of every version.
  fn clear(&self) -> Result<usize>;
}

/// Trait for the persisted lifecycle state of cache versions.
pub trait VersionLog: Send + Sync {
  fn set_state(&self, version: &CacheVersion, state: VersionState) -> Result<()>;

  fn state(&self, version: &CacheVersion) -> Result<Option<VersionState>>;

  /// All known versions, oldest update first.
  fn versions(&self) -> Result<Vec<VersionRecord>>;

  /// Drop a version from the log (used when an install is aborted).
  fn forget(&self, version: &CacheVersion) -> Result<()>;
}
