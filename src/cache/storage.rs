//! SQLite implementation of the entry store and version log.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::key::CacheKey;
use super::traits::{CacheVersion, Entry, EntryStore, VersionLog, VersionRecord, VersionState};
use crate::db::{format_datetime, parse_datetime, Database};
use crate::error::{Error, Result};

/// SQLite-based entry store.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl EntryStore for SqliteStorage {
  fn put(&self, version: &CacheVersion, entry: &Entry) -> Result<()> {
    let conn = self.db.conn()?;
    let headers = serde_json::to_string(&entry.headers)
      .map_err(|e| Error::storage("Failed to serialize headers", e))?;
    let vary = serde_json::to_string(entry.key.vary())
      .map_err(|e| Error::storage("Failed to serialize vary headers", e))?;

    // Single statement: the replace is atomic and the superseded check cannot
    // interleave with an activation.
    let changed = conn
      .execute(
        "INSERT OR REPLACE INTO entries
           (version, cache_key, method, url, vary, status, headers, body, stored_at)
         SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
         WHERE NOT EXISTS (
           SELECT 1 FROM cache_versions WHERE version = ?1 AND state = 'superseded'
         )",
        params![
          version.as_str(),
          entry.key.fingerprint(),
          entry.key.method(),
          entry.key.url(),
          vary,
          entry.status,
          headers,
          entry.body,
          format_datetime(entry.stored_at),
        ],
      )
      .map_err(|e| Error::storage("Failed to store entry", e))?;

    if changed == 0 {
      return Err(Error::Storage(format!(
        "cache version {} has been superseded",
        version
      )));
    }
    Ok(())
  }

  fn get(&self, version: &CacheVersion, key: &CacheKey) -> Result<Option<Entry>> {
    let conn = self.db.conn()?;

    let row: Option<(String, String, String, u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT method, url, vary, status, headers, body, stored_at FROM entries
         WHERE version = ? AND cache_key = ?",
        params![version.as_str(), key.fingerprint()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
          ))
        },
      )
      .optional()
      .map_err(|e| Error::storage("Failed to read entry", e))?;

    match row {
      Some((method, url, vary, status, headers, body, stored_at)) => {
        let vary: Vec<(String, String)> = serde_json::from_str(&vary)
          .map_err(|e| Error::storage("Failed to deserialize vary headers", e))?;
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| Error::storage("Failed to deserialize headers", e))?;

        Ok(Some(Entry {
          key: CacheKey::from_parts(method, url, vary, key.fingerprint().to_string()),
          status,
          headers,
          body,
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn delete(&self, version: &CacheVersion, key: &CacheKey) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute(
        "DELETE FROM entries WHERE version = ? AND cache_key = ?",
        params![version.as_str(), key.fingerprint()],
      )
      .map_err(|e| Error::storage("Failed to delete entry", e))?;
    Ok(removed > 0)
  }

  fn list_versions(&self) -> Result<BTreeSet<CacheVersion>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT version FROM entries")
      .map_err(|e| Error::storage("Failed to prepare query", e))?;

    let versions = stmt
      .query_map([], |row| row.get::<_, String>(0))
      .map_err(|e| Error::storage("Failed to list versions", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| Error::storage("Failed to read version", e))?;

    Ok(versions.into_iter().map(CacheVersion::new).collect())
  }

  fn delete_version(&self, version: &CacheVersion) -> Result<usize> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "DELETE FROM entries WHERE version = ?",
        params![version.as_str()],
      )
      .map_err(|e| Error::storage(&format!("Failed to delete version {}", version), e))
  }

  fn count(&self, version: &CacheVersion) -> Result<usize> {
    let conn = self.db.conn()?;
    conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE version = ?",
        params![version.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| Error::storage("Failed to count entries", e))
  }

  fn clear(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    conn
      .execute("DELETE FROM entries", [])
      .map_err(|e| Error::storage("Failed to clear entries", e))
  }
}

impl VersionLog for SqliteStorage {
  fn set_state(&self, version: &CacheVersion, state: VersionState) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO cache_versions (version, state, updated_at) VALUES (?, ?, ?)",
        params![version.as_str(), state.as_str(), format_datetime(Utc::now())],
      )
      .map_err(|e| Error::storage("Failed to record version state", e))?;
    Ok(())
  }

  fn state(&self, version: &CacheVersion) -> Result<Option<VersionState>> {
    let conn = self.db.conn()?;
    let state: Option<String> = conn
      .query_row(
        "SELECT state FROM cache_versions WHERE version = ?",
        params![version.as_str()],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| Error::storage("Failed to read version state", e))?;

    state
      .map(|s| s.parse::<VersionState>().map_err(Error::Storage))
      .transpose()
  }

  fn versions(&self) -> Result<Vec<VersionRecord>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT version, state, updated_at FROM cache_versions ORDER BY updated_at, rowid")
      .map_err(|e| Error::storage("Failed to prepare query", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
        ))
      })
      .map_err(|e| Error::storage("Failed to query versions", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| Error::storage("Failed to read version row", e))?;

    rows
      .into_iter()
      .map(|(version, state, updated_at)| {
        Ok(VersionRecord {
          version: CacheVersion::new(version),
          state: state.parse().map_err(Error::Storage)?,
          updated_at: parse_datetime(&updated_at)?,
        })
      })
      .collect()
  }

  fn forget(&self, version: &CacheVersion) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "DELETE FROM cache_versions WHERE version = ?",
        params![version.as_str()],
      )
      .map_err(|e| Error::storage("Failed to forget version", e))?;
    Ok(())
  }
}
