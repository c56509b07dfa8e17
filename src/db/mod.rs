pub mod schema;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};

/// Shared SQLite connection for the entry store and the sync queue.
///
/// Every record mutation is a single statement or a single transaction, so
/// readers never observe a half-written row.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::storage("Failed to create database directory", e))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::storage(&format!("Failed to open database at {}", path.display()), e)
    })?;

    conn
      .execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")
      .map_err(|e| Error::storage("Failed to configure database", e))?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| Error::storage("Failed to open in-memory database", e))?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Config("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("offsync").join("cache.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(schema::SCHEMA)
      .map_err(|e| Error::storage("Failed to run migrations", e))?;
    Ok(())
  }

  /// Lock the connection for a single operation.
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::storage("Lock poisoned", e))
  }
}

/// Format a timestamp for storage.
pub(crate) fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Parse a timestamp written by [`format_datetime`].
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::storage(&format!("Failed to parse datetime '{}'", s), e))
}
