//! Durable queue of operations created while the remote was unreachable.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rusqlite::params;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::remote::RemoteSubmit;
use crate::db::{format_datetime, parse_datetime, Database};
use crate::error::{Error, Result};
use crate::notify::{Event, Notifier};

/// Channel used by `enqueue`.
pub const DEFAULT_CHANNEL: &str = "operations";

pub type OperationId = i64;

/// A queued write waiting for remote acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingOperation {
  /// Monotonic, never reused
  pub id: OperationId,
  pub channel: String,
  pub payload: Vec<u8>,
  pub created_at: DateTime<Utc>,
  pub attempt_count: u32,
  pub last_error: Option<String>,
}

/// Outcome of one remote submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResult {
  Succeeded,
  /// The remote refused the operation
  Failed(String),
  /// Not settled yet, retry on a later drain
  Pending(String),
}

impl SyncResult {
  fn error(&self) -> Option<&str> {
    match self {
      SyncResult::Succeeded => None,
      SyncResult::Failed(reason) | SyncResult::Pending(reason) => Some(reason),
    }
  }
}

/// Summary of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  pub attempted: usize,
  pub synced: usize,
  pub failed: usize,
  pub pending: usize,
}

impl DrainReport {
  /// Operations still queued after the drain.
  pub fn remaining(&self) -> usize {
    self.failed + self.pending
  }
}

/// Trait for the durable operation log backing the queue.
pub trait OperationLog: Send + Sync {
  /// Append durably and return the stored operation.
  fn append(&self, channel: &str, payload: &[u8]) -> Result<PendingOperation>;

  /// All operations currently queued on a channel, oldest first.
  fn snapshot(&self, channel: &str) -> Result<Vec<PendingOperation>>;

  /// Apply drain outcomes in one atomic step: delete succeeded operations,
  /// bump attempts and record errors on the rest.
  fn reconcile(&self, outcomes: &[(OperationId, SyncResult)]) -> Result<()>;

  fn remove(&self, id: OperationId) -> Result<bool>;

  /// Channels that currently hold at least one operation.
  fn channels(&self) -> Result<Vec<String>>;

  fn len(&self) -> Result<usize>;
}

/// SQLite-backed operation log.
#[derive(Clone)]
pub struct SqliteOperationLog {
  db: Arc<Database>,
}

impl SqliteOperationLog {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl OperationLog for SqliteOperationLog {
  fn append(&self, channel: &str, payload: &[u8]) -> Result<PendingOperation> {
    let conn = self.db.conn()?;
    let created_at = Utc::now();

    conn
      .execute(
        "INSERT INTO pending_operations (channel, payload, created_at, attempt_count)
         VALUES (?, ?, ?, 0)",
        params![channel, payload, format_datetime(created_at)],
      )
      .map_err(|e| Error::storage("Failed to enqueue operation", e))?;

    Ok(PendingOperation {
      id: conn.last_insert_rowid(),
      channel: channel.to_string(),
      payload: payload.to_vec(),
      created_at,
      attempt_count: 0,
      last_error: None,
    })
  }

  fn snapshot(&self, channel: &str) -> Result<Vec<PendingOperation>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, channel, payload, created_at, attempt_count, last_error
         FROM pending_operations WHERE channel = ? ORDER BY id",
      )
      .map_err(|e| Error::storage("Failed to prepare query", e))?;

    let rows = stmt
      .query_map(params![channel], |row| {
        Ok((
          row.get::<_, OperationId>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, Vec<u8>>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, u32>(4)?,
          row.get::<_, Option<String>>(5)?,
        ))
      })
      .map_err(|e| Error::storage("Failed to query pending operations", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| Error::storage("Failed to read pending operation", e))?;

    rows
      .into_iter()
      .map(
        |(id, channel, payload, created_at, attempt_count, last_error)| {
          Ok(PendingOperation {
            id,
            channel,
            payload,
            created_at: parse_datetime(&created_at)?,
            attempt_count,
            last_error,
          })
        },
      )
      .collect()
  }

  fn reconcile(&self, outcomes: &[(OperationId, SyncResult)]) -> Result<()> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| Error::storage("Failed to begin transaction", e))?;

    for (id, result) in outcomes {
      match result.error() {
        None => {
          tx.execute("DELETE FROM pending_operations WHERE id = ?", params![id])
            .map_err(|e| Error::storage("Failed to remove synced operation", e))?;
        }
        Some(reason) => {
          tx.execute(
            "UPDATE pending_operations
             SET attempt_count = attempt_count + 1, last_error = ?
             WHERE id = ?",
            params![reason, id],
          )
          .map_err(|e| Error::storage("Failed to record sync failure", e))?;
        }
      }
    }

    tx.commit()
      .map_err(|e| Error::storage("Failed to commit drain results", e))
  }

  fn remove(&self, id: OperationId) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute("DELETE FROM pending_operations WHERE id = ?", params![id])
      .map_err(|e| Error::storage("Failed to remove operation", e))?;
    Ok(removed > 0)
  }

  fn channels(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT channel FROM pending_operations ORDER BY channel")
      .map_err(|e| Error::storage("Failed to prepare query", e))?;

    let channels = stmt
      .query_map([], |row| row.get::<_, String>(0))
      .map_err(|e| Error::storage("Failed to list channels", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| Error::storage("Failed to read channel", e))?;
    Ok(channels)
  }

  fn len(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    conn
      .query_row("SELECT COUNT(*) FROM pending_operations", [], |row| row.get(0))
      .map_err(|e| Error::storage("Failed to count pending operations", e))
  }
}

/// Ordered, durable queue with independent per-operation submission.
pub struct SyncQueue<L: OperationLog> {
  log: Arc<L>,
  notifier: Notifier,
  /// One drain per channel at a time, so an operation is never in two
  /// submissions. Drains of different channels run independently.
  draining: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<L: OperationLog> SyncQueue<L> {
  pub fn new(log: Arc<L>, notifier: Notifier) -> Self {
    Self {
      log,
      notifier,
      draining: StdMutex::new(HashMap::new()),
    }
  }

  fn channel_lock(&self, channel: &str) -> Arc<Mutex<()>> {
    let mut locks = self.draining.lock().unwrap_or_else(|e| e.into_inner());
    Arc::clone(locks.entry(channel.to_string()).or_default())
  }

  /// Queue a payload on the default channel. Durable once this returns.
  pub fn enqueue(&self, payload: &[u8]) -> Result<OperationId> {
    self.enqueue_on(DEFAULT_CHANNEL, payload)
  }

  pub fn enqueue_on(&self, channel: &str, payload: &[u8]) -> Result<OperationId> {
    let op = self.log.append(channel, payload)?;
    debug!(id = op.id, channel, bytes = payload.len(), "operation queued");
    Ok(op.id)
  }

  pub fn pending(&self, channel: &str) -> Result<Vec<PendingOperation>> {
    self.log.snapshot(channel)
  }

  pub fn channels(&self) -> Result<Vec<String>> {
    self.log.channels()
  }

  pub fn len(&self) -> Result<usize> {
    self.log.len()
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Explicitly drop an operation that should no longer be synced.
  pub fn supersede(&self, id: OperationId) -> Result<bool> {
    let removed = self.log.remove(id)?;
    if removed {
      info!(id, "operation superseded");
    }
    Ok(removed)
  }

  /// Submit every queued operation of a channel and reconcile the outcomes.
  ///
  /// Each submission runs as its own task; a rejection or panic in one does
  /// not affect the accounting of the others.
  pub async fn drain(
    &self,
    channel: &str,
    submit: Arc<dyn RemoteSubmit>,
  ) -> Result<DrainReport> {
    let lock = self.channel_lock(channel);
    let _guard = lock.lock().await;

    let snapshot = self.log.snapshot(channel)?;
    if snapshot.is_empty() {
      debug!(channel, "nothing to sync");
      return Ok(DrainReport::default());
    }

    let ids: Vec<OperationId> = snapshot.iter().map(|op| op.id).collect();
    let handles = snapshot.into_iter().map(|op| {
      let submit = Arc::clone(&submit);
      tokio::spawn(async move { submit.submit(&op).await })
    });

    let outcomes: Vec<(OperationId, SyncResult)> = ids
      .into_iter()
      .zip(join_all(handles).await)
      .map(|(id, joined)| {
        let result = joined
          .unwrap_or_else(|e| SyncResult::Pending(format!("submission aborted: {}", e)));
        (id, result)
      })
      .collect();

    let mut report = DrainReport {
      attempted: outcomes.len(),
      ..DrainReport::default()
    };
    for (id, result) in &outcomes {
      match result {
        SyncResult::Succeeded => report.synced += 1,
        SyncResult::Failed(reason) => {
          report.failed += 1;
          warn!(id, channel, %reason, "remote rejected operation");
        }
        SyncResult::Pending(reason) => {
          report.pending += 1;
          debug!(id, channel, %reason, "operation will be retried");
        }
      }
    }

    self.log.reconcile(&outcomes)?;

    if report.synced > 0 {
      info!(channel, synced = report.synced, remaining = report.remaining(), "sync complete");
      self.notifier.broadcast(Event::SyncComplete {
        count: report.synced,
      });
    } else {
      info!(channel, pending = report.attempted, "no operations synced, keeping them for the next trigger");
    }

    Ok(report)
  }
}
