//! Background synchronization of operations created while offline.
//!
//! Operations are appended to a durable log and replayed against the remote
//! on each drain. Succeeded operations are removed; everything else stays
//! queued with its attempt count and last error.

mod queue;
mod remote;
mod scheduler;

pub use queue::{
  DrainReport, OperationId, OperationLog, PendingOperation, SqliteOperationLog, SyncQueue,
  SyncResult, DEFAULT_CHANNEL,
};
pub use remote::{HttpSubmitter, RemoteSubmit};
pub use scheduler::{RetryPolicy, SyncScheduler};

/// Tag delivered by the external scheduler to sync queued operations.
pub const TAG_PENDING_OPERATIONS: &str = "sync-pending-operations";
/// Tag delivered by the external scheduler to sync settings changes.
pub const TAG_SETTINGS: &str = "sync-settings";

/// Map a sync trigger tag to the queue channel it drains.
pub fn channel_for_tag(tag: &str) -> Option<&'static str> {
  match tag {
    TAG_PENDING_OPERATIONS => Some(DEFAULT_CHANNEL),
    TAG_SETTINGS => Some("settings"),
    _ => None,
  }
}
