//! Remote submit capability used when draining the sync queue.

use async_trait::async_trait;
use std::time::Duration;
use url::Url;

use super::queue::{PendingOperation, SyncResult};
use crate::error::{Error, Result};

/// Anything that can deliver one pending operation to the remote.
///
/// Implementations must not panic on remote failures; every outcome is a
/// `SyncResult`.
#[async_trait]
pub trait RemoteSubmit: Send + Sync {
  async fn submit(&self, op: &PendingOperation) -> SyncResult;
}

/// POSTs each operation's payload to a fixed endpoint.
///
/// The operation id travels in `X-Operation-Id` so the remote can discard a
/// replay of an operation it already accepted.
#[derive(Clone)]
pub struct HttpSubmitter {
  client: reqwest::Client,
  endpoint: Url,
  token: Option<String>,
}

impl HttpSubmitter {
  pub fn new(endpoint: Url, timeout: Duration, token: Option<String>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      endpoint,
      token,
    })
  }
}

#[async_trait]
impl RemoteSubmit for HttpSubmitter {
  async fn submit(&self, op: &PendingOperation) -> SyncResult {
    let content_type = if serde_json::from_slice::<serde_json::Value>(&op.payload).is_ok() {
      "application/json"
    } else {
      "application/octet-stream"
    };

    let mut request = self
      .client
      .post(self.endpoint.clone())
      .header("content-type", content_type)
      .header("x-operation-id", op.id.to_string())
      .header("x-sync-channel", op.channel.as_str())
      .body(op.payload.clone());
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    match request.send().await {
      Ok(response) => classify(response.status().as_u16()),
      Err(e) => SyncResult::Pending(Error::NetworkUnavailable(e.to_string()).to_string()),
    }
  }
}

/// Transient statuses are retried; any other non-success is a rejection.
fn classify(status: u16) -> SyncResult {
  match status {
    200..=299 => SyncResult::Succeeded,
    408 | 429 | 500..=599 => SyncResult::Pending(format!("remote unavailable (status {})", status)),
    _ => SyncResult::Failed(Error::RemoteRejected { status }.to_string()),
  }
}
