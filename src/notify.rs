//! Best-effort delivery of cache and sync events to connected observers.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::cache::CacheVersion;

const CHANNEL_CAPACITY: usize = 64;

/// Events reported to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
  VersionChanged { version: CacheVersion },
  SyncComplete { count: usize },
  CacheCleared,
  PushReceived { payload: String },
}

/// Fan-out of events to every currently subscribed observer.
///
/// Cloning shares the same channel. Emitting never blocks and never fails: a
/// slow observer lags and drops old events, an absent one is simply skipped.
#[derive(Debug, Clone)]
pub struct Notifier {
  tx: broadcast::Sender<Event>,
}

impl Notifier {
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
    Self { tx }
  }

  /// Connect a new observer. It sees events emitted after this call.
  pub fn subscribe(&self) -> broadcast::Receiver<Event> {
    self.tx.subscribe()
  }

  pub fn broadcast(&self, event: Event) {
    match self.tx.send(event) {
      Ok(observers) => debug!(observers, "event delivered"),
      Err(broadcast::error::SendError(event)) => {
        debug!(?event, "no observers connected, event dropped")
      }
    }
  }
}

impl Default for Notifier {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_broadcast_without_observers_is_fine() {
    let notifier = Notifier::new();
    notifier.broadcast(Event::CacheCleared);

    let mut late = notifier.subscribe();
    assert!(late.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_every_observer_receives_event() {
    let notifier = Notifier::new();
    let mut a = notifier.subscribe();
    let mut b = notifier.clone().subscribe();

    notifier.broadcast(Event::SyncComplete { count: 2 });

    assert_eq!(a.recv().await.unwrap(), Event::SyncComplete { count: 2 });
    assert_eq!(b.recv().await.unwrap(), Event::SyncComplete { count: 2 });
  }

  #[test]
  fn test_event_serialization_is_tagged() {
    let json = serde_json::to_value(Event::VersionChanged {
      version: CacheVersion::from("v2"),
    })
    .unwrap();
    assert_eq!(json, serde_json::json!({"type": "version-changed", "version": "v2"}));
  }
}
