//! Background task that turns sync triggers into queue drains and retries
//! unfinished channels with exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::queue::{DrainReport, OperationLog, SyncQueue};
use super::remote::RemoteSubmit;
use crate::error::{Error, Result};

/// Backoff between drains of a channel that still has unsynced operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub base: Duration,
  pub max: Duration,
  /// Drain every known channel on this interval
  pub periodic: Option<Duration>,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base: Duration::from_secs(5),
      max: Duration::from_secs(300),
      periodic: None,
    }
  }
}

impl RetryPolicy {
  /// Delay before the next attempt after `failures` consecutive unfinished drains.
  pub fn delay(&self, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    self.base.saturating_mul(factor).min(self.max)
  }
}

enum Command {
  Drain {
    channel: String,
    reply: Option<oneshot::Sender<Result<DrainReport>>>,
  },
  DrainAll,
  Shutdown,
}

struct Backoff {
  failures: u32,
  /// `None` while a retry drain for the channel is running
  due: Option<Instant>,
}

/// Channel name and whether operations were left behind.
type DrainOutcome = (String, bool);

/// Handle to the running scheduler task.
pub struct SyncScheduler {
  tx: mpsc::UnboundedSender<Command>,
  handle: JoinHandle<()>,
}

impl SyncScheduler {
  pub fn spawn<L: OperationLog + 'static>(
    queue: Arc<SyncQueue<L>>,
    submit: Arc<dyn RemoteSubmit>,
    policy: RetryPolicy,
  ) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run(queue, submit, policy, rx));
    Self { tx, handle }
  }

  /// Request a drain without waiting for it.
  pub fn trigger(&self, channel: &str) {
    let command = Command::Drain {
      channel: channel.to_string(),
      reply: None,
    };
    if self.tx.send(command).is_err() {
      warn!(channel, "sync scheduler stopped, trigger ignored");
    }
  }

  /// Connectivity came back: drain every channel that has work.
  pub fn connectivity_restored(&self) {
    if self.tx.send(Command::DrainAll).is_err() {
      warn!("sync scheduler stopped, connectivity trigger ignored");
    }
  }

  /// Drain a channel now and wait for its report.
  pub async fn drain_now(&self, channel: &str) -> Result<DrainReport> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Command::Drain {
        channel: channel.to_string(),
        reply: Some(reply),
      })
      .map_err(|_| Error::Lifecycle("sync scheduler is not running".to_string()))?;

    rx.await
      .map_err(|_| Error::Lifecycle("sync scheduler stopped before replying".to_string()))?
  }

  /// Stop accepting triggers and wait for the drains already running.
  pub async fn shutdown(self) {
    let _ = self.tx.send(Command::Shutdown);
    if let Err(e) = self.handle.await {
      warn!(error = %e, "sync scheduler task ended abnormally");
    }
  }
}

/// Every drain runs as its own task. Drains of one channel still queue up
/// behind each other inside `SyncQueue::drain`.
async fn run<L: OperationLog + 'static>(
  queue: Arc<SyncQueue<L>>,
  submit: Arc<dyn RemoteSubmit>,
  policy: RetryPolicy,
  mut rx: mpsc::UnboundedReceiver<Command>,
) {
  let mut backoff: HashMap<String, Backoff> = HashMap::new();
  let mut drains: JoinSet<DrainOutcome> = JoinSet::new();
  let mut periodic = policy.periodic.map(|period| {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
  });

  loop {
    let next_due = backoff.values().filter_map(|b| b.due).min();
    let periodic_tick = async {
      match periodic.as_mut() {
        Some(interval) => {
          interval.tick().await;
        }
        None => std::future::pending::<()>().await,
      }
    };

    tokio::select! {
      command = rx.recv() => match command {
        Some(Command::Drain { channel, reply }) => {
          spawn_drain(&mut drains, &queue, &submit, channel, reply);
        }
        Some(Command::DrainAll) => drain_all(&mut drains, &queue, &submit),
        Some(Command::Shutdown) | None => break,
      },
      Some(joined) = drains.join_next(), if !drains.is_empty() => match joined {
        Ok((channel, unfinished)) => record_outcome(&mut backoff, &policy, channel, unfinished),
        Err(e) => warn!(error = %e, "sync drain task ended abnormally"),
      },
      _ = sleep_until_due(next_due) => {
        let now = Instant::now();
        for (channel, entry) in backoff.iter_mut() {
          if entry.due.is_some_and(|due| due <= now) {
            debug!(%channel, failures = entry.failures, "retrying sync after backoff");
            entry.due = None;
            spawn_drain(&mut drains, &queue, &submit, channel.clone(), None);
          }
        }
      },
      _ = periodic_tick => {
        debug!("periodic sync");
        drain_all(&mut drains, &queue, &submit);
      },
    }
  }

  while let Some(joined) = drains.join_next().await {
    if let Err(e) = joined {
      warn!(error = %e, "sync drain task ended abnormally");
    }
  }
  info!("sync scheduler stopped");
}

async fn sleep_until_due(due: Option<Instant>) {
  match due {
    Some(due) => tokio::time::sleep_until(due).await,
    None => std::future::pending().await,
  }
}

fn drain_all<L: OperationLog + 'static>(
  drains: &mut JoinSet<DrainOutcome>,
  queue: &Arc<SyncQueue<L>>,
  submit: &Arc<dyn RemoteSubmit>,
) {
  let channels = match queue.channels() {
    Ok(channels) => channels,
    Err(e) => {
      warn!(error = %e, "failed to list sync channels");
      return;
    }
  };
  for channel in channels {
    spawn_drain(drains, queue, submit, channel, None);
  }
}

/// Drain one channel in the background. Errors are logged here and handed
/// back to callers that asked for a report.
fn spawn_drain<L: OperationLog + 'static>(
  drains: &mut JoinSet<DrainOutcome>,
  queue: &Arc<SyncQueue<L>>,
  submit: &Arc<dyn RemoteSubmit>,
  channel: String,
  reply: Option<oneshot::Sender<Result<DrainReport>>>,
) {
  let queue = Arc::clone(queue);
  let submit = Arc::clone(submit);

  drains.spawn(async move {
    let result = queue.drain(&channel, submit).await;
    let unfinished = match &result {
      Ok(report) => report.remaining() > 0,
      Err(e) => {
        warn!(%channel, error = %e, "sync drain failed");
        true
      }
    };
    if let Some(reply) = reply {
      let _ = reply.send(result);
    }
    (channel, unfinished)
  });
}

fn record_outcome(
  backoff: &mut HashMap<String, Backoff>,
  policy: &RetryPolicy,
  channel: String,
  unfinished: bool,
) {
  if !unfinished {
    backoff.remove(&channel);
    return;
  }

  let failures = backoff.get(&channel).map(|b| b.failures).unwrap_or(0) + 1;
  let delay = policy.delay(failures);
  debug!(%channel, failures, delay_ms = delay.as_millis() as u64, "scheduling sync retry");
  backoff.insert(
    channel,
    Backoff {
      failures,
      due: Some(Instant::now() + delay),
    },
  );
}
