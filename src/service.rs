//! The service object owning the cache and the sync queue, and the
//! dispatcher that routes tagged events to them.

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheVersion, EngineConfig, EntryStore, SqliteStorage, StrategyEngine};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::http::{Request, Response, ResponseSource, Strategy};
use crate::lifecycle::{ActivationReport, InstallReport, LifecycleController, Precache};
use crate::network::Fetcher;
use crate::notify::{Event, Notifier};
use crate::sync::{
  channel_for_tag, DrainReport, OperationId, RemoteSubmit, RetryPolicy, SqliteOperationLog,
  SyncQueue, SyncScheduler, DEFAULT_CHANNEL,
};

/// Everything the service needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
  pub cache_name: String,
  pub version: CacheVersion,
  pub precache: Precache,
  pub engine: EngineConfig,
  pub retry: RetryPolicy,
  pub auto_activate: bool,
}

/// Events accepted by [`CacheService::dispatch`].
#[derive(Debug, Clone)]
pub enum ServiceEvent {
  /// Install the configured version with its precache set
  Install,
  /// Activate the configured version
  Activate,
  FetchRequest { request: Request, strategy: Strategy },
  /// Queue a write made while offline
  OfflineWrite { channel: Option<String>, payload: Vec<u8> },
  SyncTrigger { tag: String },
  Message(Command),
  PushPayload(Vec<u8>),
}

/// Administrative commands from foreground clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
  SkipWaiting,
  GetCacheInfo,
  ClearCache,
  SaveOffline { urls: Vec<Url> },
  SyncNow,
}

/// Reply to `GET_CACHE_INFO`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
  pub active_version_id: Option<CacheVersion>,
  pub cache_name: Option<String>,
  pub entries: usize,
  pub pending_operations: usize,
}

#[derive(Debug, Clone)]
pub enum ServiceReply {
  Installed(InstallReport),
  Activated(ActivationReport),
  /// skip-waiting found no installed version
  NothingWaiting,
  Response(Response),
  Queued(OperationId),
  Synced(DrainReport),
  /// The sync tag does not name a known channel
  SyncIgnored(String),
  CacheInfo(CacheInfo),
  Cleared { entries: usize },
  Saved { stored: usize, failed: Vec<Url> },
  Delivered,
}

/// Owns the entry store, strategy engine, lifecycle controller, sync queue
/// and notifier for one process.
pub struct CacheService {
  settings: ServiceSettings,
  store: Arc<SqliteStorage>,
  engine: StrategyEngine<SqliteStorage>,
  lifecycle: LifecycleController<SqliteStorage>,
  queue: Arc<SyncQueue<SqliteOperationLog>>,
  scheduler: Option<SyncScheduler>,
  notifier: Notifier,
}

impl CacheService {
  /// Build the service over an open database.
  ///
  /// Without a remote submitter operations still queue durably but sync
  /// triggers are refused. Must be called inside a tokio runtime.
  pub fn init(
    settings: ServiceSettings,
    db: Arc<Database>,
    fetcher: Arc<dyn Fetcher>,
    submit: Option<Arc<dyn RemoteSubmit>>,
  ) -> Result<Self> {
    let notifier = Notifier::new();
    let store = Arc::new(SqliteStorage::new(Arc::clone(&db)));
    let lifecycle =
      LifecycleController::new(Arc::clone(&store), Arc::clone(&fetcher), notifier.clone())?;

    // Finish any reclamation an earlier activation left behind.
    let reclaimed = lifecycle.collect_garbage()?;
    if reclaimed > 0 {
      info!(reclaimed, "reclaimed entries of superseded versions");
    }

    let engine = StrategyEngine::new(
      Arc::clone(&store),
      fetcher,
      lifecycle.subscribe(),
      settings.engine.clone(),
    );

    let queue = Arc::new(SyncQueue::new(
      Arc::new(SqliteOperationLog::new(db)),
      notifier.clone(),
    ));
    let scheduler = submit.map(|submit| SyncScheduler::spawn(Arc::clone(&queue), submit, settings.retry));

    info!(
      version = %settings.version,
      active = ?lifecycle.current_version(),
      "cache service initialized"
    );

    Ok(Self {
      settings,
      store,
      engine,
      lifecycle,
      queue,
      scheduler,
      notifier,
    })
  }

  /// Stop background sync. Detached background refreshes are not awaited.
  pub async fn shutdown(self) {
    if let Some(scheduler) = self.scheduler {
      scheduler.shutdown().await;
    }
    info!("cache service stopped");
  }

  /// Connect an observer for version, sync and cache events.
  pub fn subscribe(&self) -> broadcast::Receiver<Event> {
    self.notifier.subscribe()
  }

  pub fn current_version(&self) -> Option<CacheVersion> {
    self.lifecycle.current_version()
  }

  /// Route one event to the component that handles it.
  pub async fn dispatch(&self, event: ServiceEvent) -> Result<ServiceReply> {
    match event {
      ServiceEvent::Install => self.install().await.map(ServiceReply::Installed),
      ServiceEvent::Activate => self
        .lifecycle
        .activate(&self.settings.version)
        .await
        .map(ServiceReply::Activated),
      ServiceEvent::FetchRequest { request, strategy } => Ok(ServiceReply::Response(
        self.engine.handle(&request, strategy).await,
      )),
      ServiceEvent::OfflineWrite { channel, payload } => self
        .queue
        .enqueue_on(channel.as_deref().unwrap_or(DEFAULT_CHANNEL), &payload)
        .map(ServiceReply::Queued),
      ServiceEvent::SyncTrigger { tag } => self.sync_tag(&tag).await,
      ServiceEvent::Message(command) => self.handle_command(command).await,
      ServiceEvent::PushPayload(payload) => {
        self.notifier.broadcast(Event::PushReceived {
          payload: String::from_utf8_lossy(&payload).into_owned(),
        });
        Ok(ServiceReply::Delivered)
      }
    }
  }

  /// Serve a request. Never fails.
  pub async fn fetch(&self, request: &Request, strategy: Strategy) -> Response {
    self.engine.handle(request, strategy).await
  }

  /// Install the configured version when missing and activate it when
  /// auto-activation is on.
  pub async fn ensure_ready(&self) -> Result<()> {
    let version = &self.settings.version;
    if self.lifecycle.current_version().as_ref() == Some(version) {
      return Ok(());
    }

    self.install().await?;
    if self.settings.auto_activate {
      self.lifecycle.activate(version).await?;
    }
    Ok(())
  }

  async fn install(&self) -> Result<InstallReport> {
    self
      .lifecycle
      .install(&self.settings.version, &self.settings.precache)
      .await
  }

  async fn handle_command(&self, command: Command) -> Result<ServiceReply> {
    match command {
      Command::SkipWaiting => match self.lifecycle.skip_waiting().await? {
        Some(report) => Ok(ServiceReply::Activated(report)),
        None => Ok(ServiceReply::NothingWaiting),
      },
      Command::GetCacheInfo => self.cache_info().map(ServiceReply::CacheInfo),
      Command::ClearCache => {
        let entries = self.store.clear()?;
        info!(entries, "cache cleared");
        self.notifier.broadcast(Event::CacheCleared);
        Ok(ServiceReply::Cleared { entries })
      }
      Command::SaveOffline { urls } => self.save_offline(urls).await,
      Command::SyncNow => self.sync_channel(DEFAULT_CHANNEL).await.map(ServiceReply::Synced),
    }
  }

  pub fn cache_info(&self) -> Result<CacheInfo> {
    let active = self.lifecycle.current_version();
    let entries = match &active {
      Some(version) => self.store.count(version)?,
      None => 0,
    };

    Ok(CacheInfo {
      cache_name: active
        .as_ref()
        .map(|v| v.cache_name(&self.settings.cache_name)),
      active_version_id: active,
      entries,
      pending_operations: self.queue.len()?,
    })
  }

  async fn save_offline(&self, urls: Vec<Url>) -> Result<ServiceReply> {
    if self.lifecycle.current_version().is_none() {
      return Err(Error::Lifecycle(
        "no active cache version to save into".to_string(),
      ));
    }

    let results = join_all(urls.into_iter().map(|url| async move {
      let resp = self.engine.network_first(&Request::get(url.clone())).await;
      (url, resp.source == ResponseSource::Network && resp.is_success())
    }))
    .await;

    let mut stored = 0;
    let mut failed = Vec::new();
    for (url, saved) in results {
      if saved {
        stored += 1;
      } else {
        warn!(%url, "could not save for offline use");
        failed.push(url);
      }
    }
    Ok(ServiceReply::Saved { stored, failed })
  }

  async fn sync_tag(&self, tag: &str) -> Result<ServiceReply> {
    match channel_for_tag(tag) {
      Some(channel) => self.sync_channel(channel).await.map(ServiceReply::Synced),
      None => {
        warn!(tag, "ignoring unknown sync tag");
        Ok(ServiceReply::SyncIgnored(tag.to_string()))
      }
    }
  }

  async fn sync_channel(&self, channel: &str) -> Result<DrainReport> {
    match &self.scheduler {
      Some(scheduler) => scheduler.drain_now(channel).await,
      None => Err(Error::Config("no sync endpoint configured".to_string())),
    }
  }

  /// Tell the scheduler the remote is reachable again.
  pub fn connectivity_restored(&self) {
    if let Some(scheduler) = &self.scheduler {
      scheduler.connectivity_restored();
    }
  }

  pub fn queue(&self) -> &SyncQueue<SqliteOperationLog> {
    &self.queue
  }
}
