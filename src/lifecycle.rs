//! Cache version lifecycle: install, activate, collect superseded versions.
//!
//! ```text
//! Installing → Installed → Active → Superseded
//! ```

use futures::future::{join_all, try_join_all};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheKey, CacheVersion, Entry, EntryStore, VersionLog, VersionState};
use crate::error::{Error, Result};
use crate::http::Request;
use crate::network::Fetcher;
use crate::notify::{Event, Notifier};

/// Resources cached at install time.
#[derive(Debug, Clone, Default)]
pub struct Precache {
  /// Any failure here aborts the install
  pub required: Vec<Url>,
  /// Failures here are logged and tolerated
  pub optional: Vec<Url>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
  pub version: CacheVersion,
  pub required_cached: usize,
  pub optional_cached: usize,
  pub optional_failed: Vec<Url>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
  pub version: CacheVersion,
  pub previous: Option<CacheVersion>,
  pub reclaimed_entries: usize,
}

/// Owns the active cache version and drives transitions between versions.
pub struct LifecycleController<S: EntryStore + VersionLog> {
  store: Arc<S>,
  fetcher: Arc<dyn Fetcher>,
  notifier: Notifier,
  active: watch::Sender<Option<CacheVersion>>,
  /// Install and activate never interleave
  transition: Mutex<()>,
}

impl<S: EntryStore + VersionLog> LifecycleController<S> {
  /// Restore the active version from the version log.
  pub fn new(store: Arc<S>, fetcher: Arc<dyn Fetcher>, notifier: Notifier) -> Result<Self> {
    let active = store
      .versions()?
      .into_iter()
      .rev()
      .find(|record| record.state == VersionState::Active)
      .map(|record| record.version);

    if let Some(version) = &active {
      info!(%version, "restored active cache version");
    }

    let (tx, _) = watch::channel(active);
    Ok(Self {
      store,
      fetcher,
      notifier,
      active: tx,
      transition: Mutex::new(()),
    })
  }

  /// The version new entries are labelled with, if any has been activated.
  pub fn current_version(&self) -> Option<CacheVersion> {
    self.active.borrow().clone()
  }

  /// Watch the active version.
  pub fn subscribe(&self) -> watch::Receiver<Option<CacheVersion>> {
    self.active.subscribe()
  }

  pub fn state(&self, version: &CacheVersion) -> Result<Option<VersionState>> {
    self.store.state(version)
  }

  /// Populate a new version with its precache set.
  pub async fn install(&self, version: &CacheVersion, precache: &Precache) -> Result<InstallReport> {
    let _guard = self.transition.lock().await;

    match self.store.state(version)? {
      Some(VersionState::Installed) | Some(VersionState::Active) => {
        info!(%version, "version already installed");
        return Ok(InstallReport {
          version: version.clone(),
          required_cached: self.store.count(version)?,
          optional_cached: 0,
          optional_failed: Vec::new(),
        });
      }
      Some(VersionState::Superseded) => {
        return Err(Error::Lifecycle(format!(
          "version {} was superseded and cannot be reinstalled",
          version
        )));
      }
      Some(VersionState::Installing) | None => {}
    }

    info!(%version, required = precache.required.len(), optional = precache.optional.len(), "installing cache version");
    self.store.set_state(version, VersionState::Installing)?;

    let required = try_join_all(
      precache
        .required
        .iter()
        .map(|url| self.cache_resource(version, url)),
    )
    .await;

    if let Err(e) = required {
      warn!(%version, error = %e, "required resource failed, aborting install");
      self.abort_install(version);
      return Err(Error::Lifecycle(format!(
        "install of {} failed: {}",
        version, e
      )));
    }

    let optional = join_all(
      precache
        .optional
        .iter()
        .map(|url| async move { (url, self.cache_resource(version, url).await) }),
    )
    .await;

    let mut optional_cached = 0;
    let mut optional_failed = Vec::new();
    for (url, result) in optional {
      match result {
        Ok(()) => optional_cached += 1,
        Err(e) => {
          warn!(%version, %url, error = %e, "optional resource not cached");
          optional_failed.push(url.clone());
        }
      }
    }

    self.store.set_state(version, VersionState::Installed)?;
    info!(%version, optional_cached, optional_failed = optional_failed.len(), "cache version installed");

    Ok(InstallReport {
      version: version.clone(),
      required_cached: precache.required.len(),
      optional_cached,
      optional_failed,
    })
  }

  /// Make an installed version active and reclaim every other version.
  ///
  /// Strategy operations still running against the previous version may
  /// find their entries gone; their late writes are rejected by the store.
  pub async fn activate(&self, version: &CacheVersion) -> Result<ActivationReport> {
    let _guard = self.transition.lock().await;

    let previous = self.current_version();
    match self.store.state(version)? {
      Some(VersionState::Installed) => {}
      Some(VersionState::Active) => {
        return Ok(ActivationReport {
          version: version.clone(),
          previous,
          reclaimed_entries: self.collect_garbage_for(version)?,
        });
      }
      other => {
        return Err(Error::Lifecycle(format!(
          "cannot activate version {} in state {}",
          version,
          other.map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string())
        )));
      }
    }

    for record in self.store.versions()? {
      if record.version != *version && record.state != VersionState::Superseded {
        self
          .store
          .set_state(&record.version, VersionState::Superseded)?;
      }
    }
    self.store.set_state(version, VersionState::Active)?;
    self.active.send_replace(Some(version.clone()));

    info!(%version, previous = ?previous, "cache version activated");
    self.notifier.broadcast(Event::VersionChanged {
      version: version.clone(),
    });

    let reclaimed_entries = self.collect_garbage_for(version)?;

    Ok(ActivationReport {
      version: version.clone(),
      previous,
      reclaimed_entries,
    })
  }

  /// Activate the most recently installed version, if one is waiting.
  pub async fn skip_waiting(&self) -> Result<Option<ActivationReport>> {
    let waiting = self
      .store
      .versions()?
      .into_iter()
      .rev()
      .find(|record| record.state == VersionState::Installed)
      .map(|record| record.version);

    match waiting {
      Some(version) => self.activate(&version).await.map(Some),
      None => Ok(None),
    }
  }

  /// Delete entries left behind by superseded or forgotten versions.
  ///
  /// Installed and Installing versions keep their entries: an installed
  /// version waiting for activation must still hold its precache set.
  pub fn collect_garbage(&self) -> Result<usize> {
    let active = self.current_version();
    let mut reclaimed = 0;
    for version in self.store.list_versions()? {
      if Some(&version) == active.as_ref() {
        continue;
      }
      match self.store.state(&version)? {
        Some(VersionState::Installing) | Some(VersionState::Installed) => {}
        Some(VersionState::Active) | Some(VersionState::Superseded) | None => {
          let removed = self.store.delete_version(&version)?;
          info!(%version, removed, "reclaimed stale cache version");
          reclaimed += removed;
        }
      }
    }
    Ok(reclaimed)
  }

  fn collect_garbage_for(&self, keep: &CacheVersion) -> Result<usize> {
    let mut reclaimed = 0;
    for version in self.store.list_versions()? {
      if version != *keep {
        let removed = self.store.delete_version(&version)?;
        info!(%version, removed, "reclaimed superseded cache version");
        reclaimed += removed;
      }
    }
    Ok(reclaimed)
  }

  async fn cache_resource(&self, version: &CacheVersion, url: &Url) -> Result<()> {
    let req = Request::get(url.clone());
    let resp = self.fetcher.fetch(&req).await?;
    if !resp.is_success() {
      return Err(Error::RemoteRejected {
        status: resp.status,
      });
    }

    let key = CacheKey::new("GET", url, Vec::new());
    self.store.put(version, &Entry::from_response(key, &resp))
  }

  fn abort_install(&self, version: &CacheVersion) {
    if let Err(e) = self.store.delete_version(version) {
      warn!(%version, error = %e, "failed to discard partial install");
    }
    if let Err(e) = self.store.forget(version) {
      warn!(%version, error = %e, "failed to forget aborted version");
    }
  }
}
