//! Scripted network fakes shared by unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::network::Fetcher;
use crate::sync::{OperationId, PendingOperation, RemoteSubmit, SyncResult};

#[derive(Debug, Clone)]
pub enum Route {
  Respond(u16, String),
  Fail,
  Hang,
}

/// Fetcher answering from a URL table. Unknown URLs fail as offline.
#[derive(Default)]
pub struct FakeFetcher {
  routes: Mutex<HashMap<String, Route>>,
  calls: AtomicUsize,
  gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeFetcher {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn respond(&self, url: &str, status: u16, body: &str) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), Route::Respond(status, body.to_string()));
  }

  pub fn fail(&self, url: &str) {
    self.routes.lock().unwrap().insert(url.to_string(), Route::Fail);
  }

  pub fn hang(&self, url: &str) {
    self.routes.lock().unwrap().insert(url.to_string(), Route::Hang);
  }

  /// Hold every fetch until a permit is added to the returned semaphore.
  pub fn close_gate(&self) -> Arc<Semaphore> {
    let gate = Arc::new(Semaphore::new(0));
    *self.gate.lock().unwrap() = Some(gate.clone());
    gate
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Fetcher for FakeFetcher {
  async fn fetch(&self, req: &Request) -> Result<Response> {
    self.calls.fetch_add(1, Ordering::SeqCst);

    let gate = self.gate.lock().unwrap().clone();
    if let Some(gate) = gate {
      gate.acquire().await.unwrap().forget();
    }

    let route = self.routes.lock().unwrap().get(req.url.as_str()).cloned();
    match route {
      Some(Route::Respond(status, body)) => Ok(Response::new(
        status,
        vec![("content-type".to_string(), "text/plain".to_string())],
        body.into_bytes(),
      )),
      Some(Route::Hang) => std::future::pending().await,
      Some(Route::Fail) | None => Err(Error::NetworkUnavailable(format!(
        "offline: {}",
        req.url
      ))),
    }
  }
}

/// Remote submitter with per-operation scripted outcomes. Unscripted
/// operations succeed.
#[derive(Default)]
pub struct ScriptedSubmit {
  outcomes: Mutex<HashMap<OperationId, SyncResult>>,
  /// Outcomes consumed by the first attempt only
  once: Mutex<HashMap<OperationId, SyncResult>>,
  panics: Mutex<Vec<OperationId>>,
  seen: Mutex<Vec<OperationId>>,
  gate: Mutex<Option<Arc<Semaphore>>>,
  holds: Mutex<HashMap<OperationId, Arc<Semaphore>>>,
}

impl ScriptedSubmit {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn script(&self, id: OperationId, result: SyncResult) {
    self.outcomes.lock().unwrap().insert(id, result);
  }

  pub fn script_once(&self, id: OperationId, result: SyncResult) {
    self.once.lock().unwrap().insert(id, result);
  }

  pub fn panic_on(&self, id: OperationId) {
    self.panics.lock().unwrap().push(id);
  }

  pub fn close_gate(&self) -> Arc<Semaphore> {
    let gate = Arc::new(Semaphore::new(0));
    *self.gate.lock().unwrap() = Some(gate.clone());
    gate
  }

  /// Hold submissions of one operation until a permit is added.
  pub fn hold(&self, id: OperationId) -> Arc<Semaphore> {
    let gate = Arc::new(Semaphore::new(0));
    self.holds.lock().unwrap().insert(id, gate.clone());
    gate
  }

  pub fn seen(&self) -> Vec<OperationId> {
    self.seen.lock().unwrap().clone()
  }
}

#[async_trait]
impl RemoteSubmit for ScriptedSubmit {
  async fn submit(&self, op: &PendingOperation) -> SyncResult {
    self.seen.lock().unwrap().push(op.id);

    let gate = self.gate.lock().unwrap().clone();
    if let Some(gate) = gate {
      gate.acquire().await.unwrap().forget();
    }
    let hold = self.holds.lock().unwrap().get(&op.id).cloned();
    if let Some(hold) = hold {
      hold.acquire().await.unwrap().forget();
    }

    let should_panic = self.panics.lock().unwrap().contains(&op.id);
    if should_panic {
      panic!("scripted panic for operation {}", op.id);
    }

    if let Some(result) = self.once.lock().unwrap().remove(&op.id) {
      return result;
    }
    self
      .outcomes
      .lock()
      .unwrap()
      .get(&op.id)
      .cloned()
      .unwrap_or(SyncResult::Succeeded)
  }
}
