//! Lifecycle event values handed to the cache manager.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::cache::CacheResult;
use crate::net::{Request, Response};

/// Output of a fetch event's response override.
pub type FetchOutcome = Result<CacheResult<Response>>;

/// Detached work an event asked the host to keep alive.
///
/// Tasks run as soon as they are registered; `settled` waits for all of them,
/// including tasks registered while it waits.
#[derive(Clone, Default)]
pub struct Lifetime {
  tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Lifetime {
  pub fn wait_until<Fut>(&self, work: Fut)
  where
    Fut: Future<Output = ()> + Send + 'static,
  {
    let handle = tokio::spawn(work);
    self
      .tasks
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(handle);
  }

  pub async fn settled(&self) {
    loop {
      let batch = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
      if batch.is_empty() {
        return;
      }
      for handle in batch {
        if let Err(e) = handle.await {
          warn!("Background task failed: {}", e);
        }
      }
    }
  }
}

/// An intercepted (or passed-through) outgoing request.
pub struct FetchEvent {
  request: Request,
  response: Option<JoinHandle<FetchOutcome>>,
  responded: bool,
  lifetime: Lifetime,
}

impl FetchEvent {
  pub fn new(request: Request) -> Self {
    Self {
      request,
      response: None,
      responded: false,
      lifetime: Lifetime::default(),
    }
  }

  pub fn request(&self) -> &Request {
    &self.request
  }

  /// Override the response. Allowed once per event; the future starts
  /// running immediately.
  pub fn respond_with<Fut>(&mut self, response: Fut) -> Result<()>
  where
    Fut: Future<Output = FetchOutcome> + Send + 'static,
  {
    if self.responded {
      return Err(eyre!(
        "respond_with already called for {}",
        self.request.url
      ));
    }
    self.responded = true;
    self.response = Some(tokio::spawn(response));
    Ok(())
  }

  /// Whether a handler took over this request.
  pub fn is_intercepted(&self) -> bool {
    self.responded
  }

  pub fn wait_until<Fut>(&self, work: Fut)
  where
    Fut: Future<Output = ()> + Send + 'static,
  {
    self.lifetime.wait_until(work);
  }

  /// Handle for registering lifetime extensions from spawned work.
  pub fn lifetime(&self) -> Lifetime {
    self.lifetime.clone()
  }

  /// Await the overridden response.
  ///
  /// `None` means nothing intercepted the request and the host should
  /// handle it itself.
  pub async fn response(&mut self) -> Option<FetchOutcome> {
    let handle = self.response.take()?;
    Some(match handle.await {
      Ok(outcome) => outcome,
      Err(e) => Err(eyre!("Response task for {} failed: {}", self.request.url, e)),
    })
  }

  /// Wait for every lifetime extension registered on this event.
  pub async fn settled(&self) {
    self.lifetime.settled().await
  }
}

/// Install event for a new worker version.
#[derive(Default)]
pub struct InstallEvent {
  skip_waiting: AtomicBool,
}

impl InstallEvent {
  pub fn new() -> Self {
    Self::default()
  }

  /// Ask to become the active worker without waiting for the current one
  /// to release its clients.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  pub fn skipped_waiting(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }
}
