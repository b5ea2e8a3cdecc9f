//! Scripted fetcher for tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::net::{Fetcher, Request, Response};

/// Answers every request with 200 and a body of `"<url> #<n>"`, where `n`
/// counts calls for that URL. Individual URLs can fail, return a status, or
/// block until released.
#[derive(Default)]
pub(crate) struct ScriptedFetcher {
  offline: AtomicBool,
  failing: Mutex<HashSet<String>>,
  statuses: Mutex<HashMap<String, u16>>,
  held: Mutex<HashMap<String, Arc<Notify>>>,
  calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Every request fails.
  pub(crate) fn offline(self) -> Self {
    self.offline.store(true, Ordering::SeqCst);
    self
  }

  /// Requests for `url` fail.
  pub(crate) fn failing(self, url: &str) -> Self {
    self.failing.lock().unwrap().insert(url.to_string());
    self
  }

  pub(crate) fn with_status(self, url: &str, status: u16) -> Self {
    self.statuses.lock().unwrap().insert(url.to_string(), status);
    self
  }

  /// Requests for `url` block until the returned handle is notified.
  pub(crate) fn hold(&self, url: &str) -> Arc<Notify> {
    let notify = Arc::new(Notify::new());
    self
      .held
      .lock()
      .unwrap()
      .insert(url.to_string(), Arc::clone(&notify));
    notify
  }

  /// URLs requested so far, in order.
  pub(crate) fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }
}

impl Fetcher for ScriptedFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let url = request.url.to_string();
    let attempt = {
      let mut calls = self.calls.lock().unwrap();
      calls.push(url.clone());
      calls.iter().filter(|u| **u == url).count()
    };

    let gate = self.held.lock().unwrap().get(&url).cloned();
    if let Some(gate) = gate {
      gate.notified().await;
    }

    if self.offline.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&url) {
      return Err(eyre!("Failed to fetch {}: network unreachable", url));
    }

    let status = self.statuses.lock().unwrap().get(&url).copied().unwrap_or(200);
    Ok(Response {
      status,
      status_text: String::new(),
      url: url.clone(),
      headers: vec![("content-type".into(), "text/html".into())],
      body: format!("{url} #{attempt}").into_bytes(),
    })
  }
}
