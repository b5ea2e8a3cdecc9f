//! Named cache handles over a shared storage backend.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use reqwest::Method;
use std::sync::Arc;

use super::storage::CacheStorage;
use super::traits::{CachedResponse, RequestKey};
use crate::net::{Fetcher, Request, Response};

/// Long-lived handle to every named cache in a backend.
///
/// Acquire once and pass it to whoever needs a store.
pub struct Caches<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage> Caches<S> {
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  /// Open a named cache, creating it on first use.
  pub fn open(&self, name: &str) -> Result<NamedCache<S>> {
    self.storage.create_cache(name)?;
    Ok(NamedCache {
      name: name.to_string(),
      storage: Arc::clone(&self.storage),
    })
  }

  pub fn names(&self) -> Result<Vec<String>> {
    self.storage.cache_names()
  }
}

impl<S: CacheStorage> Clone for Caches<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}

/// One named cache.
pub struct NamedCache<S: CacheStorage> {
  name: String,
  storage: Arc<S>,
}

impl<S: CacheStorage> NamedCache<S> {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Look up the stored response for this request identity.
  pub fn match_request(&self, request: &Request) -> Result<Option<CachedResponse>> {
    self
      .storage
      .match_entry(&self.name, &RequestKey::from_request(request))
  }

  /// Store a copy of `response`, replacing any previous entry for the
  /// same request identity. Only GET requests can be stored.
  pub fn put(&self, request: &Request, response: &Response) -> Result<()> {
    ensure_get(request)?;
    self.storage.put_entries(
      &self.name,
      &[(
        RequestKey::from_request(request),
        CachedResponse::snapshot(response),
      )],
    )
  }

  /// Fetch every request and store all responses.
  ///
  /// Nothing is stored unless every fetch succeeds with a 2xx status.
  pub async fn add_all<F: Fetcher>(&self, fetcher: &F, requests: &[Request]) -> Result<()> {
    for request in requests {
      ensure_get(request)?;
    }

    let responses = try_join_all(requests.iter().map(|request| async move {
      let response = fetcher.fetch(request).await?;
      if !response.ok() {
        return Err(eyre!(
          "Request for {} failed with status {}",
          request.url,
          response.status
        ));
      }
      Ok((
        RequestKey::from_request(request),
        CachedResponse::snapshot(&response),
      ))
    }))
    .await?;

    self.storage.put_entries(&self.name, &responses)
  }

  pub fn delete(&self, request: &Request) -> Result<bool> {
    self
      .storage
      .delete_entry(&self.name, &RequestKey::from_request(request))
  }

  pub fn keys(&self) -> Result<Vec<RequestKey>> {
    Ok(
      self
        .storage
        .entries(&self.name)?
        .into_iter()
        .map(|(key, _)| key)
        .collect(),
    )
  }

  pub fn entries(&self) -> Result<Vec<(RequestKey, CachedResponse)>> {
    self.storage.entries(&self.name)
  }

  /// Remove every entry, keeping the cache itself.
  pub fn clear(&self) -> Result<()> {
    self.storage.delete_cache(&self.name)?;
    self.storage.create_cache(&self.name)
  }
}

impl<S: CacheStorage> Clone for NamedCache<S> {
  fn clone(&self) -> Self {
    Self {
      name: self.name.clone(),
      storage: Arc::clone(&self.storage),
    }
  }
}

fn ensure_get(request: &Request) -> Result<()> {
  if request.method != Method::GET {
    return Err(eyre!(
      "Cannot cache {} {}: only GET requests are cacheable",
      request.method,
      request.url
    ));
  }
  Ok(())
}
