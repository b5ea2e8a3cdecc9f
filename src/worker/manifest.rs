use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use url::Url;

use crate::net::Request;

/// Paths seeded into the store when a live fetch fails.
pub const DEFAULT_PRECACHE: [&str; 6] = [
  "/",
  "/index.html",
  "/index.html?homescreen=1",
  "/?homescreen=1",
  "/assets/css/main.css",
  "/images/*",
];

/// Ordered list of site paths to precache.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct PrecacheManifest {
  paths: Vec<String>,
}

impl Default for PrecacheManifest {
  fn default() -> Self {
    Self::new(DEFAULT_PRECACHE.iter().map(|p| p.to_string()).collect())
  }
}

impl PrecacheManifest {
  pub fn new(paths: Vec<String>) -> Self {
    Self { paths }
  }

  pub fn paths(&self) -> &[String] {
    &self.paths
  }

  /// GET requests for every path, resolved against `base`.
  ///
  /// Paths are site-absolute, so any URL on the site works as the base.
  pub fn resolve(&self, base: &Url) -> Result<Vec<Request>> {
    self
      .paths
      .iter()
      .map(|path| {
        let url = base
          .join(path)
          .map_err(|e| eyre!("Invalid precache path '{}': {}", path, e))?;
        Ok(Request::new(reqwest::Method::GET, url))
      })
      .collect()
  }
}
