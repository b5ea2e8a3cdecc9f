use color_eyre::{eyre::eyre, Result};
use reqwest::header::HeaderMap;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use super::types::{Request, Response};

/// The network side of the cache manager.
///
/// An `Err` is a network failure (unreachable host, reset connection,
/// timeout). Any HTTP response, including 4xx and 5xx, is a success.
pub trait Fetcher: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// HTTP fetcher backed by reqwest.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(user_agent: Option<&str>, timeout: Option<Duration>) -> Result<Self> {
    let mut builder = reqwest::Client::builder()
      .user_agent(user_agent.unwrap_or(concat!("swcache/", env!("CARGO_PKG_VERSION"))));

    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let url = response.url().to_string();
    let headers = header_pairs(response.headers());

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?
      .to_vec();

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      url,
      headers,
      body,
    })
  }
}

/// Header snapshot. Values that are not valid UTF-8 are kept lossily.
fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .map(|(name, value)| {
      let value = match value.to_str() {
        Ok(v) => v.to_string(),
        Err(_) => {
          debug!(header = %name, "Header value is not UTF-8, storing lossy copy");
          String::from_utf8_lossy(value.as_bytes()).into_owned()
        }
      };
      (name.as_str().to_string(), value)
    })
    .collect()
}

impl<T: Fetcher> Fetcher for std::sync::Arc<T> {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
    (**self).fetch(request)
  }
}
