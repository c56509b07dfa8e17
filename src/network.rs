//! Network fetch capability used by the strategy engine and the installer.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::http::{Request, Response};

/// Anything that can turn a request into a response over the network.
///
/// Error-status responses are returned as `Ok`; only a fetch that could not
/// complete is an `Err`.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, req: &Request) -> Result<Response>;
}

/// reqwest-backed fetcher.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  timeout: Duration,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self { client, timeout })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, req: &Request) -> Result<Response> {
    let method = reqwest::Method::from_bytes(req.method.as_bytes())
      .map_err(|e| Error::NetworkUnavailable(format!("invalid method {}: {}", req.method, e)))?;

    let mut builder = self.client.request(method, req.url.clone());
    for (name, value) in &req.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder.send().await.map_err(|e| {
      if e.is_timeout() {
        Error::Timeout(self.timeout)
      } else {
        Error::NetworkUnavailable(e.to_string())
      }
    })?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response.bytes().await.map_err(|e| {
      if e.is_timeout() {
        Error::Timeout(self.timeout)
      } else {
        Error::NetworkUnavailable(format!("Failed to read body: {}", e))
      }
    })?;

    Ok(Response::new(status, headers, body.to_vec()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  #[tokio::test]
  async fn test_fetch_returns_status_headers_and_body() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("GET", "/index.html")
      .match_header("accept", "text/html")
      .with_status(200)
      .with_header("content-type", "text/html")
      .with_body("<h1>hi</h1>")
      .create_async()
      .await;

    let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
    let url = Url::parse(&format!("{}/index.html", server.url())).unwrap();
    let resp = fetcher
      .fetch(&Request::get(url).with_header("accept", "text/html"))
      .await
      .unwrap();

    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-type"), Some("text/html"));
    assert_eq!(resp.body, b"<h1>hi</h1>");
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_error_status_is_not_an_error() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", "/missing")
      .with_status(404)
      .create_async()
      .await;

    let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
    let url = Url::parse(&format!("{}/missing", server.url())).unwrap();
    let resp = fetcher.fetch(&Request::get(url)).await.unwrap();

    assert_eq!(resp.status, 404);
    assert!(!resp.is_success());
  }

  #[tokio::test]
  async fn test_unreachable_host_is_network_unavailable() {
    let fetcher = HttpFetcher::new(Duration::from_secs(2)).unwrap();
    // Port 9 (discard) on localhost is not listening in test environments.
    let url = Url::parse("http://127.0.0.1:9/").unwrap();

    let err = fetcher.fetch(&Request::get(url)).await.unwrap_err();
    assert!(err.is_network());
  }
}
