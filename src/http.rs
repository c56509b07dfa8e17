//! Request and response types flowing through the strategy engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::Error;

/// Status returned when neither the cache nor the network could answer.
pub const STATUS_UNAVAILABLE: u16 = 503;

/// Header set on every locally synthesized fallback response.
pub const FALLBACK_HEADER: &str = "x-offsync-fallback";

const OFFLINE_PAGE: &str = "<!DOCTYPE html>
<html>
<head><meta charset=\"utf-8\"><title>Offline</title></head>
<body>
<h1>You are offline</h1>
<p>This page has not been saved for offline use. It will load again once the connection is back.</p>
</body>
</html>
";

/// Per-request cache policy, assigned by the caller's router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Strategy::CacheFirst => write!(f, "cache-first"),
      Strategy::NetworkFirst => write!(f, "network-first"),
      Strategy::StaleWhileRevalidate => write!(f, "stale-while-revalidate"),
    }
  }
}

impl FromStr for Strategy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().replace('_', "-").as_str() {
      "cache-first" | "cache" => Ok(Strategy::CacheFirst),
      "network-first" | "network" => Ok(Strategy::NetworkFirst),
      "stale-while-revalidate" | "swr" => Ok(Strategy::StaleWhileRevalidate),
      other => Err(format!("unknown strategy: {}", other)),
    }
  }
}

/// An inbound request descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub headers: Vec<(String, String)>,
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_uppercase(),
      url,
      headers: Vec::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  /// Whether the caller is a page navigation expecting HTML.
  pub fn accepts_html(&self) -> bool {
    self
      .header("accept")
      .map(|accept| accept.contains("text/html"))
      .unwrap_or(false)
  }

  /// Only GET goes through the strategies. A HEAD response has no body and
  /// must never stand in for the stored GET entry.
  pub fn is_cacheable(&self) -> bool {
    self.method == "GET"
  }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
  /// Fresh from the network
  Network,
  /// Served from the entry store
  Cache,
  /// Synthesized locally because nothing else was available
  Fallback,
}

/// A response handed back for every dispatched request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl Response {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
    Self {
      status,
      headers,
      body,
      source: ResponseSource::Network,
    }
  }

  pub fn with_source(mut self, source: ResponseSource) -> Self {
    self.source = source;
    self
  }

  /// Only 2xx responses are eligible for storage.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  pub fn is_fallback(&self) -> bool {
    self.source == ResponseSource::Fallback
  }

  /// Generic offline page for navigations with nothing cached.
  pub fn offline_page() -> Self {
    Self::fallback(
      "text/html; charset=utf-8",
      "offline-page",
      OFFLINE_PAGE.as_bytes().to_vec(),
    )
  }

  /// Generic error for non-HTML requests that could not be served.
  pub fn offline_error(url: &Url) -> Self {
    Self::fallback(
      "text/plain; charset=utf-8",
      "offline",
      format!("Offline: {} is not available", url).into_bytes(),
    )
  }

  /// Neither cache nor network produced anything for this request.
  pub fn no_content(url: &Url, cause: &Error) -> Self {
    let err = Error::NoContentAvailable(format!("{} ({})", url, cause));
    Self::fallback(
      "text/plain; charset=utf-8",
      "no-content-available",
      err.to_string().into_bytes(),
    )
  }

  fn fallback(content_type: &str, kind: &str, body: Vec<u8>) -> Self {
    Self {
      status: STATUS_UNAVAILABLE,
      headers: vec![
        ("content-type".to_string(), content_type.to_string()),
        (FALLBACK_HEADER.to_string(), kind.to_string()),
      ],
      body,
      source: ResponseSource::Fallback,
    }
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_strategy_parsing_accepts_aliases() {
    assert_eq!("cache-first".parse::<Strategy>(), Ok(Strategy::CacheFirst));
    assert_eq!("Network_First".parse::<Strategy>(), Ok(Strategy::NetworkFirst));
    assert_eq!("swr".parse::<Strategy>(), Ok(Strategy::StaleWhileRevalidate));
    assert!("lru".parse::<Strategy>().is_err());
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let req = Request::get(url("https://app.example/")).with_header("Accept", "text/html");
    assert_eq!(req.header("accept"), Some("text/html"));
    assert!(req.accepts_html());
  }

  #[test]
  fn test_only_get_is_cacheable() {
    assert!(Request::get(url("https://app.example/")).is_cacheable());
    assert!(!Request::new("head", url("https://app.example/")).is_cacheable());
    assert!(!Request::new("POST", url("https://app.example/")).is_cacheable());
  }

  #[test]
  fn test_fallbacks_are_marked() {
    let cause = Error::NetworkUnavailable("dns lookup failed".to_string());
    let resp = Response::no_content(&url("https://app.example/api"), &cause);
    assert_eq!(resp.status, STATUS_UNAVAILABLE);
    assert!(resp.is_fallback());
    assert_eq!(resp.header(FALLBACK_HEADER), Some("no-content-available"));
    assert_eq!(
      String::from_utf8_lossy(&resp.body),
      "no content available for https://app.example/api (network unavailable: dns lookup failed)"
    );

    let page = Response::offline_page();
    assert_eq!(page.header("content-type"), Some("text/html; charset=utf-8"));
  }
}
