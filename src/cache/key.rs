//! Request fingerprinting.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::http::Request;

/// Normalized identity of a cacheable request.
///
/// Two requests that differ only in URL fragment, header-name case, or the
/// order of their vary headers produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
  method: String,
  url: String,
  vary: Vec<(String, String)>,
  fingerprint: String,
}

impl CacheKey {
  /// Compute the key for a request, keeping only the listed vary headers.
  pub fn from_request(req: &Request, vary_headers: &[String]) -> Self {
    let vary = vary_headers
      .iter()
      .filter_map(|name| {
        req
          .header(name)
          .map(|value| (name.to_lowercase(), value.trim().to_string()))
      })
      .collect();
    Self::new(&req.method, &req.url, vary)
  }

  pub fn new(method: &str, url: &Url, mut vary: Vec<(String, String)>) -> Self {
    let method = normalize_method(method);
    let url = normalize_url(url);
    vary.sort();
    vary.dedup_by(|a, b| a.0 == b.0);

    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_bytes());
    for (name, value) in &vary {
      hasher.update(b"\n");
      hasher.update(name.as_bytes());
      hasher.update(b"=");
      hasher.update(value.as_bytes());
    }
    let fingerprint = hex::encode(hasher.finalize());

    Self {
      method,
      url,
      vary,
      fingerprint,
    }
  }

  /// Rebuild a key from its stored parts.
  pub(crate) fn from_parts(
    method: String,
    url: String,
    vary: Vec<(String, String)>,
    fingerprint: String,
  ) -> Self {
    Self {
      method,
      url,
      vary,
      fingerprint,
    }
  }

  pub fn fingerprint(&self) -> &str {
    &self.fingerprint
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  pub fn vary(&self) -> &[(String, String)] {
    &self.vary
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

fn normalize_method(method: &str) -> String {
  method.to_uppercase()
}

fn normalize_url(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}
