//! Fetch interface: request/response snapshots and the network seam.
//!
//! Everything the worker sends over the wire goes through [`Network`], so the
//! routing strategies, the pre-warm step and the queue replay can run against
//! a real HTTP client or a scripted one.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::config::NetworkConfig;

pub type Headers = BTreeMap<String, String>;

/// Declared destination of a request, as reported by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  Document,
  Style,
  Script,
  Image,
  #[default]
  Empty,
}

impl FromStr for Destination {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "document" => Ok(Self::Document),
      "style" => Ok(Self::Style),
      "script" => Ok(Self::Script),
      "image" => Ok(Self::Image),
      "" | "empty" => Ok(Self::Empty),
      other => Err(format!("unknown request destination: {}", other)),
    }
  }
}

/// An outgoing request as seen by the interceptor.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub destination: Destination,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_uppercase(),
      url,
      destination: Destination::Empty,
      headers: Headers::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_json_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self
      .headers
      .insert("Content-Type".to_string(), "application/json".to_string());
    self.body = Some(body.into());
    self
  }
}

/// Snapshot of an HTTP response: status, headers and the full body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
    }
  }

  /// Response with a JSON body and matching content type.
  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self::new(status, value.to_string()).with_header("Content-Type", "application/json")
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_string(), value.to_string());
    self
  }

  /// 2xx status.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Why a fetch produced no response at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
  /// No connectivity, DNS failure, refused connection or timeout.
  #[error("network unreachable: {0}")]
  Connectivity(String),
  /// The request could not be built or the response could not be read.
  #[error("request failed: {0}")]
  Protocol(String),
}

/// The network as seen by the worker.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// [`Network`] backed by reqwest.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .user_agent(concat!("cipsw/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| FetchError::Protocol(format!("invalid method {}: {}", request.method, e)))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(classify_error)?;

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
    let body = response.bytes().await.map_err(classify_error)?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

fn classify_error(e: reqwest::Error) -> FetchError {
  if e.is_connect() || e.is_timeout() || e.is_request() {
    FetchError::Connectivity(e.to_string())
  } else {
    FetchError::Protocol(e.to_string())
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_destination_parsing() {
    assert_eq!("document".parse::<Destination>(), Ok(Destination::Document));
    assert_eq!("Style".parse::<Destination>(), Ok(Destination::Style));
    assert_eq!("".parse::<Destination>(), Ok(Destination::Empty));
    assert!("font".parse::<Destination>().is_err());
  }

  #[test]
  fn test_request_normalizes_method() {
    let url = Url::parse("https://cip.test/api/profile/update").unwrap();
    let request = Request::new("post", url).with_json_body("{}");

    assert_eq!(request.method, "POST");
    assert_eq!(
      request.headers.get("Content-Type").map(String::as_str),
      Some("application/json")
    );
    assert_eq!(request.body.as_deref(), Some(&b"{}"[..]));
  }

  #[test]
  fn test_response_helpers() {
    let response = Response::json(503, &serde_json::json!({ "error": "offline" }));

    assert!(!response.ok());
    assert_eq!(response.header("content-type"), Some("application/json"));
    assert!(response.text().contains("offline"));
    assert!(Response::new(204, "").ok());
  }
}
