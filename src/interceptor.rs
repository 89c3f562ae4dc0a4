//! Response hooks run after routing.
//!
//! Interceptors are registered once on the worker and see every routed
//! response. They never change the response; they only decide whether the
//! foreground should be told something.

use crate::cache::{Served, ServedFrom};
use crate::event::ClientMessage;
use crate::net::Request;
use crate::router::OFFLINE_HEADER;

pub trait Interceptor: Send + Sync {
  fn inspect(&self, request: &Request, served: &Served) -> Option<ClientMessage>;
}

/// Tells pages when they are looking at an offline placeholder.
pub struct OfflineNotice;

impl Interceptor for OfflineNotice {
  fn inspect(&self, _request: &Request, served: &Served) -> Option<ClientMessage> {
    let offline = served.source == ServedFrom::Synthesized
      && served.response.header(OFFLINE_HEADER).is_some();
    offline.then_some(ClientMessage::Offline)
  }
}

/// Flags navigations to identity-gated sections the backend refused.
pub struct KycGate {
  sections: Vec<String>,
}

impl KycGate {
  pub fn new(sections: Vec<String>) -> Self {
    Self { sections }
  }

  fn section_for(&self, path: &str) -> Option<&str> {
    self
      .sections
      .iter()
      .find(|s| path == s.as_str() || path.starts_with(&format!("{}/", s.trim_end_matches('/'))))
      .map(String::as_str)
  }
}

impl Interceptor for KycGate {
  fn inspect(&self, request: &Request, served: &Served) -> Option<ClientMessage> {
    if !matches!(served.response.status, 401 | 403) {
      return None;
    }

    self
      .section_for(request.url.path())
      .map(|section| ClientMessage::KycRequired {
        section: section.to_string(),
      })
  }
}

/// Ordered set of interceptors applied to every routed response.
#[derive(Default)]
pub struct InterceptorChain {
  interceptors: Vec<Box<dyn Interceptor>>,
}

impl InterceptorChain {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(mut self, interceptor: impl Interceptor + 'static) -> Self {
    self.interceptors.push(Box::new(interceptor));
    self
  }

  pub fn run(&self, request: &Request, served: &Served) -> Vec<ClientMessage> {
    self
      .interceptors
      .iter()
      .filter_map(|i| i.inspect(request, served))
      .collect()
  }
}
