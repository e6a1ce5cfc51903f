use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Header map with lower-cased names.
pub type Headers = BTreeMap<String, String>;

/// Body of an outgoing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum RequestBody {
  /// Serialized as JSON on the wire.
  Json(serde_json::Value),
  /// Sent verbatim.
  Text(String),
}

/// Method, headers and body of a request; the URL travels separately.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
  /// HTTP method. Reads default to GET, writes to POST.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub method: Option<String>,
  #[serde(default)]
  pub headers: Headers,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<RequestBody>,
}

impl RequestOptions {
  pub fn new(method: impl Into<String>) -> Self {
    Self {
      method: Some(method.into()),
      ..Self::default()
    }
  }

  pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
    self
      .headers
      .insert(name.as_ref().to_ascii_lowercase(), value.into());
    self
  }

  pub fn with_json(mut self, body: serde_json::Value) -> Self {
    self.body = Some(RequestBody::Json(body));
    self
  }

  pub fn with_text(mut self, body: impl Into<String>) -> Self {
    self.body = Some(RequestBody::Text(body.into()));
    self
  }

  /// Upper-cased method, or `default` when none was given.
  pub fn method_or(&self, default: &str) -> String {
    self
      .method
      .as_deref()
      .unwrap_or(default)
      .to_ascii_uppercase()
  }
}

/// A fully-buffered response as received from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkResponse {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl NetworkResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn content_type(&self) -> Option<&str> {
    self.headers.get("content-type").map(String::as_str)
  }
}
