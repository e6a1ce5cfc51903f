use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use tracing::debug;
use url::Url;

use super::types::{Headers, NetworkResponse, RequestBody, RequestOptions};
use crate::config::NetworkConfig;
use crate::error::{Error, Result};

/// Thin reqwest wrapper that buffers responses and maps failures onto the
/// library error taxonomy. Every attempt is bounded by the client timeout.
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
}

impl HttpClient {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let mut builder = reqwest::Client::builder().timeout(config.timeout());
    if let Some(agent) = &config.user_agent {
      builder = builder.user_agent(agent.clone());
    }

    let client = builder
      .build()
      .map_err(|e| Error::InvalidRequest(format!("failed to build http client: {}", e)))?;
    Ok(Self { client })
  }

  pub fn with_timeout(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| Error::InvalidRequest(format!("failed to build http client: {}", e)))?;
    Ok(Self { client })
  }

  /// Send a request and buffer whatever comes back, success or not.
  ///
  /// `default_method` applies when `options` carries none.
  pub async fn send(
    &self,
    url: &str,
    options: &RequestOptions,
    default_method: &str,
  ) -> Result<NetworkResponse> {
    let method_name = options.method_or(default_method);
    let parsed = Url::parse(url).map_err(|e| Error::InvalidRequest(format!("{}: {}", url, e)))?;
    let method = Method::from_bytes(method_name.as_bytes())
      .map_err(|_| Error::InvalidRequest(format!("unsupported method {}", method_name)))?;

    let mut request = self
      .client
      .request(method, parsed)
      .headers(header_map(&options.headers)?);
    request = match &options.body {
      Some(RequestBody::Json(value)) => request.json(value),
      Some(RequestBody::Text(text)) => request.body(text.clone()),
      None => request,
    };

    debug!(method = %method_name, %url, "sending request");
    let network_err = |source| Error::Network {
      method: method_name.clone(),
      url: url.to_string(),
      source,
    };

    let response = request.send().await.map_err(network_err)?;
    let status = response.status().as_u16();
    let headers = collect_headers(response.headers());
    let body = response.bytes().await.map_err(network_err)?.to_vec();
    debug!(method = %method_name, %url, status, bytes = body.len(), "received response");

    Ok(NetworkResponse {
      status,
      headers,
      body,
    })
  }

  /// Like [`send`](Self::send), but a non-2xx status is an error.
  pub async fn send_ok(
    &self,
    url: &str,
    options: &RequestOptions,
    default_method: &str,
  ) -> Result<NetworkResponse> {
    let response = self.send(url, options, default_method).await?;
    if response.is_success() {
      Ok(response)
    } else {
      Err(Error::RemoteRejection {
        method: options.method_or(default_method),
        url: url.to_string(),
        status: response.status,
      })
    }
  }
}

fn header_map(headers: &Headers) -> Result<HeaderMap> {
  let mut map = HeaderMap::with_capacity(headers.len());
  for (name, value) in headers {
    let name = HeaderName::from_bytes(name.as_bytes())
      .map_err(|_| Error::InvalidRequest(format!("invalid header name {:?}", name)))?;
    let value = HeaderValue::from_str(value)
      .map_err(|_| Error::InvalidRequest(format!("invalid value for header {}", name)))?;
    map.insert(name, value);
  }
  Ok(map)
}

/// Flatten a header map, joining repeated headers with ", ".
fn collect_headers(map: &HeaderMap) -> Headers {
  let mut headers = Headers::new();
  for (name, value) in map {
    let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
    headers
      .entry(name.as_str().to_string())
      .and_modify(|existing: &mut String| {
        existing.push_str(", ");
        existing.push_str(&value);
      })
      .or_insert(value);
  }
  headers
}
