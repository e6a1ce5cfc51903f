//! HTTP transport used by the cache and the mutation queue.

mod client;
mod types;

pub use client::HttpClient;
pub use types::{Headers, NetworkResponse, RequestBody, RequestOptions};
