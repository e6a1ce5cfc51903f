//! Subcommands of the `harbor` binary.

use std::io::Write;

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;

use crate::cache::CacheStrategy;
use crate::client::{GetOptions, Harbor, MutateOptions, MutationOutcome, Payload};
use crate::net::RequestOptions;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
  /// Read a URL through the cache
  Get {
    url: String,
    /// cacheFirst, staleWhileRevalidate or networkThenCache
    #[arg(short, long)]
    strategy: Option<CacheStrategy>,
    /// How long the stored copy stays fresh, e.g. 5m
    #[arg(long)]
    ttl: Option<String>,
  },
  /// Send a write, queueing it when the network is unavailable
  Mutate {
    url: String,
    #[arg(short = 'X', long, default_value = "POST")]
    method: String,
    /// Request body; sent as JSON when it parses as JSON
    #[arg(short, long)]
    data: Option<String>,
    /// Extra header as "Name: value"
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Envelope id to use if the write gets queued
    #[arg(long)]
    id: Option<String>,
  },
  /// Run one flush pass over the mutation queue
  Sync,
  /// Show pending mutations
  Queue {
    /// Show dead-lettered mutations instead
    #[arg(long)]
    dead: bool,
  },
  /// Inspect or prune the response cache
  #[command(subcommand)]
  Cache(CacheCommand),
  /// Pre-cache the configured app shell URLs
  Warm,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum CacheCommand {
  /// List cached entries, newest first
  List,
  /// Remove every cached entry
  Clear,
  /// Remove entries whose TTL has run out
  ClearExpired,
  /// Remove entries whose URL starts with a prefix
  Purge { prefix: String },
}

/// Execute `command`, writing its output to `out`.
pub async fn run(harbor: &Harbor, command: Command, out: &mut impl Write) -> Result<()> {
  match command {
    Command::Get { url, strategy, ttl } => {
      let options = GetOptions {
        strategy,
        ttl,
        ..GetOptions::default()
      };
      match harbor.get(&url, options).await? {
        Payload::Json(value) => writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?,
        Payload::Text(text) => writeln!(out, "{}", text)?,
      }
    }
    Command::Mutate {
      url,
      method,
      data,
      headers,
      id,
    } => {
      let mut request = RequestOptions::new(method);
      for raw in &headers {
        let (name, value) = parse_header(raw)?;
        request = request.with_header(name, value);
      }
      if let Some(data) = data {
        request = match serde_json::from_str::<Value>(&data) {
          Ok(json) => request.with_json(json),
          Err(_) => request.with_text(data),
        };
      }

      let options = MutateOptions { id, request };
      let outcome = harbor.mutate(&url, options).await?;
      match &outcome {
        MutationOutcome::Delivered(response) => {
          writeln!(out, "{} {}", outcome.status(), outcome.status_text())?;
          if !response.body.is_empty() {
            writeln!(out, "{}", String::from_utf8_lossy(&response.body))?;
          }
        }
        MutationOutcome::Queued(envelope) => {
          writeln!(out, "{} {} ({})", outcome.status(), outcome.status_text(), envelope.id)?;
        }
      }
    }
    Command::Sync => {
      let synced = harbor.process_queue_now().await?;
      let remaining = harbor.pending_mutations().await?.len();
      for envelope in &synced {
        writeln!(out, "synced {} {} {}", envelope.id, envelope.method, envelope.url)?;
      }
      writeln!(out, "{} synced, {} pending", synced.len(), remaining)?;
    }
    Command::Queue { dead } => {
      let envelopes = if dead {
        harbor.dead_letters().await?
      } else {
        harbor.pending_mutations().await?
      };
      writeln!(out, "{}", serde_json::to_string_pretty(&envelopes)?)?;
    }
    Command::Cache(cache) => run_cache(harbor, cache, out).await?,
    Command::Warm => {
      let warmed = harbor.warm_app_shell().await?;
      writeln!(out, "warmed {} of {} urls", warmed, harbor.config().app_shell.len())?;
    }
  }
  Ok(())
}

async fn run_cache(harbor: &Harbor, command: CacheCommand, out: &mut impl Write) -> Result<()> {
  let removed = match command {
    CacheCommand::List => {
      for entry in harbor.list_cache().await? {
        let ttl = entry
          .ttl_ms
          .map(|ms| format!("{}ms", ms))
          .unwrap_or_else(|| "-".to_string());
        writeln!(out, "{}\t{}\t{}", entry.cached_at.to_rfc3339(), ttl, entry.key)?;
      }
      return Ok(());
    }
    CacheCommand::Clear => harbor.clear_cache().await?,
    CacheCommand::ClearExpired => harbor.clear_expired().await?,
    CacheCommand::Purge { prefix } => harbor.purge_cache(&prefix).await?,
  };
  writeln!(out, "removed {} entries", removed)?;
  Ok(())
}

/// Split "Name: value" into its parts.
fn parse_header(raw: &str) -> Result<(&str, &str)> {
  let (name, value) = raw
    .split_once(':')
    .ok_or_else(|| eyre!("header must look like \"Name: value\", got {:?}", raw))?;
  let name = name.trim();
  if name.is_empty() {
    return Err(eyre!("header name is empty in {:?}", raw));
  }
  Ok((name, value.trim()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::db::SqliteStore;
  use clap::Parser;
  use serde_json::json;
  use std::sync::Arc;
  use wiremock::matchers::{body_json, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  #[derive(Parser, Debug)]
  struct Cli {
    #[command(subcommand)]
    command: Command,
  }

  fn parse(args: &[&str]) -> Command {
    let mut argv = vec!["harbor"];
    argv.extend_from_slice(args);
    Cli::try_parse_from(argv).unwrap().command
  }

  async fn harbor() -> Harbor {
    Harbor::builder(Config::default())
      .store(Arc::new(SqliteStore::open_in_memory().unwrap()))
      .build()
      .await
      .unwrap()
  }

  async fn run_to_string(harbor: &Harbor, command: Command) -> String {
    let mut out = Vec::new();
    run(harbor, command, &mut out).await.unwrap();
    String::from_utf8(out).unwrap()
  }

  #[test]
  fn test_parse_get_with_strategy() {
    let cmd = parse(&["get", "https://a.test/x", "--strategy", "cache-first", "--ttl", "5m"]);
    assert_eq!(
      cmd,
      Command::Get {
        url: "https://a.test/x".into(),
        strategy: Some(CacheStrategy::CacheFirst),
        ttl: Some("5m".into()),
      }
    );
  }

  #[test]
  fn test_parse_cache_subcommands() {
    assert_eq!(parse(&["cache", "clear-expired"]), Command::Cache(CacheCommand::ClearExpired));
    assert_eq!(
      parse(&["cache", "purge", "https://a.test/"]),
      Command::Cache(CacheCommand::Purge {
        prefix: "https://a.test/".into()
      })
    );
  }

  #[test]
  fn test_parse_header() {
    assert_eq!(parse_header("X-Trace: abc ").unwrap(), ("X-Trace", "abc"));
    assert!(parse_header("no colon").is_err());
    assert!(parse_header(": value").is_err());
  }

  #[tokio::test]
  async fn test_get_prints_pretty_json() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/posts"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1})))
      .mount(&server)
      .await;
    let harbor = harbor().await;

    let url = format!("{}/posts", server.uri());
    let out = run_to_string(&harbor, parse(&["get", url.as_str()])).await;
    assert_eq!(out, "{\n  \"id\": 1\n}\n");

    let listing = run_to_string(&harbor, parse(&["cache", "list"])).await;
    assert!(listing.trim_end().ends_with(&format!("GET {}/posts", server.uri())));
  }

  #[tokio::test]
  async fn test_mutate_then_sync() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
      .and(body_json(json!({"done": true})))
      .respond_with(ResponseTemplate::new(503))
      .up_to_n_times(1)
      .mount(&server)
      .await;
    Mock::given(method("PUT"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;
    let harbor = harbor().await;
    let url = format!("{}/todos/1", server.uri());

    let queued = run_to_string(
      &harbor,
      parse(&["mutate", url.as_str(), "-X", "PUT", "-d", r#"{"done":true}"#, "--id", "t1"]),
    )
    .await;
    assert_eq!(queued, "202 Queued offline (t1)\n");

    let queue = run_to_string(&harbor, parse(&["queue"])).await;
    assert!(queue.contains("\"id\": \"t1\""));

    let synced = run_to_string(&harbor, parse(&["sync"])).await;
    assert!(synced.starts_with(&format!("synced t1 PUT {}", url)));
    assert!(synced.ends_with("1 synced, 0 pending\n"));
  }
}
