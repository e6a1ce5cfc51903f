use std::env::var;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{registry, EnvFilter};

use harbor::commands::{self, Command};
use harbor::config::Config;
use harbor::net::HttpClient;
use harbor::plugins::{AnalyticsPlugin, LoggerPlugin, Plugin, ServerSyncPlugin};
use harbor::Harbor;

#[derive(Parser, Debug)]
#[command(name = "harbor")]
#[command(about = "Offline-first HTTP client with a local cache and write queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/harbor/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = setup_logging()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let plugins = plugins_from(&config)?;

  let harbor = Harbor::builder(config).plugins(plugins).build().await?;
  let mut stdout = std::io::stdout().lock();
  commands::run(&harbor, args.command, &mut stdout).await
}

/// Log to a daily file under the data directory; stdout carries command output.
fn setup_logging() -> Result<WorkerGuard> {
  let directives = match var("HARBOR_LOG") {
    Ok(value) if !value.trim().is_empty() => value,
    _ => "harbor=info".to_owned(),
  };

  let log_dir = dirs::data_dir()
    .ok_or_else(|| eyre!("could not determine a data directory"))?
    .join("harbor")
    .join("logs");
  std::fs::create_dir_all(&log_dir)?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "harbor.log"));
  registry()
    .with(EnvFilter::builder().parse(directives)?)
    .with(layer().with_writer(writer).with_ansi(false))
    .init();

  Ok(guard)
}

fn plugins_from(config: &Config) -> Result<Vec<Arc<dyn Plugin>>> {
  let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();
  if config.plugins.logger {
    plugins.push(Arc::new(LoggerPlugin));
  }

  let http = HttpClient::new(&config.network)?;
  if let Some(analytics) = &config.plugins.analytics {
    plugins.push(Arc::new(AnalyticsPlugin::new(Some(analytics.endpoint.clone()), http.clone())));
  }
  if let Some(sync) = &config.plugins.server_sync {
    plugins.push(Arc::new(ServerSyncPlugin::new(sync.endpoint.clone(), http)));
  }
  Ok(plugins)
}
