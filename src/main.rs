mod cache;
mod config;
mod event;
mod http;
mod net;
mod precache;
mod router;
mod strategy;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use cache::{CacheStorage, NamespaceManager, NoopStorage, SqliteStorage};
use event::EventHandler;
use http::{Request, ResponseSource};
use net::HttpNetwork;
use worker::{Activation, ControlMessage, Dispatch, ServiceWorker, SyncEvent, WorkerEvent};

#[derive(Parser, Debug)]
#[command(name = "expense-sw")]
#[command(about = "Offline caching worker for the expense tracker")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/expense-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin of the hosted app
  #[arg(short, long)]
  origin: Option<Url>,

  /// Pages of the app still open; they hold activation until SKIP_WAITING
  #[arg(long, default_value_t = 0)]
  open_pages: usize,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the install event and print the precache report
  Install,
  /// Install, then activate and purge stale namespaces
  Activate,
  /// Intercept a request and print the response
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    #[arg(long, default_value = "GET")]
    method: String,
  },
  /// Post a control message, e.g. '{"type":"CLEAR_CACHE"}'
  Message { json: String },
  /// Fire a background sync tag
  Sync {
    tag: String,
    #[arg(long)]
    periodic: bool,
  },
  /// List cache namespaces with their entry counts
  Caches,
}

/// Logs go to stderr, filtered by RUST_LOG (default "warn"), and to
/// `log_file` when configured.
fn init_tracing(log_file: Option<&PathBuf>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  let (file_layer, guard) = match log_file {
    Some(path) => {
      let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
      let file_name = path.file_name().unwrap_or(path.as_os_str());
      let appender =
        tracing_appender::rolling::never(directory.unwrap_or(std::path::Path::new(".")), file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_writer(writer).with_ansi(false)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(io::stderr))
    .with(file_layer)
    .with(filter)
    .init();

  guard
}

fn open_storage(config: &config::Config) -> Box<dyn CacheStorage> {
  let opened = config
    .database_path()
    .and_then(|path| SqliteStorage::open(&path));

  match opened {
    Ok(storage) => Box::new(storage),
    Err(e) => {
      warn!(error = %e, "cache database unavailable, running without cache");
      Box::new(NoopStorage)
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    config::Config { origin, ..config }
  } else {
    config
  };

  let _guard = init_tracing(config.log_file.as_ref());

  let cache = NamespaceManager::new(open_storage(&config), config.cache_names())
    .with_limits(config.role_limits()?);
  let network = HttpNetwork::new()?;
  let worker = Arc::new(ServiceWorker::new(&config, cache, network)?);
  for _ in 0..args.open_pages {
    worker.client_opened()?;
  }
  let events = EventHandler::new(Arc::clone(&worker));

  let installed = events.send(WorkerEvent::Install).await?;
  if !matches!(args.command, Command::Install | Command::Activate) {
    events.send(WorkerEvent::Activate).await?;
  }

  let outcome = match args.command {
    Command::Install => installed,
    Command::Activate => events.send(WorkerEvent::Activate).await?,
    Command::Fetch {
      url,
      navigate,
      method,
    } => {
      let url = config.resolve(&url)?;
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;
      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };
      events.send(WorkerEvent::Fetch(request.with_method(method))).await?
    }
    Command::Message { json } => {
      let message = ControlMessage::parse(&json)?;
      events.send(WorkerEvent::Message(message)).await?
    }
    Command::Sync { tag, periodic } => {
      events
        .send(WorkerEvent::Sync(SyncEvent { tag, periodic }))
        .await?
    }
    Command::Caches => {
      for info in worker.cache().list()? {
        let marker = if info.current { "*" } else { " " };
        println!("{} {:<40} {:>6}", marker, info.name, info.entries);
      }
      return Ok(());
    }
  };

  print_dispatch(&outcome);

  // Let stale-while-revalidate refreshes land before exiting
  worker.settle().await;

  Ok(())
}

fn print_dispatch(outcome: &Dispatch) {
  match outcome {
    Dispatch::NotHandled => println!("not intercepted"),
    Dispatch::Response(response) => {
      let source = match response.source {
        ResponseSource::Network => "network",
        ResponseSource::Cache => "cache",
        ResponseSource::Offline => "offline",
      };
      println!("{} ({})", response.status, source);
      for (name, value) in &response.headers {
        println!("{}: {}", name, value);
      }
      println!();
      println!("{}", String::from_utf8_lossy(&response.body));
    }
    Dispatch::Installed(report) => {
      println!(
        "precached {}, unchanged {}, failed {}",
        report.cached.len(),
        report.skipped.len(),
        report.failed.len()
      );
      for (url, reason) in &report.failed {
        println!("  {}: {}", url, reason);
      }
    }
    Dispatch::Activation(Activation::Activated { purged }) => {
      println!("activated, purged {:?}", purged);
    }
    Dispatch::Activation(Activation::Waiting) => println!("waiting for open pages to close"),
    Dispatch::Message(outcome) => println!("{:?}", outcome),
    Dispatch::Sync(outcome) => println!("{:?}", outcome),
    Dispatch::Rejected(reason) => println!("rejected: {}", reason),
  }
}
