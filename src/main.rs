use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use gqlsync::{CachePolicy, Config, Connectivity, Request, Response, SqliteStore, SyncClient};
use serde_json::Value;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gqlsync")]
#[command(about = "An offline-first GraphQL client with a persistent response cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/gqlsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  /// Treat the network as unavailable
  #[arg(long, global = true)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run a query
  Query(Operation),
  /// Run a mutation (clears the response cache)
  Mutate(Operation),
  /// Stream subscription events until the server completes or Ctrl-C
  Subscribe {
    #[command(flatten)]
    operation: Operation,

    /// Stop after this many events
    #[arg(long)]
    limit: Option<usize>,
  },
  /// Replay requests queued while offline
  Drain,
  /// Show cache and queue statistics
  Stats,
  /// Drop every cached response
  ClearCache,
  /// Drop every queued request
  ClearQueue,
}

#[derive(clap::Args, Debug)]
struct Operation {
  /// GraphQL document, or @path to read it from a file
  document: String,

  /// Variables as a JSON object
  #[arg(short, long)]
  variables: Option<String>,

  #[arg(short = 'n', long)]
  operation_name: Option<String>,

  /// cache-first, cache-only, network-first, network-only or cache-and-network
  #[arg(short, long, default_value = "cache-first")]
  policy: CachePolicy,

  /// Queue the request for replay if the network is unavailable
  #[arg(long)]
  persist: bool,
}

impl Operation {
  fn into_request(self) -> Result<Request> {
    let query = match self.document.strip_prefix('@') {
      Some(path) => std::fs::read_to_string(path)
        .map_err(|e| eyre!("Failed to read document {}: {}", path, e))?,
      None => self.document,
    };

    let mut request = Request::new(query)
      .with_policy(self.policy)
      .persist_offline(self.persist);
    if let Some(name) = self.operation_name {
      request = request.with_operation_name(name);
    }
    if let Some(raw) = self.variables {
      let variables = match serde_json::from_str::<Value>(&raw)? {
        Value::Object(map) => map.into_iter().collect(),
        _ => return Err(eyre!("--variables must be a JSON object")),
      };
      request = request.with_variables(variables);
    }
    Ok(request)
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.log_file.as_deref())?;

  // Connectivity is fixed for the life of one invocation; queued requests
  // are replayed with `drain`.
  let config = Config::load(args.config.as_deref())?;
  let client = SyncClient::<SqliteStore>::builder(config)
    .connectivity(Connectivity::new(!args.offline))
    .open()?;

  match args.command {
    Command::Query(operation) => {
      let response = client.query(&operation.into_request()?).await?;
      print_response(&response)?;
    }
    Command::Mutate(operation) => {
      let response = client.mutate(&operation.into_request()?).await?;
      print_response(&response)?;
    }
    Command::Subscribe { operation, limit } => {
      let mut handle = client.subscribe(&operation.into_request()?).await?;
      let mut seen = 0;
      loop {
        tokio::select! {
          event = handle.next() => match event {
            Some(Ok(response)) => print_response(&response)?,
            Some(Err(e)) => return Err(e.into()),
            None => break,
          },
          _ = tokio::signal::ctrl_c() => break,
        }
        seen += 1;
        if limit.is_some_and(|limit| seen >= limit) {
          break;
        }
      }
      client.unsubscribe(handle.id());
      client.subscriptions().disconnect();
    }
    Command::Drain => {
      let report = client.drain_offline_queue().await;
      println!(
        "attempted {}, succeeded {}, failed {}",
        report.attempted, report.succeeded, report.failed
      );
    }
    Command::Stats => {
      let cache = client.cache_stats()?;
      let queue = client.queue_stats()?;
      println!("cache entries:   {} ({} expired)", cache.total, cache.expired);
      println!("queued requests: {}", queue.pending);
      for request in client.pending_requests()? {
        let name = request.operation_name.as_deref().unwrap_or("<anonymous>");
        println!("  {:?} {}", request.kind, name);
      }
    }
    Command::ClearCache => client.clear_cache()?,
    Command::ClearQueue => client.clear_queue()?,
  }

  Ok(())
}

fn print_response(response: &Response) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(response)?);
  Ok(())
}

/// Log to stderr, or to `log_file` through a non-blocking writer. The
/// returned guard must outlive the program so buffered lines are flushed.
fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("GQLSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));

  let Some(path) = log_file else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  };

  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
  let dir = match path.parent() {
    Some(dir) if !dir.as_os_str().is_empty() => dir,
    _ => Path::new("."),
  };
  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Ok(Some(guard))
}
