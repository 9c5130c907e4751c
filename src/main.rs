use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use lessonsw::clock::SystemClock;
use lessonsw::config::Config;
use lessonsw::db::Database;
use lessonsw::http::ReqwestFetcher;
use lessonsw::lifecycle::PrecacheManifest;
use lessonsw::signal::{next_signal, ControlMessage};
use lessonsw::sync::ReplayTrigger;
use lessonsw::{logging, Worker};

#[derive(Parser, Debug)]
#[command(name = "lessonsw")]
#[command(about = "Offline-resilience layer for the lesson PWA")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/lessonsw/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Path to the offline store (default: <data_dir>/lessonsw/lessonsw.db)
  #[arg(long, global = true)]
  db: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Host the background context until Ctrl-C
  ///
  /// Signals are printed as JSON lines on stdout. Control messages are read
  /// as JSON lines from stdin.
  Run,
  /// Replay the mutation queue once
  Flush,
  /// List queued mutations
  Queue,
  /// Fetch and print the feature flags
  Flags,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let _log_guard = logging::init(&logging::default_log_dir()?, args.verbose)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let db = Arc::new(Database::open(args.db.as_deref())?);
  let fetcher = Arc::new(ReqwestFetcher::new(Config::get_api_token())?);
  let worker = Worker::from_config(&config, db, fetcher, Arc::new(SystemClock))?;

  match args.command {
    Command::Run => run(&config, worker).await,
    Command::Flush => flush(&worker).await,
    Command::Queue => list_queue(&worker),
    Command::Flags => flags(&worker).await,
  }
}

async fn run(config: &Config, worker: Arc<Worker>) -> Result<()> {
  let mut signals = worker.subscribe();
  let printer = tokio::spawn(async move {
    while let Some(signal) = next_signal(&mut signals).await {
      match serde_json::to_string(&signal) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "Failed to encode signal"),
      }
    }
  });

  if let Err(e) = worker.flags().load_persisted() {
    warn!(error = %e, "Failed to load flag snapshot");
  }
  if let Err(e) = worker.flags().refresh_if_stale().await {
    warn!(error = %e, "Initial flag fetch failed");
  }

  if let Some(path) = &config.manifest {
    let manifest = PrecacheManifest::load(path)?;
    match worker.install(&manifest).await {
      Ok(outcome) => info!(version = %manifest.version, ?outcome, "Install finished"),
      Err(e) => warn!(version = %manifest.version, error = %e, "Install failed"),
    }
  }

  worker.start();

  let control = worker.control_sender();
  let reader = tokio::spawn(async move {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
      if line.trim().is_empty() {
        continue;
      }
      match serde_json::from_str::<ControlMessage>(&line) {
        Ok(message) => {
          if control.send(message).is_err() {
            break;
          }
        }
        Err(e) => warn!(error = %e, "Ignoring malformed control message"),
      }
    }
  });

  tokio::signal::ctrl_c().await?;
  info!("Shutting down");

  reader.abort();
  worker.shutdown().await;
  printer.abort();
  Ok(())
}

async fn flush(worker: &Worker) -> Result<()> {
  match worker.flush().await {
    ReplayTrigger::Completed(summary) => println!(
      "succeeded={} conflicted={} failed={} retrying={} blocked={}",
      summary.succeeded, summary.conflicted, summary.failed, summary.retrying, summary.blocked
    ),
    ReplayTrigger::AlreadyRunning => println!("A replay pass is already running"),
    ReplayTrigger::Offline => println!("Offline, nothing replayed"),
  }
  Ok(())
}

fn list_queue(worker: &Worker) -> Result<()> {
  let queue = worker.queue();
  let pending = queue.pending(queue.now())?;
  for entry in &pending {
    println!("{}", serde_json::to_string(entry)?);
  }
  eprintln!("{} pending", pending.len());
  Ok(())
}

async fn flags(worker: &Worker) -> Result<()> {
  let cache = worker.flags();
  if let Err(e) = cache.fetch_all().await {
    warn!(error = %e, "Flag fetch failed, showing last snapshot");
  }
  println!("{}", serde_json::to_string_pretty(&cache.flags())?);
  if let Some(at) = cache.fetched_at() {
    eprintln!("fetched at {}", at);
  }
  Ok(())
}
