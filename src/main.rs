use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::bail, eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use agrisync::config::Config;
use agrisync::db::Database;
use agrisync::engine::Engine;
use agrisync::http::Request;
use agrisync::logging;
use agrisync::network::HttpNetwork;
use agrisync::sync::{Mutation, SyncAction, SyncStatus};

#[derive(Parser, Debug)]
#[command(name = "agrisync")]
#[command(about = "Offline cache and sync engine for the Agri Training client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/agrisync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Path to the engine database (default: $XDG_DATA_HOME/agrisync/engine.db)
  #[arg(short, long)]
  database: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show queue size, failures and last sync time
  Status,
  /// Replay queued mutations now
  Sync,
  /// Inspect or edit the sync queue
  Queue {
    #[command(subcommand)]
    command: QueueCommand,
  },
  /// Queue a mutation for replay
  Enqueue {
    action: ActionArg,
    /// Endpoint path, e.g. /api/bookings
    endpoint: String,
    /// JSON body
    #[arg(long)]
    data: Option<String>,
  },
  /// Fetch a path through the cache
  Fetch {
    path: String,
    /// Treat as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Run the sync loop until interrupted
  Run,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// List queued items in replay order
  List {
    #[arg(long)]
    status: Option<StatusArg>,
  },
  /// Delete queued items
  Clear {
    #[arg(long)]
    status: Option<StatusArg>,
    /// Confirm deletion
    #[arg(long)]
    yes: bool,
  },
  /// Retry a failed item with a fresh retry budget
  Retry { id: Uuid },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ActionArg {
  Create,
  Update,
  Delete,
}

impl From<ActionArg> for SyncAction {
  fn from(arg: ActionArg) -> Self {
    match arg {
      ActionArg::Create => SyncAction::Create,
      ActionArg::Update => SyncAction::Update,
      ActionArg::Delete => SyncAction::Delete,
    }
  }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StatusArg {
  Pending,
  InFlight,
  Failed,
}

impl From<StatusArg> for SyncStatus {
  fn from(arg: StatusArg) -> Self {
    match arg {
      StatusArg::Pending => SyncStatus::Pending,
      StatusArg::InFlight => SyncStatus::InFlight,
      StatusArg::Failed => SyncStatus::Failed,
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let db = Database::open(args.database.as_deref())?;
  let network = Arc::new(HttpNetwork::new(config.network.timeout)?);
  let base_url = config.api.base_url.clone();
  let engine = Engine::new(config, db, network)?;

  match args.command {
    Command::Status => {
      let status = engine.status().await?;
      println!("{}", serde_json::to_string_pretty(&status)?);
    }
    Command::Sync => {
      if !engine.probe().await {
        let status = engine.status().await?;
        bail!("API unreachable, {} item(s) left queued", status.queue_size);
      }
      let report = engine.force_sync().await;
      println!(
        "synced {}, retrying {}, failed {}",
        report.succeeded, report.retried, report.failed
      );
    }
    Command::Queue { command } => queue_command(&engine, command)?,
    Command::Enqueue {
      action,
      endpoint,
      data,
    } => {
      let mut mutation = Mutation::new(action.into(), endpoint);
      if let Some(data) = data {
        let value: serde_json::Value =
          serde_json::from_str(&data).map_err(|e| eyre!("--data is not valid JSON: {}", e))?;
        mutation = mutation.with_json(&value);
      }
      let id = engine.submit(mutation).await?;
      println!("{}", id);
    }
    Command::Fetch { path, navigate } => {
      let url = base_url
        .join(&path)
        .map_err(|e| eyre!("Invalid path '{}': {}", path, e))?;
      engine.install().await?;

      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };
      let served = engine.fetch(request).await;
      engine.settle().await;

      eprintln!(
        "{} ({})",
        served.response.status,
        served.source.as_str()
      );
      println!("{}", String::from_utf8_lossy(&served.response.body));
    }
    Command::Run => {
      engine.install().await?;
      engine.probe().await;

      let mut events = engine.subscribe();
      let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
          if let Ok(json) = serde_json::to_string(&event) {
            info!(event = %json, "Engine event");
          }
        }
      });

      engine.start().await;
      tokio::signal::ctrl_c().await?;
      engine.shutdown().await;
      printer.abort();
    }
  }

  Ok(())
}

fn queue_command(engine: &Engine, command: QueueCommand) -> Result<()> {
  match command {
    QueueCommand::List { status } => {
      for item in engine.queue_items(status.map(Into::into))? {
        println!(
          "{}  {:<9}  {:<6}  {} {}  retries {}/{}{}",
          item.id,
          item.status.as_str(),
          item.action.as_str(),
          item.method,
          item.endpoint,
          item.retry_count,
          item.max_retries,
          item
            .last_error
            .map(|e| format!("  ({})", e))
            .unwrap_or_default()
        );
      }
    }
    QueueCommand::Clear { status, yes } => {
      if !yes {
        bail!("Refusing to clear the queue without --yes");
      }
      let removed = engine.clear_queue(status.map(Into::into))?;
      println!("removed {}", removed);
    }
    QueueCommand::Retry { id } => {
      engine.retry_item(id)?;
      println!("{} queued for retry", id);
    }
  }
  Ok(())
}
