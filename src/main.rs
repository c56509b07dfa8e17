use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use offsync::config::Config;
use offsync::db::Database;
use offsync::http::{Request, Strategy};
use offsync::network::HttpFetcher;
use offsync::sync::{HttpSubmitter, OperationId, RemoteSubmit, DEFAULT_CHANNEL, TAG_PENDING_OPERATIONS};
use offsync::{logging, CacheService, Command, ServiceEvent, ServiceReply};

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline-first HTTP cache with a background sync queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offsync.yaml, then $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Fetch a URL through the cache
  Fetch {
    url: String,
    /// cache-first, network-first or stale-while-revalidate
    #[arg(short, long, default_value = "network-first")]
    strategy: Strategy,
    /// Request header as "Name: value"
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Install the configured cache version
  Install,
  /// Activate the configured cache version
  Activate,
  /// Activate the newest installed version
  SkipWaiting,
  /// Print the active version and counts as JSON
  Info,
  /// Delete every cached entry
  Clear,
  /// Cache URLs under the active version
  SaveOffline { urls: Vec<String> },
  /// Queue an operation for the next sync
  Enqueue {
    payload: String,
    #[arg(long)]
    channel: Option<String>,
  },
  /// Replay queued operations against the sync endpoint
  Sync {
    #[arg(long, default_value = TAG_PENDING_OPERATIONS)]
    tag: String,
  },
  /// List queued operations as JSON
  Pending {
    #[arg(long, default_value = DEFAULT_CHANNEL)]
    channel: String,
  },
  /// Drop a queued operation without submitting it
  Supersede { id: OperationId },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let service = build_service(&config)?;
  let result = run(&service, &config, args.command).await;
  service.shutdown().await;
  result
}

fn build_service(config: &Config) -> Result<CacheService> {
  let path = match config.database_path() {
    Some(path) => path.to_path_buf(),
    None => Database::default_path()?,
  };
  let db = Arc::new(Database::open(&path)?);
  info!(path = %path.display(), "opened cache database");

  let fetcher = Arc::new(HttpFetcher::new(config.network_timeout())?);
  let submit = match &config.sync.endpoint {
    Some(endpoint) => Some(Arc::new(HttpSubmitter::new(
      endpoint.clone(),
      config.network_timeout(),
      Config::get_sync_token(),
    )?) as Arc<dyn RemoteSubmit>),
    None => None,
  };

  Ok(CacheService::init(
    config.service_settings()?,
    db,
    fetcher,
    submit,
  )?)
}

async fn run(service: &CacheService, config: &Config, command: Cmd) -> Result<()> {
  let event = match command {
    Cmd::Fetch {
      url,
      strategy,
      headers,
      output,
    } => {
      service.ensure_ready().await?;
      let mut request = Request::get(config.resolve(&url)?);
      for header in &headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", header))?;
        request = request.with_header(name.trim(), value.trim());
      }

      let resp = service.fetch(&request, strategy).await;
      eprintln!("{} ({:?})", resp.status, resp.source);
      match output {
        Some(path) => std::fs::write(&path, &resp.body)
          .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
        None => println!("{}", String::from_utf8_lossy(&resp.body)),
      }
      return Ok(());
    }
    Cmd::Install => ServiceEvent::Install,
    Cmd::Activate => ServiceEvent::Activate,
    Cmd::SkipWaiting => ServiceEvent::Message(Command::SkipWaiting),
    Cmd::Info => ServiceEvent::Message(Command::GetCacheInfo),
    Cmd::Clear => ServiceEvent::Message(Command::ClearCache),
    Cmd::SaveOffline { urls } => {
      service.ensure_ready().await?;
      let urls = urls
        .iter()
        .map(|url| config.resolve(url))
        .collect::<Result<Vec<_>>>()?;
      ServiceEvent::Message(Command::SaveOffline { urls })
    }
    Cmd::Enqueue { payload, channel } => ServiceEvent::OfflineWrite {
      channel,
      payload: payload.into_bytes(),
    },
    Cmd::Sync { tag } => ServiceEvent::SyncTrigger { tag },
    Cmd::Pending { channel } => {
      let ops = service.queue().pending(&channel)?;
      println!("{}", serde_json::to_string_pretty(&ops)?);
      return Ok(());
    }
    Cmd::Supersede { id } => {
      if service.queue().supersede(id)? {
        println!("Operation {} superseded", id);
      } else {
        println!("Operation {} is not queued", id);
      }
      return Ok(());
    }
  };

  print_reply(service.dispatch(event).await?)
}

fn print_reply(reply: ServiceReply) -> Result<()> {
  match reply {
    ServiceReply::Installed(report) => {
      println!(
        "Installed {}: {} required, {} optional cached",
        report.version, report.required_cached, report.optional_cached
      );
      for url in report.optional_failed {
        println!("  not cached: {}", url);
      }
    }
    ServiceReply::Activated(report) => {
      println!(
        "Activated {} (reclaimed {} entries)",
        report.version, report.reclaimed_entries
      );
    }
    ServiceReply::NothingWaiting => println!("No installed version is waiting"),
    ServiceReply::Response(resp) => println!("{}", String::from_utf8_lossy(&resp.body)),
    ServiceReply::Queued(id) => println!("Queued operation {}", id),
    ServiceReply::Synced(report) => println!("{}", serde_json::to_string_pretty(&report)?),
    ServiceReply::SyncIgnored(tag) => println!("Unknown sync tag '{}'", tag),
    ServiceReply::CacheInfo(info) => println!("{}", serde_json::to_string_pretty(&info)?),
    ServiceReply::Cleared { entries } => println!("Cleared {} entries", entries),
    ServiceReply::Saved { stored, failed } => {
      println!("Saved {} resources", stored);
      for url in failed {
        println!("  failed: {}", url);
      }
    }
    ServiceReply::Delivered => println!("Delivered"),
  }
  Ok(())
}
