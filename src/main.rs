mod cache;
mod config;
mod db;
mod directory;
mod notify;
mod pool;
mod resolver;
mod sync;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use cache::{SingleFlightCache, SqliteStore};
use config::Config;
use db::Database;
use directory::{DirectoryClient, EnvTokenSource, HttpDirectoryClient};
use notify::LogNotifier;
use pool::WorkerPool;
use resolver::MembershipResolver;
use sync::GroupSyncEngine;

#[derive(Parser, Debug)]
#[command(name = "memberd")]
#[command(about = "Group directory sync and transitive mailing-list membership resolution")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/memberd/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Run a single full refresh in the foreground, then exit
  #[arg(long)]
  once: bool,

  /// Drop every cached membership entry before doing anything else
  #[arg(long)]
  purge_cache: bool,

  /// Resolve one address's transitive memberships, print them, and exit
  #[arg(long, value_name = "EMAIL")]
  resolve: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let data_dir = Config::data_dir()?;
  let _log_guard = init_tracing(&data_dir)?;

  // Shared state: database, worker pools, warmed cache. Refreshes and
  // sync fan-out get separate pools so a fan-out task waiting on its
  // lookup can never starve the refresh that would complete it.
  let db = Arc::new(Database::open(&data_dir.join("memberd.db"))?);
  let refresh_pool = WorkerPool::new(config.cache.pool_size);
  let fanout_pool = WorkerPool::new(config.cache.pool_size);
  let cache_path = config
    .cache
    .db_path
    .clone()
    .unwrap_or_else(|| data_dir.join("cache.db"));
  let store = SqliteStore::open(&cache_path)?;
  let cache = SingleFlightCache::new(store, refresh_pool, &config.cache)?;

  if args.purge_cache {
    cache.purge()?;
  }

  let client: Arc<dyn DirectoryClient> = Arc::new(HttpDirectoryClient::new(
    &config.directory,
    EnvTokenSource,
  )?);

  if let Some(email) = args.resolve {
    let resolver = MembershipResolver::new(Arc::clone(&client), cache);
    let mut memberships: Vec<_> = resolver.resolve(&email).await?.into_iter().collect();
    memberships.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (group, via) in memberships {
      match via {
        resolver::Membership::Direct => println!("{} (direct)", group),
        resolver::Membership::Via(parent) => println!("{} (via {})", group, parent),
      }
    }
    return Ok(());
  }

  let engine = GroupSyncEngine::new(
    client,
    cache,
    db,
    fanout_pool,
    config.directory.domain.clone(),
    Arc::new(LogNotifier),
  );

  if args.once {
    engine.full_refresh().await?;
    return Ok(());
  }

  // Every interval, re-sync the list of all lists and re-warm the
  // membership cache. The first tick fires immediately, covering boot.
  let mut ticker = tokio::time::interval(Duration::from_secs(config.sync.interval_secs));
  loop {
    ticker.tick().await;
    engine.background_refresh();
  }
}

/// Log to stderr (filtered by RUST_LOG) and to a daily file under the
/// data directory.
fn init_tracing(data_dir: &std::path::Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = data_dir.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| color_eyre::eyre::eyre!("Failed to create log directory: {}", e))?;
  let file_appender = tracing_appender::rolling::daily(log_dir, "memberd.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    .with(
      tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer),
    )
    .try_init()
    .map_err(|e| color_eyre::eyre::eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
