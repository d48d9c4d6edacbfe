use std::{path::PathBuf, sync::Arc};

use anyhow::Context;

use sitesmith::config::{load_or_init, RelayKeys};
use sitesmith::logger::{level_from_env, Logger};
use sitesmith::router::{run_router, RouterState};
use sitesmith::storage::{init_db, SqliteStore};

fn data_dir() -> PathBuf {
  std::env::var_os("SITESMITH_DATA_DIR")
    .map(PathBuf::from)
    .unwrap_or_else(|| PathBuf::from("sitesmith-data"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let data_dir = data_dir();
  std::fs::create_dir_all(&data_dir)
    .with_context(|| format!("creating data dir {}", data_dir.display()))?;

  let config_path = data_dir.join("config.json");
  let db_path = data_dir.join("sitesmith.sqlite3");
  let log_path = data_dir.join("sitesmith.log");

  Logger::new(&log_path, level_from_env())?.install()?;
  log::info!("SiteSmith starting up");

  let config = load_or_init(&config_path).context("loading config")?;
  let keys = RelayKeys::from_env();
  if keys.chat.is_none() {
    log::warn!("OPENROUTER_API_KEY not set; chat relay will reject requests");
  }
  if keys.replicate.is_none() {
    log::warn!("REPLICATE_API_KEY not set; video relay will reject requests");
  }

  let db = init_db(&db_path).context("opening database")?;
  let store = Arc::new(SqliteStore::new(db));
  let state = RouterState::new(&config, keys, store)?;

  let listener = std::net::TcpListener::bind(&config.bind_addr)
    .with_context(|| format!("binding {}", config.bind_addr))?;
  let addr = listener.local_addr()?;
  log::info!("listening on http://{addr}");
  println!("SiteSmith listening on http://{addr} (logs: {})", log_path.display());

  run_router(listener, state).await
}
