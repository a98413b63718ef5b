use std::sync::Arc;

use anyhow::Context;
use taskfleet::config::Config;
use taskfleet::database::{PgStore, setup_database};
use taskfleet::engine::{Collaborators, Engine};
use taskfleet::routes::routes;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();
  let config = Config::from_env()?;

  let mut collaborators = Collaborators::in_memory(&config);
  match &config.database_url {
    Some(url) => {
      let pool = setup_database(url).await.context("Failed to set up database")?;
      collaborators.tasks = Arc::new(PgStore::new(pool.clone()));
      collaborators.crons = Arc::new(PgStore::new(pool.clone()));
      collaborators.hosts = Arc::new(PgStore::new(pool.clone()));
      collaborators.messages = Arc::new(PgStore::new(pool));
    }
    None => warn!("DATABASE_URL not set, records are kept in memory only"),
  }

  let engine = Arc::new(Engine::start(&config, collaborators).await?);
  let api = routes(engine.clone());

  info!(port = config.server_port, "Listening");
  warp::serve(api)
    .bind_with_graceful_shutdown(([0, 0, 0, 0], config.server_port), async {
      tokio::signal::ctrl_c().await.ok();
    })
    .1
    .await;

  engine.shutdown();
  Ok(())
}
