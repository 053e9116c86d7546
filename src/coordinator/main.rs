use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use sbxd::coordinator::{rest, CoordinatorState};
use sbxd::shared::config::CoordinatorConfig;
use sbxd::shared::logging;
use sbxd::shared::store::{MemoryStore, RedisStore, SessionStore};

#[tokio::main]
async fn main() -> Result<()> {
    let config = CoordinatorConfig::from_env();
    let _ = logging::init(&config.log_dir, "sbxd_coordinator");

    if let Err(e) = config.validate() {
        error!("{e}");
        std::process::exit(1);
    }

    info!("Starting sandbox coordinator");

    let store: Arc<dyn SessionStore> = match &config.redis {
        Some(redis) => {
            info!("Affinity store: Redis at {}:{}", redis.host, redis.port);
            Arc::new(RedisStore::connect(&redis.url()).await?)
        }
        None => {
            warn!("REDIS_HOST not set; affinity kept in process memory (single-coordinator only)");
            Arc::new(MemoryStore::new())
        }
    };

    let bind_addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(CoordinatorState::new(config, store));
    let app = rest::create_router(state);

    info!("Binding to {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Coordinator ready to accept requests");
    axum::serve(listener, app).await?;

    Ok(())
}
