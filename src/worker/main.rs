use std::sync::Arc;

use anyhow::Result;
use bollard::Docker;
use tracing::{error, info};

use sbxd::shared::config::WorkerConfig;
use sbxd::shared::store::{MemoryStore, RedisStore, SessionStore};
use sbxd::shared::logging;
use sbxd::worker::files::WorkspaceFiles;
use sbxd::worker::pool::ContainerPool;
use sbxd::worker::rest::create_router;
use sbxd::worker::runtime::{ContainerRuntime, DockerRuntime};
use sbxd::worker::sessions::{spawn_sweeper, SessionManager};
use sbxd::worker::WorkerState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = WorkerConfig::from_env();
    let _ = logging::init(&config.log_dir, "sbxd_worker");

    if let Err(e) = config.validate() {
        error!("{e}");
        std::process::exit(1);
    }

    info!("Starting sandbox worker '{}'", config.worker_id);
    info!(
        "Pool: target={} min={} max={} aggressive_cleanup={}",
        config.pool.target_size,
        config.pool.min_size,
        config.pool.max_size,
        config.pool.aggressive_cleanup
    );
    info!(
        "Containers: image={} memory={} cpu_quota={} network={} user={} workspace={}",
        config.container.image,
        config.container.memory_limit,
        config.container.cpu_quota,
        config.container.network_mode,
        config.container.sandbox_user,
        config.container.workspace_dir
    );
    info!(
        "Timeouts: session={}m idle={}m cleanup_interval={}s command={}s",
        config.session_timeout_minutes,
        config.idle_timeout_minutes,
        config.cleanup_interval_seconds,
        config.default_command_timeout
    );

    let docker = Docker::connect_with_socket_defaults()?;
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::new(docker, config.container.clone())?);

    // Session index: Redis when configured, otherwise in-process with sweeper
    let (store, memory): (Arc<dyn SessionStore>, Option<Arc<MemoryStore>>) = match &config.redis {
        Some(redis) => {
            info!("Redis enabled - distributed mode ({}:{})", redis.host, redis.port);
            (Arc::new(RedisStore::connect(&redis.url()).await?), None)
        }
        None => {
            info!("Redis disabled - standalone mode");
            let memory = Arc::new(MemoryStore::new());
            (Arc::clone(&memory) as Arc<dyn SessionStore>, Some(memory))
        }
    };

    let pool = Arc::new(ContainerPool::new(
        Arc::clone(&runtime),
        config.pool.clone(),
        config.container.sandbox_user.clone(),
        config.container.workspace_dir.clone(),
    ));
    pool.initialize().await;

    let sessions = Arc::new(SessionManager::new(
        store,
        memory.clone(),
        Arc::clone(&pool),
        config.worker_id.clone(),
        config.session_timeout(),
    ));

    if memory.is_some() {
        let idle_timeout = config
            .pool
            .aggressive_cleanup
            .then(|| config.idle_timeout());
        spawn_sweeper(
            Arc::clone(&sessions),
            config.cleanup_interval(),
            config.session_timeout(),
            idle_timeout,
        );
    }

    // Destroy every pooled container before the process dies
    let shutdown_pool = Arc::clone(&pool);
    let runtime_handle = tokio::runtime::Handle::current();
    ctrlc::set_handler(move || {
        info!("Shutting down worker, cleaning up container pool...");
        runtime_handle.block_on(shutdown_pool.cleanup_all());
        info!("Cleanup complete");
        std::process::exit(0);
    })?;

    let files = WorkspaceFiles::new(
        Arc::clone(&runtime),
        config.container.sandbox_user.clone(),
        config.container.workspace_dir.clone(),
        config.limits.clone(),
    );

    let bind_addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(WorkerState {
        config,
        runtime,
        pool,
        sessions,
        files,
    });

    let app = create_router(state);
    info!("Binding to {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Worker ready to accept requests");
    axum::serve(listener, app).await?;

    Ok(())
}
