use std::sync::Arc;

use clap::Parser;
use sbxd::{
    cli::SbxdArgs,
    config::{Config, CONFIG_PATH_ENV_VAR},
    exec::ExecRegistry,
    management::SandboxManager,
    metrics::Metrics,
    orchestrator::{KubeOrchestrator, Orchestrator},
    pool::WarmPool,
    server::{ApiServer, ServerState},
    stream::StreamHub,
    SbxdResult,
};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> SbxdResult<()> {
    let args = SbxdArgs::parse();
    args.init_logging();

    let config = match &args.config {
        Some(path) => {
            let config = Config::load_from(&path.to_string_lossy())?;
            tracing::info!("config loaded: {}", path.display());
            config
        }
        None => {
            let config = Config::load()?;
            match std::env::var(CONFIG_PATH_ENV_VAR) {
                Result::Ok(path) if !path.is_empty() => {
                    tracing::info!("config loaded: {}", path)
                }
                _ => tracing::info!("config loaded: <none>"),
            }
            config
        }
    };

    let orchestrator: Arc<dyn Orchestrator> = Arc::new(KubeOrchestrator::connect().await?);

    let metrics = Arc::new(Metrics::new());
    metrics.set_cache_mode(&config.cache().mode);
    metrics.set_stream_buffer(config.stream().buffer as i64);

    let registry = Arc::new(ExecRegistry::new(config.exec_status_retention()));
    let hub = Arc::new(StreamHub::new(config.stream().buffer));
    let pool = Arc::new(WarmPool::new(
        orchestrator.clone(),
        &config,
        metrics.clone(),
    ));

    let pool_cfg = pool.config();
    tracing::info!(
        "warm pool enabled={} autosize={} size={} min={} max={}",
        pool.enabled(),
        pool_cfg.autosize,
        pool_cfg.size,
        pool_cfg.min,
        pool_cfg.max
    );
    if pool.enabled() {
        if let Err(err) = pool.rebuild_from_cluster().await {
            tracing::warn!("warm pool rebuild: {}", err);
        }
        let pool = pool.clone();
        tokio::spawn(async move { pool.run().await });
    }

    let manager = SandboxManager::new(
        orchestrator,
        registry.clone(),
        hub.clone(),
        pool,
        config,
        metrics.clone(),
    );

    {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run_idle_reaper().await });
    }
    {
        let registry = registry.clone();
        tokio::spawn(async move { registry.run_retention_sweep().await });
    }

    let state = ServerState::new(manager, registry, hub, metrics);
    ApiServer::new(args.addr, state).serve().await
}
