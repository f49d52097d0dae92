use anyhow::Result;
use launchpad_core::{
    amm::HttpAmmClient,
    backfill::GapRecoveryScanner,
    cache::MetadataCache,
    chain::SolanaChain,
    config::LaunchpadConfig,
    context::{Clients, PipelineContext},
    db::{create_pool, run_migrations, PgStore},
    fanout::{NoopFanout, RealtimeFanout, RedisFanout},
    listener::LiveLogListener,
    metadata::{CachedMetadata, DasMetadataSource},
    migration::MigrationSaga,
    oracle::PythOracle,
    pipeline::EventPipeline,
    projector::TokenStateProjector,
    refresh::run_refresh_loop,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = LaunchpadConfig::from_env()?;

    tracing::info!("Starting launchpad indexer with config: {:?}", config.runtime);

    let pool = create_pool(&config.db.url, config.db.max_connections).await?;
    run_migrations(&pool).await?;

    run_indexer(config, pool).await
}

async fn build_fanout(config: &LaunchpadConfig) -> Arc<dyn RealtimeFanout> {
    let Some(redis) = &config.redis else {
        tracing::info!("no redis configured, realtime fan-out disabled");
        return Arc::new(NoopFanout);
    };
    match RedisFanout::from_config(redis).await {
        Ok(fanout) => Arc::new(fanout),
        Err(err) => {
            tracing::error!("redis fan-out unavailable, continuing without it: {err:?}");
            Arc::new(NoopFanout)
        }
    }
}

async fn run_indexer(config: LaunchpadConfig, pool: sqlx::PgPool) -> Result<()> {
    let chain = Arc::new(SolanaChain::new(&config.chain)?);
    let metadata = CachedMetadata::new(
        Arc::new(DasMetadataSource::new(config.chain.rpc_url.clone())?),
        Arc::new(MetadataCache::from_config(&config.cache)),
    );
    let clients = Clients {
        store: Arc::new(PgStore::new(pool)),
        chain: chain.clone(),
        amm: Arc::new(HttpAmmClient::new(&config.amm)?),
        oracle: Arc::new(PythOracle::new(&config.oracle)?),
        metadata,
        fanout: build_fanout(&config).await,
    };
    let ctx = PipelineContext::new(&config, clients);
    ctx.stats.init(ctx.store.as_ref()).await;

    let saga = MigrationSaga::new(ctx.clone());
    match saga.resume_pending(config.migration.resume_failed_on_start).await {
        Ok(0) => {}
        Ok(n) => tracing::info!(sagas = n, "resumed interrupted migrations"),
        Err(err) => tracing::error!("failed to resume migrations: {err:?}"),
    }

    let projector = Arc::new(TokenStateProjector::new(ctx.clone(), saga));
    let pipeline = EventPipeline::new(ctx.clone(), projector);

    // Live subscription starts first so nothing between the backfill target
    // and the first live bundle is lost; overlap is absorbed by idempotent writes.
    let listener = LiveLogListener::new(chain, pipeline.clone());
    let listener_handle = tokio::spawn(async move { listener.run().await });

    let backfill_handle = config
        .backfill
        .enabled
        .then(|| GapRecoveryScanner::new(ctx.clone(), pipeline.clone()).spawn());

    let refresh_ctx = ctx.clone();
    let refresh_handle = tokio::spawn(async move { run_refresh_loop(refresh_ctx).await });

    tokio::select! {
        result = listener_handle => {
            tracing::error!("Listener task ended: {result:?}");
        }
        result = refresh_handle => {
            tracing::error!("Refresh task ended: {result:?}");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested, waiting for in-flight work");
            if let Some(backfill) = &backfill_handle {
                backfill.abort();
            }
            pipeline.on_idle().await;
        }
    }

    ctx.stats.shutdown().await;
    Ok(())
}
