use crate::amm::AmmClient;
use crate::chain::ChainClient;
use crate::config::{BackfillConfig, CurveConfig, LaunchpadConfig, MigrationConfig, RefreshConfig};
use crate::fanout::RealtimeFanout;
use crate::metadata::CachedMetadata;
use crate::oracle::PriceOracle;
use crate::queue::RateLimitedQueue;
use crate::stats::RunningStats;
use crate::store::TokenStore;
use std::sync::Arc;

/// Shared handles built once at startup and passed to every component.
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<dyn TokenStore>,
    pub chain: Arc<dyn ChainClient>,
    pub amm: Arc<dyn AmmClient>,
    pub oracle: Arc<dyn PriceOracle>,
    pub metadata: CachedMetadata,
    pub stats: Arc<RunningStats>,
    pub fanout: Arc<dyn RealtimeFanout>,
    /// Work queue for confirmation polls and refresh jobs.
    pub queue: RateLimitedQueue,
    /// Upper bound on sagas running at once.
    pub saga_concurrency: usize,
    pub curve: CurveConfig,
    pub migration: MigrationConfig,
    pub backfill: BackfillConfig,
    pub refresh: RefreshConfig,
    pub quote_mint: String,
}

pub struct Clients {
    pub store: Arc<dyn TokenStore>,
    pub chain: Arc<dyn ChainClient>,
    pub amm: Arc<dyn AmmClient>,
    pub oracle: Arc<dyn PriceOracle>,
    pub metadata: CachedMetadata,
    pub fanout: Arc<dyn RealtimeFanout>,
}

impl PipelineContext {
    pub fn new(cfg: &LaunchpadConfig, clients: Clients) -> Self {
        Self {
            store: clients.store,
            chain: clients.chain,
            amm: clients.amm,
            oracle: clients.oracle,
            metadata: clients.metadata,
            stats: Arc::new(RunningStats::new(&cfg.stats)),
            fanout: clients.fanout,
            queue: RateLimitedQueue::from_config("pipeline", &cfg.queue),
            saga_concurrency: cfg.queue.concurrency,
            curve: cfg.curve.clone(),
            migration: cfg.migration.clone(),
            backfill: cfg.backfill.clone(),
            refresh: cfg.refresh.clone(),
            quote_mint: cfg.chain.quote_mint.clone(),
        }
    }
}
