#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use launchpad_core::amm::{AmmClient, CreatePoolRequest, CreatedPool, FeeConfig, LockReceipt, PoolInfo};
use launchpad_core::cache::MetadataCache;
use launchpad_core::chain::{ChainClient, SubmittedTx};
use launchpad_core::config::{
    BackfillConfig, CurveConfig, MigrationConfig, QueueConfig, RefreshConfig, StatsConfig,
};
use launchpad_core::context::PipelineContext;
use launchpad_core::error::PipelineError;
use launchpad_core::fanout::{BroadcastFanout, RealtimeFanout};
use launchpad_core::log_parser::LogBundle;
use launchpad_core::metadata::{CachedMetadata, MetadataSource};
use launchpad_core::migration::MigrationSaga;
use launchpad_core::models::{
    BondingCurveAccount, Fee, MigrationState, PoolAddresses, StatsMaxima, Swap, Token,
    TokenMetadata, TokenStatus,
};
use launchpad_core::oracle::FixedPrice;
use launchpad_core::pipeline::EventPipeline;
use launchpad_core::projector::TokenStateProjector;
use launchpad_core::queue::RateLimitedQueue;
use launchpad_core::stats::RunningStats;
use launchpad_core::store::{MemoryStore, MigrationGate, TokenStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const PROGRAM: &str = "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P";
pub const MINT: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";
pub const CREATOR: &str = "DRiP2Pn2K6fuMLKQmt5rZWyHiUZ6WK3GChEySUpHSS4x";
pub const USER: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";

pub const VIRTUAL_RESERVES: u64 = 30_000_000_000;
pub const CURVE_LIMIT: u64 = 85_000_000_000;
pub const TOKEN_SUPPLY: u64 = 1_000_000_000_000_000;

#[derive(Default)]
pub struct FakeChain {
    pub finalized: AtomicU64,
    pub confirmed: AtomicU64,
    pub curves: Mutex<HashMap<String, BondingCurveAccount>>,
    pub blocks: Mutex<HashMap<u64, Vec<LogBundle>>>,
    /// Remaining failed fetches per slot.
    pub block_errors: Mutex<HashMap<u64, usize>>,
    pub block_fetches: AtomicUsize,
    pub withdraw_calls: AtomicUsize,
    /// Confirmation error for the next withdraw, if any.
    pub withdraw_err: Mutex<Option<String>>,
    pub withdraw_logs: Mutex<Vec<String>>,
    pub tx_logs: Mutex<HashMap<String, Vec<String>>>,
    pub finalized_logs: Mutex<HashMap<String, Vec<String>>>,
}

impl FakeChain {
    pub fn new() -> Self {
        let chain = Self::default();
        *chain.withdraw_logs.lock().unwrap() = vec![
            format!("Program {PROGRAM} invoke [1]"),
            "Program log: withdraw lamports: 85000000000".to_string(),
            "Program log: withdraw token: 200000000000000".to_string(),
            format!("Program {PROGRAM} success"),
        ];
        chain
    }

    pub fn set_curve(&self, mint: &str, reserve_lamport: u64, completed: bool) {
        self.curves.lock().unwrap().insert(
            mint.to_string(),
            BondingCurveAccount {
                token_mint: mint.to_string(),
                creator: CREATOR.to_string(),
                created_time: 1_700_000_000,
                init_bonding_curve: 0.0,
                init_lamport: VIRTUAL_RESERVES,
                reserve_lamport,
                reserve_token: TOKEN_SUPPLY,
                max_buy: 0,
                max_sell: 0,
                curve_limit: CURVE_LIMIT,
                is_completed: completed,
            },
        );
    }

    pub fn set_slots(&self, finalized: u64, confirmed: u64) {
        self.finalized.store(finalized, Ordering::SeqCst);
        self.confirmed.store(confirmed, Ordering::SeqCst);
    }

    pub fn add_block(&self, slot: u64, bundles: Vec<LogBundle>) {
        self.blocks.lock().unwrap().insert(slot, bundles);
    }

    /// The next `times` fetches of `slot` fail like a rate-limited node.
    pub fn fail_block(&self, slot: u64, times: usize) {
        self.block_errors.lock().unwrap().insert(slot, times);
    }

    pub fn withdraws(&self) -> usize {
        self.withdraw_calls.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.block_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn finalized_slot(&self) -> Result<u64> {
        Ok(self.finalized.load(Ordering::SeqCst))
    }

    async fn confirmed_slot(&self) -> Result<u64> {
        Ok(self.confirmed.load(Ordering::SeqCst))
    }

    async fn block_time(&self, _slot: u64) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }

    async fn block_bundles(&self, slot: u64) -> Result<Vec<LogBundle>> {
        self.block_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(left) = self.block_errors.lock().unwrap().get_mut(&slot) {
            if *left > 0 {
                *left -= 1;
                return Err(PipelineError::Upstream(format!("block {slot}: 429 Too Many Requests")).into());
            }
        }
        Ok(self.blocks.lock().unwrap().get(&slot).cloned().unwrap_or_default())
    }

    async fn bonding_curve(&self, mint: &str) -> Result<Option<BondingCurveAccount>> {
        Ok(self.curves.lock().unwrap().get(mint).cloned())
    }

    async fn mint_decimals(&self, _mint: &str) -> Result<u8> {
        Ok(6)
    }

    async fn holder_count(&self, _mint: &str) -> Result<u64> {
        Ok(3)
    }

    async fn send_withdraw(&self, _mint: &str) -> Result<SubmittedTx> {
        let n = self.withdraw_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SubmittedTx {
            signature: format!("withdraw-{n}"),
            err: self.withdraw_err.lock().unwrap().take(),
            logs: self.withdraw_logs.lock().unwrap().clone(),
        })
    }

    async fn transaction_logs(&self, signature: &str) -> Result<Option<Vec<String>>> {
        Ok(self.tx_logs.lock().unwrap().get(signature).cloned())
    }

    async fn finalized_transaction_logs(&self, signature: &str) -> Result<Option<Vec<String>>> {
        Ok(self.finalized_logs.lock().unwrap().get(signature).cloned())
    }

    async fn stream_logs(&self, _tx: mpsc::Sender<LogBundle>) -> Result<()> {
        Ok(())
    }

    fn program_id(&self) -> String {
        PROGRAM.to_string()
    }
}

pub struct FakeAmm {
    pub create_calls: AtomicUsize,
    pub lock_calls: Mutex<Vec<u64>>,
    pub pool_polls: AtomicUsize,
    /// Polls answered with `NotYetIndexed` before the pool appears.
    pub unindexed_polls: usize,
    pub lp_balance: u64,
    /// Requests that actually produced a pool.
    pub created: Mutex<Vec<CreatePoolRequest>>,
    /// Create calls refused before reaching the service.
    pub create_refusals: AtomicUsize,
    /// The next create lands but its response is lost.
    pub create_response_lost: AtomicBool,
    pub existing_pool: Mutex<Option<CreatedPool>>,
    /// 1-based lock call that fails once.
    pub fail_lock_call: Mutex<Option<usize>>,
}

impl FakeAmm {
    pub fn new(unindexed_polls: usize, lp_balance: u64) -> Self {
        Self {
            create_calls: AtomicUsize::new(0),
            lock_calls: Mutex::new(Vec::new()),
            pool_polls: AtomicUsize::new(0),
            unindexed_polls,
            lp_balance,
            created: Mutex::new(Vec::new()),
            create_refusals: AtomicUsize::new(0),
            create_response_lost: AtomicBool::new(false),
            existing_pool: Mutex::new(None),
            fail_lock_call: Mutex::new(None),
        }
    }

    pub fn locks(&self) -> Vec<u64> {
        self.lock_calls.lock().unwrap().clone()
    }

    pub fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AmmClient for FakeAmm {
    async fn fee_configs(&self) -> Result<Vec<FeeConfig>> {
        Ok(vec![
            FeeConfig {
                id: "fee-1".into(),
                index: 1,
                trade_fee_rate: 2500,
            },
            FeeConfig {
                id: "fee-0".into(),
                index: 0,
                trade_fee_rate: 2500,
            },
        ])
    }

    async fn create_pool(&self, req: &CreatePoolRequest) -> Result<CreatedPool> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .create_refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(PipelineError::Upstream("pool creation: connection refused".into()).into());
        }
        self.created.lock().unwrap().push(req.clone());
        let created = CreatedPool {
            tx_id: "create-pool-tx".into(),
            pool: PoolAddresses {
                pool_id: "POOL".into(),
                lp_mint: "LP".into(),
                vault_a: "VA".into(),
                vault_b: "VB".into(),
            },
        };
        *self.existing_pool.lock().unwrap() = Some(created.clone());
        if self.create_response_lost.swap(false, Ordering::SeqCst) {
            return Err(PipelineError::OutcomeUnknown("pool creation: operation timed out".into()).into());
        }
        Ok(created)
    }

    async fn find_pool(&self, _mint_a: &str, _mint_b: &str) -> Result<Option<CreatedPool>> {
        Ok(self.existing_pool.lock().unwrap().clone())
    }

    async fn pool_info(&self, pool_id: &str) -> Result<PoolInfo> {
        let n = self.pool_polls.fetch_add(1, Ordering::SeqCst);
        if n < self.unindexed_polls {
            return Err(PipelineError::NotYetIndexed(pool_id.to_string()).into());
        }
        Ok(PoolInfo {
            id: pool_id.to_string(),
            lp_mint: "LP".into(),
            mint_a: MINT.into(),
            mint_b: "So11111111111111111111111111111111111111112".into(),
            reserve_a: 199_800_000_000_000,
            reserve_b: 84_915_000_000,
        })
    }

    async fn lp_balance(&self, _lp_mint: &str) -> Result<u64> {
        Ok(self.lp_balance)
    }

    async fn lock_liquidity(&self, _pool: &PoolInfo, lp_amount: u64) -> Result<LockReceipt> {
        let mut calls = self.lock_calls.lock().unwrap();
        calls.push(lp_amount);
        let mut fail_on = self.fail_lock_call.lock().unwrap();
        if *fail_on == Some(calls.len()) {
            *fail_on = None;
            return Err(PipelineError::Upstream("lock transaction expired".into()).into());
        }
        Ok(LockReceipt {
            tx_id: format!("lock-tx-{}", calls.len()),
            nft_mint: format!("nft-{}", calls.len()),
        })
    }
}

pub struct StaticMetadata;

#[async_trait]
impl MetadataSource for StaticMetadata {
    async fn fetch(&self, _mint: &str) -> Result<TokenMetadata> {
        Ok(TokenMetadata {
            name: "Test Cat".into(),
            symbol: "TCAT".into(),
            uri: "https://example.invalid/tcat.json".into(),
            image: None,
            description: None,
        })
    }
}

/// Memory store whose next writes can be made to fail.
pub struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    pub save_failures: AtomicUsize,
    pub record_swap_failures: AtomicUsize,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl TokenStore for FlakyStore {
    async fn get_token(&self, mint: &str) -> Result<Option<Token>> {
        self.inner.get_token(mint).await
    }

    async fn upsert_token(&self, token: &Token) -> Result<()> {
        self.inner.upsert_token(token).await
    }

    async fn insert_swap(&self, swap: &Swap) -> Result<bool> {
        self.inner.insert_swap(swap).await
    }

    async fn insert_fee(&self, fee: &Fee) -> Result<bool> {
        self.inner.insert_fee(fee).await
    }

    async fn record_swap(&self, swap: &Swap, fee: &Fee, token: &Token) -> Result<bool> {
        if take_failure(&self.record_swap_failures) {
            anyhow::bail!("connection reset while recording swap");
        }
        self.inner.record_swap(swap, fee, token).await
    }

    async fn swaps_between(
        &self,
        mint: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Swap>> {
        self.inner.swaps_between(mint, start, end).await
    }

    async fn try_begin_migration(&self, mint: &str, at: DateTime<Utc>) -> Result<MigrationGate> {
        self.inner.try_begin_migration(mint, at).await
    }

    async fn save_migration(
        &self,
        mint: &str,
        state: &MigrationState,
        status: Option<TokenStatus>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if take_failure(&self.save_failures) {
            anyhow::bail!("connection reset while saving migration");
        }
        self.inner.save_migration(mint, state, status, at).await
    }

    async fn set_status(&self, mint: &str, status: TokenStatus, at: DateTime<Utc>) -> Result<()> {
        self.inner.set_status(mint, status, at).await
    }

    async fn mark_migration_failed(
        &self,
        mint: &str,
        state: &MigrationState,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.mark_migration_failed(mint, state, at).await
    }

    async fn latest_update(&self) -> Result<Option<DateTime<Utc>>> {
        self.inner.latest_update().await
    }

    async fn max_stats(&self) -> Result<StatsMaxima> {
        self.inner.max_stats().await
    }

    async fn tokens_with_status(&self, statuses: &[TokenStatus]) -> Result<Vec<Token>> {
        self.inner.tokens_with_status(statuses).await
    }

    async fn set_holder_count(&self, mint: &str, count: u64) -> Result<()> {
        self.inner.set_holder_count(mint, count).await
    }

    async fn update_market_data(&self, token: &Token) -> Result<()> {
        self.inner.update_market_data(token).await
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub chain: Arc<FakeChain>,
    pub amm: Arc<FakeAmm>,
    pub fanout: Arc<BroadcastFanout>,
    pub ctx: PipelineContext,
    pub pipeline: EventPipeline,
}

impl Harness {
    pub fn new(amm: FakeAmm) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_store(amm, store.clone(), store)
    }

    /// Pipeline writes go through a [`FlakyStore`]; `store` still reads the
    /// underlying memory store.
    pub fn flaky(amm: FakeAmm) -> (Self, Arc<FlakyStore>) {
        let memory = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore {
            inner: memory.clone(),
            save_failures: AtomicUsize::new(0),
            record_swap_failures: AtomicUsize::new(0),
        });
        (Self::with_store(amm, flaky.clone(), memory), flaky)
    }

    fn with_store(amm: FakeAmm, writes: Arc<dyn TokenStore>, store: Arc<MemoryStore>) -> Self {
        let chain = Arc::new(FakeChain::new());
        let amm = Arc::new(amm);
        let fanout = Arc::new(BroadcastFanout::new(256));
        let queue_cfg = QueueConfig {
            concurrency: 5,
            interval_ms: 1_000,
            interval_cap: 10,
        };
        let ctx = PipelineContext {
            store: writes,
            chain: chain.clone(),
            amm: amm.clone(),
            oracle: Arc::new(FixedPrice(150.0)),
            metadata: CachedMetadata::new(
                Arc::new(StaticMetadata),
                Arc::new(MetadataCache::new(64, Duration::from_secs(3600))),
            ),
            stats: Arc::new(RunningStats::new(&StatsConfig {
                volume_weight: 0.7,
                holder_weight: 0.3,
            })),
            fanout: fanout.clone() as Arc<dyn RealtimeFanout>,
            queue: RateLimitedQueue::from_config("pipeline", &queue_cfg),
            saga_concurrency: queue_cfg.concurrency,
            curve: CurveConfig {
                token_supply: TOKEN_SUPPLY,
                virtual_reserves: VIRTUAL_RESERVES,
                curve_limit: CURVE_LIMIT,
                default_decimals: 6,
            },
            migration: MigrationConfig::default(),
            backfill: BackfillConfig::default(),
            refresh: RefreshConfig {
                holders_interval_secs: 60,
                market_interval_secs: 60,
            },
            quote_mint: "So11111111111111111111111111111111111111112".into(),
        };
        let saga = MigrationSaga::new(ctx.clone());
        let projector = Arc::new(TokenStateProjector::new(ctx.clone(), saga));
        let pipeline = EventPipeline::new(ctx.clone(), projector);
        Self {
            store,
            chain,
            amm,
            fanout,
            ctx,
            pipeline,
        }
    }

    pub fn saga(&self) -> &MigrationSaga {
        self.pipeline.projector().saga()
    }
}

fn bundle(slot: u64, signature: &str, logs: Vec<String>) -> LogBundle {
    LogBundle {
        slot,
        signature: signature.to_string(),
        logs,
        err: None,
    }
}

pub fn new_token_bundle(slot: u64, signature: &str) -> LogBundle {
    bundle(
        slot,
        signature,
        vec![
            format!("Program {PROGRAM} invoke [1]"),
            format!("Program log: NewToken: {MINT} {CREATOR}"),
            format!("Program {PROGRAM} success"),
        ],
    )
}

pub fn buy_bundle(slot: u64, signature: &str, reserve_lamport: u64) -> LogBundle {
    bundle(
        slot,
        signature,
        vec![
            format!("Program {PROGRAM} invoke [1]"),
            format!("Program log: Mint: {MINT}"),
            format!("Program log: Swap: {USER} 0 5000000 (Amount to Swap)"),
            format!("Program log: Reserves: 999000000000000 {reserve_lamport}"),
            "Program log: fee: 50000".to_string(),
            format!("Program log: SwapEvent: {USER} 0 1000000000"),
            format!("Program {PROGRAM} success"),
        ],
    )
}

pub fn completion_bundle(slot: u64, signature: &str) -> LogBundle {
    bundle(
        slot,
        signature,
        vec![
            format!("Program {PROGRAM} invoke [1]"),
            format!("Program log: Mint: {MINT}"),
            "Program log: curve is completed".to_string(),
            format!("Program {PROGRAM} success"),
        ],
    )
}
