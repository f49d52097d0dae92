use crate::candles::get_latest_candle;
use crate::context::PipelineContext;
use crate::fanout::{emit, token_room, FanoutEvent, SwapNotice, GLOBAL_ROOM};
use crate::log_parser::{CurveCompletedEvent, NewTokenEvent, ParsedEvent, SwapEvent};
use crate::migration::MigrationSaga;
use crate::models::{Fee, FeeKind, Swap, Token};
use crate::pricing;
use crate::queue::TaskHandle;
use crate::retry::RetryPolicy;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Candle width pushed to subscribers after each swap.
pub const LIVE_CANDLE_PERIOD: u32 = 1;

/// Outcome of applying one parsed event.
pub enum Applied {
    Token(Token),
    /// The event was already applied earlier.
    Duplicate,
    MigrationScheduled(TaskHandle<Token>),
    Ignored,
}

/// Applies parsed events to the token aggregate. Events for the same mint
/// are serialised so read-modify-write updates never interleave.
pub struct TokenStateProjector {
    ctx: PipelineContext,
    saga: MigrationSaga,
    mint_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl TokenStateProjector {
    pub fn new(ctx: PipelineContext, saga: MigrationSaga) -> Self {
        Self {
            ctx,
            saga,
            mint_locks: DashMap::new(),
        }
    }

    pub fn saga(&self) -> &MigrationSaga {
        &self.saga
    }

    fn lock_for(&self, mint: &str) -> Arc<AsyncMutex<()>> {
        self.mint_locks
            .entry(mint.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn apply(&self, event: &ParsedEvent, tx_id: &str, at: DateTime<Utc>) -> Result<Applied> {
        match event {
            ParsedEvent::NewToken(ev) => self.apply_new_token(ev, tx_id, at).await,
            ParsedEvent::Swap(ev) => self.apply_swap(ev, tx_id, at).await,
            ParsedEvent::CurveCompleted(ev) => self.apply_curve_completed(ev).await,
        }
    }

    pub async fn apply_new_token(&self, ev: &NewTokenEvent, tx_id: &str, at: DateTime<Utc>) -> Result<Applied> {
        let lock = self.lock_for(&ev.mint);
        let _guard = lock.lock().await;

        if self.ctx.store.get_token(&ev.mint).await?.is_some() {
            debug!(mint = %ev.mint, "token already known");
            return Ok(Applied::Duplicate);
        }
        let token = self.build_token(&ev.mint, Some(&ev.creator), tx_id, at).await;
        self.ctx.store.upsert_token(&token).await?;
        self.ctx.stats.observe(&token).await;
        info!(mint = %token.mint, symbol = %token.symbol, "new token");

        emit(self.ctx.fanout.as_ref(), GLOBAL_ROOM, FanoutEvent::NewToken(token.clone())).await;
        emit(
            self.ctx.fanout.as_ref(),
            &token_room(&token.mint),
            FanoutEvent::NewToken(token.clone()),
        )
        .await;
        Ok(Applied::Token(token))
    }

    /// Fresh aggregate from metadata, the curve account and the oracle.
    /// Lookups that fail fall back to configured defaults.
    async fn build_token(&self, mint: &str, creator: Option<&str>, tx_id: &str, at: DateTime<Utc>) -> Token {
        let curve = &self.ctx.curve;
        let account = match self.ctx.chain.bonding_curve(mint).await {
            Ok(acc) => acc,
            Err(err) => {
                warn!(mint, "bonding curve fetch failed: {err:#}");
                None
            }
        };
        let creator = creator
            .map(str::to_string)
            .or_else(|| account.as_ref().map(|a| a.creator.clone()))
            .unwrap_or_default();

        let mut token = Token::new(mint, creator, tx_id, at);
        token.decimals = match self.ctx.chain.mint_decimals(mint).await {
            Ok(d) => d,
            Err(err) => {
                debug!(mint, "mint decimals unavailable, using default: {err:#}");
                curve.default_decimals
            }
        };
        match self.ctx.metadata.get(mint).await {
            Ok(meta) => {
                token.name = meta.name;
                token.symbol = meta.symbol;
                token.uri = meta.uri;
                token.image = meta.image;
                token.description = meta.description;
            }
            Err(err) => warn!(mint, "metadata lookup failed: {err:#}"),
        }

        token.total_supply = curve.token_supply;
        token.virtual_reserves = curve.virtual_reserves;
        token.curve_limit = curve.curve_limit;
        match account {
            Some(acc) => {
                token.reserve_lamport = acc.reserve_lamport;
                token.reserve_token = acc.reserve_token;
                if acc.curve_limit > 0 {
                    token.curve_limit = acc.curve_limit;
                }
            }
            None => {
                token.reserve_lamport = curve.virtual_reserves;
                token.reserve_token = curve.token_supply;
            }
        }

        let sol = self.ctx.oracle.quote_usd_price().await;
        reprice(&mut token, sol);
        token.price_24h_ago = token.current_price;
        token
    }

    pub async fn apply_swap(&self, ev: &SwapEvent, tx_id: &str, at: DateTime<Utc>) -> Result<Applied> {
        let lock = self.lock_for(&ev.mint);
        let _guard = lock.lock().await;

        let mut token = match self.ctx.store.get_token(&ev.mint).await? {
            Some(t) => t,
            None => {
                warn!(mint = %ev.mint, tx = tx_id, "swap for unseen token, bootstrapping from chain");
                let t = self.build_token(&ev.mint, None, tx_id, at).await;
                self.ctx.store.upsert_token(&t).await?;
                t
            }
        };

        let swap = Swap {
            token_mint: ev.mint.clone(),
            user: ev.user.clone(),
            direction: ev.direction,
            amount_in: ev.amount_in,
            amount_out: ev.amount_out,
            price: pricing::trade_price(ev.direction, ev.amount_in, ev.amount_out, token.decimals),
            tx_id: tx_id.to_string(),
            timestamp: at,
        };
        let fee = Fee {
            token_mint: ev.mint.clone(),
            user: ev.user.clone(),
            direction: ev.direction,
            kind: FeeKind::Swap,
            token_amount: 0,
            sol_amount: ev.fee,
            tx_id: tx_id.to_string(),
            timestamp: at,
        };

        let mut sol = self.ctx.oracle.quote_usd_price().await;
        if sol <= 0.0 {
            sol = token.sol_price_usd;
        }
        apply_trade(&mut token, ev, sol, at);
        if !self.ctx.store.record_swap(&swap, &fee, &token).await? {
            debug!(mint = %ev.mint, tx = tx_id, "swap already recorded");
            return Ok(Applied::Duplicate);
        }
        debug!(
            mint = %token.mint,
            tx = tx_id,
            price = token.current_price,
            progress = token.curve_progress,
            "swap applied"
        );

        let room = token_room(&token.mint);
        let fanout = self.ctx.fanout.as_ref();
        emit(fanout, &room, FanoutEvent::NewSwap(SwapNotice::from(&swap))).await;
        match get_latest_candle(self.ctx.store.as_ref(), &swap, LIVE_CANDLE_PERIOD).await {
            Ok(Some(candle)) => emit(fanout, &room, FanoutEvent::NewCandle(candle)).await,
            Ok(None) => {}
            Err(err) => warn!(mint = %token.mint, "latest candle failed: {err:#}"),
        }
        let enriched = self.ctx.stats.enrich(token.clone()).await;
        emit(fanout, &room, FanoutEvent::UpdateToken(enriched.clone())).await;
        emit(fanout, GLOBAL_ROOM, FanoutEvent::UpdateToken(enriched)).await;
        Ok(Applied::Token(token))
    }

    /// Confirms completion on chain, then hands the token to the saga
    /// unless another trigger already did. Confirmation polls for a while,
    /// so callers usually run this on the pipeline queue.
    pub async fn apply_curve_completed(&self, ev: &CurveCompletedEvent) -> Result<Applied> {
        if let Some(token) = self.ctx.store.get_token(&ev.mint).await? {
            if token.status.is_in_migration() {
                debug!(mint = %ev.mint, status = %token.status, "completion already handled");
                return Ok(Applied::Duplicate);
            }
        }

        let policy = RetryPolicy::fixed(
            "curve-completion",
            self.ctx.migration.completion_confirm_attempts,
            self.ctx.migration.completion_confirm_delay(),
        );
        let confirmed = policy
            .run(|attempt| async move {
                match self.ctx.chain.bonding_curve(&ev.mint).await? {
                    Some(acc) if acc.is_completed => Ok(()),
                    _ => {
                        debug!(mint = %ev.mint, attempt, "curve not yet completed on chain");
                        Err(anyhow!("curve for {} not completed on chain", ev.mint))
                    }
                }
            })
            .await;
        if let Err(err) = confirmed {
            warn!(mint = %ev.mint, "curve completion not confirmed, skipping migration: {err:#}");
            return Ok(Applied::Ignored);
        }

        let lock = self.lock_for(&ev.mint);
        let _guard = lock.lock().await;
        match self.saga.trigger(&ev.mint).await? {
            Some(handle) => Ok(Applied::MigrationScheduled(handle)),
            None => Ok(Applied::Duplicate),
        }
    }
}

/// Recomputes price-derived fields from reserves.
pub fn reprice(token: &mut Token, sol_price_usd: f64) {
    token.sol_price_usd = sol_price_usd;
    token.current_price = pricing::current_price(token.reserve_lamport, token.reserve_token, token.decimals);
    token.token_price_usd = pricing::token_price_usd(token.current_price, sol_price_usd);
    token.market_cap_usd = pricing::market_cap_usd(token.total_supply, token.decimals, token.token_price_usd);
    token.liquidity = pricing::liquidity_usd(
        token.reserve_lamport,
        token.reserve_token,
        token.decimals,
        sol_price_usd,
        token.token_price_usd,
    );
    token.curve_progress = pricing::curve_progress(token.reserve_lamport, token.virtual_reserves, token.curve_limit);
}

/// Folds one trade into the aggregate's reserves and rolling stats.
pub fn apply_trade(token: &mut Token, ev: &SwapEvent, sol_price_usd: f64, at: DateTime<Utc>) {
    let previous_price = token.current_price;
    token.reserve_token = ev.reserve_token;
    token.reserve_lamport = ev.reserve_lamport;
    reprice(token, sol_price_usd);

    if at - token.last_volume_reset > Duration::hours(24) {
        token.volume_24h = 0.0;
        token.last_volume_reset = at;
    }
    token.volume_24h += pricing::trade_volume_usd(
        ev.direction,
        ev.amount_in,
        ev.amount_out,
        token.decimals,
        token.token_price_usd,
    );

    if at - token.last_price_update > Duration::hours(1) {
        token.price_24h_ago = if previous_price > 0.0 { previous_price } else { token.current_price };
        token.last_price_update = at;
    }
    token.price_change_24h = pricing::price_change_pct(token.current_price, token.price_24h_ago);
    token.last_updated = at;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use chrono::TimeZone;

    fn token(at: DateTime<Utc>) -> Token {
        let mut t = Token::new("M", "C", "tx0", at);
        t.total_supply = 1_000_000_000_000_000;
        t.virtual_reserves = 30_000_000_000;
        t.curve_limit = 85_000_000_000;
        t.reserve_lamport = 30_000_000_000;
        t.reserve_token = 1_000_000_000_000_000;
        reprice(&mut t, 100.0);
        t.price_24h_ago = t.current_price;
        t
    }

    fn buy(reserve_lamport: u64) -> SwapEvent {
        SwapEvent {
            mint: "M".into(),
            user: "U".into(),
            direction: Direction::Buy,
            amount_in: 1_000_000_000,
            amount_out: 10_000_000_000,
            reserve_token: 990_000_000_000_000,
            reserve_lamport,
            fee: 10_000_000,
        }
    }

    #[test]
    fn test_trade_moves_progress_and_volume() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut t = token(t0);
        assert_eq!(t.curve_progress, 0.0);
        apply_trade(&mut t, &buy(57_500_000_000), 100.0, t0 + Duration::minutes(1));
        assert!((t.curve_progress - 50.0).abs() < 1e-9);
        assert!(t.volume_24h > 0.0);
        assert_eq!(t.reserve_lamport, 57_500_000_000);
    }

    #[test]
    fn test_volume_resets_after_a_day_before_adding() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut t = token(t0);
        t.volume_24h = 5_000.0;
        apply_trade(&mut t, &buy(31_000_000_000), 100.0, t0 + Duration::hours(25));
        assert!(t.volume_24h > 0.0 && t.volume_24h < 5_000.0);
        assert_eq!(t.last_volume_reset, t0 + Duration::hours(25));
    }

    #[test]
    fn test_price_reference_refreshes_hourly() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut t = token(t0);
        let start_price = t.current_price;
        apply_trade(&mut t, &buy(40_000_000_000), 100.0, t0 + Duration::minutes(10));
        assert_eq!(t.price_24h_ago, start_price);
        assert!(t.price_change_24h > 0.0);

        let mid_price = t.current_price;
        apply_trade(&mut t, &buy(41_000_000_000), 100.0, t0 + Duration::minutes(90));
        assert_eq!(t.price_24h_ago, mid_price);
        assert_eq!(t.last_price_update, t0 + Duration::minutes(90));
    }
}
