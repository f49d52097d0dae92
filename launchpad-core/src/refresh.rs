use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::fanout::{emit, token_room, FanoutEvent, GLOBAL_ROOM};
use crate::models::{Token, TokenStatus};
use crate::projector::reprice;
use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Recounts holders for every active token, one queued task per token.
/// Returns how many tokens were updated.
pub async fn refresh_holders(ctx: &PipelineContext) -> Result<usize> {
    let tokens = ctx.store.tokens_with_status(&[TokenStatus::Active]).await?;
    let handles: Vec<_> = tokens
        .into_iter()
        .map(|token| {
            let ctx = ctx.clone();
            ctx.queue.clone().add(async move {
                let count = ctx.chain.holder_count(&token.mint).await?;
                if count != token.holder_count {
                    ctx.store.set_holder_count(&token.mint, count).await?;
                    ctx.stats.observe_holder_count(count).await;
                    debug!(mint = %token.mint, count, "holder count updated");
                }
                Ok(())
            })
        })
        .collect();

    let mut updated = 0;
    for result in join_all(handles).await {
        match result {
            Ok(()) => updated += 1,
            Err(err) => warn!("holder refresh failed: {err:#}"),
        }
    }
    Ok(updated)
}

/// Applies pool reserves to a migrated token. Returns `false` when the pool
/// holds none of the token.
pub fn apply_pool_reserves(token: &mut Token, mint_a: &str, reserve_a: u64, reserve_b: u64, sol_price_usd: f64) -> bool {
    let (tokens, lamports) = if mint_a == token.mint {
        (reserve_a, reserve_b)
    } else {
        (reserve_b, reserve_a)
    };
    if tokens == 0 {
        return false;
    }
    token.reserve_token = tokens;
    token.reserve_lamport = lamports;
    reprice(token, sol_price_usd);
    token.curve_progress = 100.0;
    token.price_change_24h = crate::pricing::price_change_pct(token.current_price, token.price_24h_ago);
    token.last_updated = Utc::now();
    true
}

/// Re-prices every locked token from its AMM pool and publishes the result.
pub async fn refresh_market(ctx: &PipelineContext) -> Result<usize> {
    let tokens = ctx.store.tokens_with_status(&[TokenStatus::Locked]).await?;
    let sol = ctx.oracle.quote_usd_price().await;
    let handles: Vec<_> = tokens
        .into_iter()
        .filter_map(|token| {
            let pool_id = token.migration.pool.as_ref()?.pool_id.clone();
            let sol = if sol > 0.0 { sol } else { token.sol_price_usd };
            let ctx = ctx.clone();
            Some(ctx.queue.clone().add(async move {
                let mut token = token;
                let info = ctx.amm.pool_info(&pool_id).await?;
                if !apply_pool_reserves(&mut token, &info.mint_a, info.reserve_a, info.reserve_b, sol) {
                    return Err(PipelineError::MissingState {
                        mint: token.mint,
                        what: "pool reserves",
                    }
                    .into());
                }
                ctx.store.update_market_data(&token).await?;
                let enriched = ctx.stats.enrich(token.clone()).await;
                emit(
                    ctx.fanout.as_ref(),
                    &token_room(&token.mint),
                    FanoutEvent::UpdateToken(enriched.clone()),
                )
                .await;
                emit(ctx.fanout.as_ref(), GLOBAL_ROOM, FanoutEvent::UpdateToken(enriched)).await;
                Ok(())
            }))
        })
        .collect();

    let mut updated = 0;
    for result in join_all(handles).await {
        match result {
            Ok(()) => updated += 1,
            Err(err) => warn!("market refresh failed: {err:#}"),
        }
    }
    Ok(updated)
}

/// Runs both refresh jobs on their configured intervals until cancelled.
pub async fn run_refresh_loop(ctx: PipelineContext) -> Result<()> {
    let mut holders = interval(Duration::from_secs(ctx.refresh.holders_interval_secs.max(1)));
    let mut market = interval(Duration::from_secs(ctx.refresh.market_interval_secs.max(1)));
    holders.set_missed_tick_behavior(MissedTickBehavior::Delay);
    market.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        holders_secs = ctx.refresh.holders_interval_secs,
        market_secs = ctx.refresh.market_interval_secs,
        "refresh jobs started"
    );
    loop {
        tokio::select! {
            _ = holders.tick() => {
                match refresh_holders(&ctx).await {
                    Ok(n) => debug!(tokens = n, "holder refresh pass done"),
                    Err(err) => warn!("holder refresh pass failed: {err:?}"),
                }
            }
            _ = market.tick() => {
                match refresh_market(&ctx).await {
                    Ok(n) => debug!(tokens = n, "market refresh pass done"),
                    Err(err) => warn!("market refresh pass failed: {err:?}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reserves_follow_mint_order() {
        let mut t = Token::new("MINT", "c", "tx", Utc::now());
        t.total_supply = 1_000_000_000_000_000;
        assert!(apply_pool_reserves(&mut t, "QUOTE", 80_000_000_000, 200_000_000_000_000, 100.0));
        assert_eq!(t.reserve_lamport, 80_000_000_000);
        assert_eq!(t.reserve_token, 200_000_000_000_000);
        assert_eq!(t.curve_progress, 100.0);
        assert!(t.market_cap_usd > 0.0);
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        let mut t = Token::new("MINT", "c", "tx", Utc::now());
        assert!(!apply_pool_reserves(&mut t, "MINT", 0, 5, 100.0));
        assert_eq!(t.reserve_lamport, 0);
    }
}
