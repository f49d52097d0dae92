use crate::models::{Fee, MigrationState, StatsMaxima, Swap, Token, TokenStatus};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex as AsyncMutex;

/// Outcome of the atomic curve-completion guard.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationGate {
    /// Status moved to `migrating`; the caller owns the saga run.
    Started(Token),
    /// Another trigger got there first.
    AlreadyInProgress(TokenStatus),
    NotFound,
}

/// Persistence seam for the token aggregate and its event records.
///
/// Every write is conditional or keyed so that duplicate delivery from the
/// live listener and the backfill scanner converges on one result.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get_token(&self, mint: &str) -> Result<Option<Token>>;

    /// Inserts or replaces the token row keyed by `mint`.
    async fn upsert_token(&self, token: &Token) -> Result<()>;

    /// Returns `true` when the swap was new, `false` when `tx_id` already existed.
    async fn insert_swap(&self, swap: &Swap) -> Result<bool>;

    async fn insert_fee(&self, fee: &Fee) -> Result<bool>;

    /// Writes the swap, its fee, and the token's market fields together.
    /// Returns `false` and writes nothing when `swap.tx_id` already existed,
    /// so a failed attempt can be replayed in full.
    async fn record_swap(&self, swap: &Swap, fee: &Fee, token: &Token) -> Result<bool>;

    /// Swaps for `mint` with `start <= timestamp <= end`, oldest first.
    async fn swaps_between(
        &self,
        mint: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Swap>>;

    /// Compare-and-set to `migrating` unless the token is already in a
    /// migration state.
    async fn try_begin_migration(&self, mint: &str, at: DateTime<Utc>) -> Result<MigrationGate>;

    /// Persists saga progress, optionally moving the token status forward.
    async fn save_migration(
        &self,
        mint: &str,
        state: &MigrationState,
        status: Option<TokenStatus>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_status(&self, mint: &str, status: TokenStatus, at: DateTime<Utc>) -> Result<()>;

    async fn mark_migration_failed(
        &self,
        mint: &str,
        state: &MigrationState,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// `last_updated` of the most recently touched token.
    async fn latest_update(&self) -> Result<Option<DateTime<Utc>>>;

    async fn max_stats(&self) -> Result<StatsMaxima>;

    async fn tokens_with_status(&self, statuses: &[TokenStatus]) -> Result<Vec<Token>>;

    async fn set_holder_count(&self, mint: &str, count: u64) -> Result<()>;

    /// Writes reserve, price, market-cap, liquidity and volume fields only;
    /// status and migration state are left alone.
    async fn update_market_data(&self, token: &Token) -> Result<()>;
}

#[derive(Default)]
struct MemoryInner {
    tokens: HashMap<String, Token>,
    swaps: HashMap<String, Swap>,
    fees: HashMap<String, Fee>,
}

/// In-process store with the same conditional-write semantics as Postgres.
#[derive(Default)]
pub struct MemoryStore {
    inner: AsyncMutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn swap_count(&self) -> usize {
        self.inner.lock().await.swaps.len()
    }

    pub async fn fee_count(&self) -> usize {
        self.inner.lock().await.fees.len()
    }

    pub async fn fees_for(&self, mint: &str) -> Vec<Fee> {
        let inner = self.inner.lock().await;
        inner
            .fees
            .values()
            .filter(|f| f.token_mint == mint)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn get_token(&self, mint: &str) -> Result<Option<Token>> {
        Ok(self.inner.lock().await.tokens.get(mint).cloned())
    }

    async fn upsert_token(&self, token: &Token) -> Result<()> {
        self.inner
            .lock()
            .await
            .tokens
            .insert(token.mint.clone(), token.clone());
        Ok(())
    }

    async fn insert_swap(&self, swap: &Swap) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.swaps.contains_key(&swap.tx_id) {
            return Ok(false);
        }
        inner.swaps.insert(swap.tx_id.clone(), swap.clone());
        Ok(true)
    }

    async fn insert_fee(&self, fee: &Fee) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.fees.contains_key(&fee.tx_id) {
            return Ok(false);
        }
        inner.fees.insert(fee.tx_id.clone(), fee.clone());
        Ok(true)
    }

    async fn record_swap(&self, swap: &Swap, fee: &Fee, token: &Token) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.swaps.contains_key(&swap.tx_id) {
            return Ok(false);
        }
        inner.swaps.insert(swap.tx_id.clone(), swap.clone());
        inner.fees.entry(fee.tx_id.clone()).or_insert_with(|| fee.clone());
        if let Some(existing) = inner.tokens.get_mut(&token.mint) {
            copy_market_fields(existing, token);
        }
        Ok(true)
    }

    async fn swaps_between(
        &self,
        mint: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Swap>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<Swap> = inner
            .swaps
            .values()
            .filter(|s| s.token_mint == mint && s.timestamp >= start && s.timestamp <= end)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.tx_id.cmp(&b.tx_id)));
        Ok(out)
    }

    async fn try_begin_migration(&self, mint: &str, at: DateTime<Utc>) -> Result<MigrationGate> {
        let mut inner = self.inner.lock().await;
        let Some(token) = inner.tokens.get_mut(mint) else {
            return Ok(MigrationGate::NotFound);
        };
        if token.status.is_in_migration() {
            return Ok(MigrationGate::AlreadyInProgress(token.status));
        }
        token.status = TokenStatus::Migrating;
        token.last_updated = at;
        Ok(MigrationGate::Started(token.clone()))
    }

    async fn save_migration(
        &self,
        mint: &str,
        state: &MigrationState,
        status: Option<TokenStatus>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(token) = inner.tokens.get_mut(mint) {
            token.migration = state.clone();
            if let Some(status) = status {
                token.status = status;
            }
            token.last_updated = at;
        }
        Ok(())
    }

    async fn set_status(&self, mint: &str, status: TokenStatus, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(token) = inner.tokens.get_mut(mint) {
            token.status = status;
            token.last_updated = at;
        }
        Ok(())
    }

    async fn mark_migration_failed(
        &self,
        mint: &str,
        state: &MigrationState,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.save_migration(mint, state, Some(TokenStatus::MigrationFailed), at)
            .await
    }

    async fn latest_update(&self) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().await;
        Ok(inner.tokens.values().map(|t| t.last_updated).max())
    }

    async fn max_stats(&self) -> Result<StatsMaxima> {
        let inner = self.inner.lock().await;
        let mut out = StatsMaxima::default();
        for t in inner.tokens.values() {
            out.max_volume_24h = out.max_volume_24h.max(t.volume_24h);
            out.max_holder_count = out.max_holder_count.max(t.holder_count);
            out.max_market_cap = out.max_market_cap.max(t.market_cap_usd);
        }
        Ok(out)
    }

    async fn tokens_with_status(&self, statuses: &[TokenStatus]) -> Result<Vec<Token>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<Token> = inner
            .tokens
            .values()
            .filter(|t| statuses.contains(&t.status))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.mint.cmp(&b.mint));
        Ok(out)
    }

    async fn set_holder_count(&self, mint: &str, count: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(token) = inner.tokens.get_mut(mint) {
            token.holder_count = count;
        }
        Ok(())
    }

    async fn update_market_data(&self, token: &Token) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.tokens.get_mut(&token.mint) {
            copy_market_fields(existing, token);
        }
        Ok(())
    }
}

fn copy_market_fields(existing: &mut Token, token: &Token) {
    existing.reserve_token = token.reserve_token;
    existing.reserve_lamport = token.reserve_lamport;
    existing.curve_progress = token.curve_progress;
    existing.current_price = token.current_price;
    existing.token_price_usd = token.token_price_usd;
    existing.sol_price_usd = token.sol_price_usd;
    existing.market_cap_usd = token.market_cap_usd;
    existing.liquidity = token.liquidity;
    existing.volume_24h = token.volume_24h;
    existing.price_24h_ago = token.price_24h_ago;
    existing.price_change_24h = token.price_change_24h;
    existing.last_price_update = token.last_price_update;
    existing.last_volume_reset = token.last_volume_reset;
    existing.last_updated = token.last_updated;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, FeeKind};

    fn swap(tx: &str, secs: i64) -> Swap {
        Swap {
            token_mint: "mint".into(),
            user: "user".into(),
            direction: Direction::Buy,
            amount_in: 1,
            amount_out: 1,
            price: 1.0,
            tx_id: tx.into(),
            timestamp: DateTime::from_timestamp(secs, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_insert_swap_is_keyed_by_tx_id() {
        let store = MemoryStore::new();
        assert!(store.insert_swap(&swap("a", 10)).await.unwrap());
        assert!(!store.insert_swap(&swap("a", 99)).await.unwrap());
        assert_eq!(store.swap_count().await, 1);
    }

    #[tokio::test]
    async fn test_record_swap_writes_all_or_nothing() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_token(&Token::new("mint", "c", "tx", now)).await.unwrap();
        let fee = Fee {
            token_mint: "mint".into(),
            user: "user".into(),
            direction: Direction::Buy,
            kind: FeeKind::Swap,
            token_amount: 0,
            sol_amount: 5,
            tx_id: "a".into(),
            timestamp: now,
        };
        let mut updated = Token::new("mint", "c", "tx", now);
        updated.reserve_lamport = 40;
        assert!(store.record_swap(&swap("a", 10), &fee, &updated).await.unwrap());

        updated.reserve_lamport = 99;
        assert!(!store.record_swap(&swap("a", 10), &fee, &updated).await.unwrap());

        let token = store.get_token("mint").await.unwrap().unwrap();
        assert_eq!(token.reserve_lamport, 40);
        assert_eq!(store.swap_count().await, 1);
        assert_eq!(store.fee_count().await, 1);
    }

    #[tokio::test]
    async fn test_swaps_between_is_inclusive_and_sorted() {
        let store = MemoryStore::new();
        for (tx, t) in [("c", 30), ("a", 10), ("b", 20), ("d", 40)] {
            store.insert_swap(&swap(tx, t)).await.unwrap();
        }
        let got = store
            .swaps_between(
                "mint",
                DateTime::from_timestamp(10, 0).unwrap(),
                DateTime::from_timestamp(30, 0).unwrap(),
            )
            .await
            .unwrap();
        let ids: Vec<_> = got.iter().map(|s| s.tx_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_begin_migration_only_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_token(&Token::new("m", "c", "tx", now)).await.unwrap();
        assert!(matches!(
            store.try_begin_migration("m", now).await.unwrap(),
            MigrationGate::Started(_)
        ));
        assert_eq!(
            store.try_begin_migration("m", now).await.unwrap(),
            MigrationGate::AlreadyInProgress(TokenStatus::Migrating)
        );
        assert_eq!(
            store.try_begin_migration("other", now).await.unwrap(),
            MigrationGate::NotFound
        );
    }
}
