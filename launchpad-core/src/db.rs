use crate::models::{
    Direction, Fee, FeeKind, MigrationState, StatsMaxima, Swap, Token, TokenStatus,
};
use crate::store::{MigrationGate, TokenStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{types::Json, PgPool, Postgres, Row};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    // Embed migrations from the workspace `migrations` directory.
    sqlx::migrate!("../migrations").run(pool).await?;
    Ok(())
}

// Amounts are u64 on chain and BIGINT in Postgres; values above i64::MAX do
// not occur for 6/9-decimal supplies but are rejected rather than wrapped.
fn to_i64(v: u64, field: &'static str) -> Result<i64> {
    i64::try_from(v).with_context(|| format!("{field} value {v} exceeds BIGINT"))
}

fn to_u64(v: i64, field: &'static str) -> Result<u64> {
    u64::try_from(v).with_context(|| format!("{field} value {v} is negative"))
}

fn swap_insert(s: &Swap) -> Result<PgQuery<'_>> {
    Ok(sqlx::query(
        r#"
        INSERT INTO swaps (
            tx_id, token_mint, "user", direction, amount_in, amount_out, price, timestamp
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
        ON CONFLICT (tx_id) DO NOTHING
        "#,
    )
    .bind(&s.tx_id)
    .bind(&s.token_mint)
    .bind(&s.user)
    .bind(s.direction.as_i16())
    .bind(to_i64(s.amount_in, "amount_in")?)
    .bind(to_i64(s.amount_out, "amount_out")?)
    .bind(s.price)
    .bind(s.timestamp))
}

fn fee_insert(f: &Fee) -> Result<PgQuery<'_>> {
    Ok(sqlx::query(
        r#"
        INSERT INTO fees (
            tx_id, token_mint, "user", direction, kind, token_amount, sol_amount, timestamp
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
        ON CONFLICT (tx_id) DO NOTHING
        "#,
    )
    .bind(&f.tx_id)
    .bind(&f.token_mint)
    .bind(&f.user)
    .bind(f.direction.as_i16())
    .bind(f.kind.as_str())
    .bind(to_i64(f.token_amount, "token_amount")?)
    .bind(to_i64(f.sol_amount, "sol_amount")?)
    .bind(f.timestamp))
}

/// Market fields only; status and migration state are left alone.
fn market_update(t: &Token) -> Result<PgQuery<'_>> {
    Ok(sqlx::query(
        r#"
        UPDATE tokens
        SET current_price = $2,
            token_price_usd = $3,
            sol_price_usd = $4,
            market_cap_usd = $5,
            liquidity = $6,
            volume_24h = $7,
            price_24h_ago = $8,
            price_change_24h = $9,
            last_price_update = $10,
            last_volume_reset = $11,
            last_updated = $12,
            reserve_token = $13,
            reserve_lamport = $14,
            curve_progress = $15
        WHERE mint = $1
        "#,
    )
    .bind(&t.mint)
    .bind(t.current_price)
    .bind(t.token_price_usd)
    .bind(t.sol_price_usd)
    .bind(t.market_cap_usd)
    .bind(t.liquidity)
    .bind(t.volume_24h)
    .bind(t.price_24h_ago)
    .bind(t.price_change_24h)
    .bind(t.last_price_update)
    .bind(t.last_volume_reset)
    .bind(t.last_updated)
    .bind(to_i64(t.reserve_token, "reserve_token")?)
    .bind(to_i64(t.reserve_lamport, "reserve_lamport")?)
    .bind(t.curve_progress))
}

#[derive(Debug, sqlx::FromRow)]
struct TokenRow {
    mint: String,
    creator: String,
    tx_id: String,
    name: String,
    symbol: String,
    uri: String,
    image: Option<String>,
    description: Option<String>,
    decimals: i16,
    total_supply: i64,
    reserve_token: i64,
    reserve_lamport: i64,
    virtual_reserves: i64,
    curve_limit: i64,
    current_price: f64,
    token_price_usd: f64,
    sol_price_usd: f64,
    market_cap_usd: f64,
    liquidity: f64,
    curve_progress: f64,
    volume_24h: f64,
    price_24h_ago: f64,
    price_change_24h: f64,
    last_volume_reset: DateTime<Utc>,
    last_price_update: DateTime<Utc>,
    holder_count: i64,
    status: String,
    migration: Json<MigrationState>,
    created_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
}

impl TryFrom<TokenRow> for Token {
    type Error = anyhow::Error;

    fn try_from(r: TokenRow) -> Result<Self> {
        Ok(Token {
            decimals: u8::try_from(r.decimals).context("decimals out of range")?,
            total_supply: to_u64(r.total_supply, "total_supply")?,
            reserve_token: to_u64(r.reserve_token, "reserve_token")?,
            reserve_lamport: to_u64(r.reserve_lamport, "reserve_lamport")?,
            virtual_reserves: to_u64(r.virtual_reserves, "virtual_reserves")?,
            curve_limit: to_u64(r.curve_limit, "curve_limit")?,
            holder_count: to_u64(r.holder_count, "holder_count")?,
            status: r.status.parse()?,
            migration: r.migration.0,
            mint: r.mint,
            creator: r.creator,
            tx_id: r.tx_id,
            name: r.name,
            symbol: r.symbol,
            uri: r.uri,
            image: r.image,
            description: r.description,
            current_price: r.current_price,
            token_price_usd: r.token_price_usd,
            sol_price_usd: r.sol_price_usd,
            market_cap_usd: r.market_cap_usd,
            liquidity: r.liquidity,
            curve_progress: r.curve_progress,
            volume_24h: r.volume_24h,
            price_24h_ago: r.price_24h_ago,
            price_change_24h: r.price_change_24h,
            last_volume_reset: r.last_volume_reset,
            last_price_update: r.last_price_update,
            created_at: r.created_at,
            last_updated: r.last_updated,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SwapRow {
    tx_id: String,
    token_mint: String,
    user: String,
    direction: i16,
    amount_in: i64,
    amount_out: i64,
    price: f64,
    timestamp: DateTime<Utc>,
}

impl TryFrom<SwapRow> for Swap {
    type Error = anyhow::Error;

    fn try_from(r: SwapRow) -> Result<Self> {
        Ok(Swap {
            direction: Direction::from_i16(r.direction)?,
            amount_in: to_u64(r.amount_in, "amount_in")?,
            amount_out: to_u64(r.amount_out, "amount_out")?,
            token_mint: r.token_mint,
            user: r.user,
            price: r.price,
            tx_id: r.tx_id,
            timestamp: r.timestamp,
        })
    }
}

const TOKEN_COLUMNS: &str = r#"
    mint, creator, tx_id, name, symbol, uri, image, description, decimals,
    total_supply, reserve_token, reserve_lamport, virtual_reserves, curve_limit,
    current_price, token_price_usd, sol_price_usd, market_cap_usd, liquidity,
    curve_progress, volume_24h, price_24h_ago, price_change_24h,
    last_volume_reset, last_price_update, holder_count, status, migration,
    created_at, last_updated
"#;

/// Postgres-backed [`TokenStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn get_token(&self, mint: &str) -> Result<Option<Token>> {
        let sql = format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE mint = $1");
        let row = sqlx::query_as::<_, TokenRow>(&sql)
            .bind(mint)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Token::try_from).transpose()
    }

    async fn upsert_token(&self, t: &Token) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tokens (
                mint, creator, tx_id, name, symbol, uri, image, description, decimals,
                total_supply, reserve_token, reserve_lamport, virtual_reserves, curve_limit,
                current_price, token_price_usd, sol_price_usd, market_cap_usd, liquidity,
                curve_progress, volume_24h, price_24h_ago, price_change_24h,
                last_volume_reset, last_price_update, holder_count, status, migration,
                created_at, last_updated
            ) VALUES (
                $1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,
                $16,$17,$18,$19,$20,$21,$22,$23,$24,$25,$26,$27,$28,$29,$30
            )
            ON CONFLICT (mint) DO UPDATE SET
                creator = EXCLUDED.creator,
                tx_id = EXCLUDED.tx_id,
                name = EXCLUDED.name,
                symbol = EXCLUDED.symbol,
                uri = EXCLUDED.uri,
                image = COALESCE(EXCLUDED.image, tokens.image),
                description = COALESCE(EXCLUDED.description, tokens.description),
                decimals = EXCLUDED.decimals,
                total_supply = EXCLUDED.total_supply,
                reserve_token = EXCLUDED.reserve_token,
                reserve_lamport = EXCLUDED.reserve_lamport,
                virtual_reserves = EXCLUDED.virtual_reserves,
                curve_limit = EXCLUDED.curve_limit,
                current_price = EXCLUDED.current_price,
                token_price_usd = EXCLUDED.token_price_usd,
                sol_price_usd = EXCLUDED.sol_price_usd,
                market_cap_usd = EXCLUDED.market_cap_usd,
                liquidity = EXCLUDED.liquidity,
                curve_progress = EXCLUDED.curve_progress,
                volume_24h = EXCLUDED.volume_24h,
                price_24h_ago = EXCLUDED.price_24h_ago,
                price_change_24h = EXCLUDED.price_change_24h,
                last_volume_reset = EXCLUDED.last_volume_reset,
                last_price_update = EXCLUDED.last_price_update,
                holder_count = GREATEST(tokens.holder_count, EXCLUDED.holder_count),
                last_updated = GREATEST(tokens.last_updated, EXCLUDED.last_updated)
            "#,
        )
        .bind(&t.mint)
        .bind(&t.creator)
        .bind(&t.tx_id)
        .bind(&t.name)
        .bind(&t.symbol)
        .bind(&t.uri)
        .bind(&t.image)
        .bind(&t.description)
        .bind(t.decimals as i16)
        .bind(to_i64(t.total_supply, "total_supply")?)
        .bind(to_i64(t.reserve_token, "reserve_token")?)
        .bind(to_i64(t.reserve_lamport, "reserve_lamport")?)
        .bind(to_i64(t.virtual_reserves, "virtual_reserves")?)
        .bind(to_i64(t.curve_limit, "curve_limit")?)
        .bind(t.current_price)
        .bind(t.token_price_usd)
        .bind(t.sol_price_usd)
        .bind(t.market_cap_usd)
        .bind(t.liquidity)
        .bind(t.curve_progress)
        .bind(t.volume_24h)
        .bind(t.price_24h_ago)
        .bind(t.price_change_24h)
        .bind(t.last_volume_reset)
        .bind(t.last_price_update)
        .bind(to_i64(t.holder_count, "holder_count")?)
        .bind(t.status.as_str())
        .bind(Json(&t.migration))
        .bind(t.created_at)
        .bind(t.last_updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_swap(&self, s: &Swap) -> Result<bool> {
        let res = swap_insert(s)?.execute(&self.pool).await?;
        Ok(res.rows_affected() == 1)
    }

    async fn insert_fee(&self, f: &Fee) -> Result<bool> {
        let res = fee_insert(f)?.execute(&self.pool).await?;
        Ok(res.rows_affected() == 1)
    }

    async fn record_swap(&self, swap: &Swap, fee: &Fee, token: &Token) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = swap_insert(swap)?.execute(&mut *tx).await?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        fee_insert(fee)?.execute(&mut *tx).await?;
        market_update(token)?.execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn swaps_between(
        &self,
        mint: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Swap>> {
        let rows = sqlx::query_as::<_, SwapRow>(
            r#"
            SELECT tx_id, token_mint, "user", direction, amount_in, amount_out, price, timestamp
            FROM swaps
            WHERE token_mint = $1
              AND timestamp >= $2
              AND timestamp <= $3
            ORDER BY timestamp ASC, tx_id ASC
            "#,
        )
        .bind(mint)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Swap::try_from).collect()
    }

    async fn try_begin_migration(&self, mint: &str, at: DateTime<Utc>) -> Result<MigrationGate> {
        let sql = format!(
            r#"
            UPDATE tokens
            SET status = 'migrating', last_updated = $2
            WHERE mint = $1
              AND status NOT IN ('migrating', 'withdrawn', 'migrated', 'locked')
            RETURNING {TOKEN_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, TokenRow>(&sql)
            .bind(mint)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = updated {
            return Ok(MigrationGate::Started(Token::try_from(row)?));
        }

        let status = sqlx::query(r#"SELECT status FROM tokens WHERE mint = $1"#)
            .bind(mint)
            .fetch_optional(&self.pool)
            .await?;
        match status {
            Some(row) => {
                let raw: String = row.try_get("status")?;
                Ok(MigrationGate::AlreadyInProgress(raw.parse()?))
            }
            None => Ok(MigrationGate::NotFound),
        }
    }

    async fn save_migration(
        &self,
        mint: &str,
        state: &MigrationState,
        status: Option<TokenStatus>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tokens
            SET migration = $2,
                status = COALESCE($3, status),
                last_updated = $4
            WHERE mint = $1
            "#,
        )
        .bind(mint)
        .bind(Json(state))
        .bind(status.map(|s| s.as_str()))
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_status(&self, mint: &str, status: TokenStatus, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(r#"UPDATE tokens SET status = $2, last_updated = $3 WHERE mint = $1"#)
            .bind(mint)
            .bind(status.as_str())
            .bind(at)
            .execute(&self.pool)
            .await?;
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
        let row = sqlx::query(r#"SELECT MAX(last_updated) AS latest FROM tokens"#)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<Option<DateTime<Utc>>, _>("latest")?)
    }

    async fn max_stats(&self) -> Result<StatsMaxima> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(MAX(volume_24h), 0)::DOUBLE PRECISION AS max_volume,
                COALESCE(MAX(holder_count), 0)::BIGINT AS max_holders,
                COALESCE(MAX(market_cap_usd), 0)::DOUBLE PRECISION AS max_mcap
            FROM tokens
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StatsMaxima {
            max_volume_24h: row.try_get("max_volume")?,
            max_holder_count: to_u64(row.try_get("max_holders")?, "holder_count")?,
            max_market_cap: row.try_get("max_mcap")?,
        })
    }

    async fn tokens_with_status(&self, statuses: &[TokenStatus]) -> Result<Vec<Token>> {
        let names: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let sql = format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE status = ANY($1) ORDER BY mint ASC"
        );
        let rows = sqlx::query_as::<_, TokenRow>(&sql)
            .bind(&names)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Token::try_from).collect()
    }

    async fn set_holder_count(&self, mint: &str, count: u64) -> Result<()> {
        sqlx::query(r#"UPDATE tokens SET holder_count = $2 WHERE mint = $1"#)
            .bind(mint)
            .bind(to_i64(count, "holder_count")?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_market_data(&self, t: &Token) -> Result<()> {
        market_update(t)?.execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_conversions_reject_out_of_range() {
        assert_eq!(to_i64(42, "x").unwrap(), 42);
        assert!(to_i64(u64::MAX, "x").is_err());
        assert!(to_u64(-1, "x").is_err());
    }

    #[test]
    fn test_swap_row_conversion() {
        let row = SwapRow {
            tx_id: "sig".into(),
            token_mint: "mint".into(),
            user: "user".into(),
            direction: 1,
            amount_in: 10,
            amount_out: 20,
            price: 0.5,
            timestamp: Utc::now(),
        };
        let swap = Swap::try_from(row).unwrap();
        assert_eq!(swap.direction, Direction::Sell);
        assert_eq!(swap.amount_out, 20);
    }

    #[test]
    fn test_fee_kind_column_values() {
        assert_eq!(FeeKind::parse(FeeKind::Migration.as_str()).unwrap(), FeeKind::Migration);
    }
}
