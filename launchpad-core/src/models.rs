use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a launched token. Transitions only move forward:
/// `active -> migrating -> withdrawn -> migrated -> locked`, with
/// `migration_failed` reachable from any migration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    #[default]
    Active,
    Migrating,
    Withdrawn,
    Migrated,
    Locked,
    MigrationFailed,
}

impl TokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Active => "active",
            TokenStatus::Migrating => "migrating",
            TokenStatus::Withdrawn => "withdrawn",
            TokenStatus::Migrated => "migrated",
            TokenStatus::Locked => "locked",
            TokenStatus::MigrationFailed => "migration_failed",
        }
    }

    /// Statuses for which a new curve-completion trigger must be ignored.
    pub const IN_MIGRATION: [TokenStatus; 4] = [
        TokenStatus::Migrating,
        TokenStatus::Withdrawn,
        TokenStatus::Migrated,
        TokenStatus::Locked,
    ];

    pub fn is_in_migration(&self) -> bool {
        Self::IN_MIGRATION.contains(self)
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "active" => TokenStatus::Active,
            "migrating" => TokenStatus::Migrating,
            "withdrawn" => TokenStatus::Withdrawn,
            "migrated" => TokenStatus::Migrated,
            "locked" => TokenStatus::Locked,
            "migration_failed" => TokenStatus::MigrationFailed,
            other => anyhow::bail!("unknown token status {other:?}"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// Wire encoding used by the program's `Swap:` log line.
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "0" => Some(Direction::Buy),
            "1" => Some(Direction::Sell),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> i16 {
        match self {
            Direction::Buy => 0,
            Direction::Sell => 1,
        }
    }

    pub fn from_i16(v: i16) -> anyhow::Result<Self> {
        match v {
            0 => Ok(Direction::Buy),
            1 => Ok(Direction::Sell),
            other => anyhow::bail!("unknown swap direction {other}"),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Direction::Buy => "buy",
            Direction::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeKind {
    Swap,
    Migration,
}

impl FeeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeKind::Swap => "swap",
            FeeKind::Migration => "migration",
        }
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw {
            "swap" => Ok(FeeKind::Swap),
            "migration" => Ok(FeeKind::Migration),
            other => anyhow::bail!("unknown fee kind {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Unset,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub tx_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn success(tx_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: StepStatus::Success,
            tx_id: Some(tx_id.into()),
            updated_at: Some(at),
        }
    }

    pub fn failure(at: DateTime<Utc>) -> Self {
        Self {
            status: StepStatus::Failure,
            tx_id: None,
            updated_at: Some(at),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawnAmounts {
    pub lamports: u64,
    pub tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolAddresses {
    pub pool_id: String,
    pub lp_mint: String,
    pub vault_a: String,
    pub vault_b: String,
}

/// One LP lock transaction. Amounts are planned once from the LP balance;
/// `tx_id` is set when the tranche has landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockTranche {
    pub amount: u64,
    #[serde(default)]
    pub tx_id: Option<String>,
    #[serde(default)]
    pub nft_mint: Option<String>,
}

impl LockTranche {
    pub fn planned(amount: u64) -> Self {
        Self {
            amount,
            tx_id: None,
            nft_mint: None,
        }
    }
}

/// Saga progress embedded in the token row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    #[serde(default)]
    pub withdraw: StepRecord,
    #[serde(default)]
    pub create_pool: StepRecord,
    #[serde(default)]
    pub lock_lp: StepRecord,
    #[serde(default)]
    pub finalize: StepRecord,
    #[serde(default)]
    pub withdrawn_amounts: Option<WithdrawnAmounts>,
    #[serde(default)]
    pub pool: Option<PoolAddresses>,
    #[serde(default)]
    pub nft_minted: Option<String>,
    #[serde(default)]
    pub locked_amount: Option<u64>,
    #[serde(default)]
    pub lock_tranches: Vec<LockTranche>,
    #[serde(default)]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub mint: String,
    pub creator: String,
    pub tx_id: String,
    pub name: String,
    pub symbol: String,
    pub uri: String,
    pub image: Option<String>,
    pub description: Option<String>,
    pub decimals: u8,
    pub total_supply: u64,
    pub reserve_token: u64,
    pub reserve_lamport: u64,
    pub virtual_reserves: u64,
    pub curve_limit: u64,
    pub current_price: f64,
    pub token_price_usd: f64,
    pub sol_price_usd: f64,
    pub market_cap_usd: f64,
    pub liquidity: f64,
    pub curve_progress: f64,
    pub volume_24h: f64,
    pub price_24h_ago: f64,
    pub price_change_24h: f64,
    pub last_volume_reset: DateTime<Utc>,
    pub last_price_update: DateTime<Utc>,
    pub holder_count: u64,
    pub status: TokenStatus,
    pub migration: MigrationState,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Token {
    /// A fresh token with zeroed market fields.
    pub fn new(
        mint: impl Into<String>,
        creator: impl Into<String>,
        tx_id: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            mint: mint.into(),
            creator: creator.into(),
            tx_id: tx_id.into(),
            name: String::new(),
            symbol: String::new(),
            uri: String::new(),
            image: None,
            description: None,
            decimals: 6,
            total_supply: 0,
            reserve_token: 0,
            reserve_lamport: 0,
            virtual_reserves: 0,
            curve_limit: 0,
            current_price: 0.0,
            token_price_usd: 0.0,
            sol_price_usd: 0.0,
            market_cap_usd: 0.0,
            liquidity: 0.0,
            curve_progress: 0.0,
            volume_24h: 0.0,
            price_24h_ago: 0.0,
            price_change_24h: 0.0,
            last_volume_reset: at,
            last_price_update: at,
            holder_count: 0,
            status: TokenStatus::Active,
            migration: MigrationState::default(),
            created_at: at,
            last_updated: at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Swap {
    pub token_mint: String,
    pub user: String,
    pub direction: Direction,
    pub amount_in: u64,
    pub amount_out: u64,
    pub price: f64,
    pub tx_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fee {
    pub token_mint: String,
    pub user: String,
    pub direction: Direction,
    #[serde(rename = "type")]
    pub kind: FeeKind,
    pub token_amount: u64,
    pub sol_amount: u64,
    pub tx_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Bucket start, unix seconds.
    pub time: i64,
}

/// Decoded bonding-curve account.
#[derive(Debug, Clone, PartialEq)]
pub struct BondingCurveAccount {
    pub token_mint: String,
    pub creator: String,
    pub created_time: i64,
    pub init_bonding_curve: f64,
    pub init_lamport: u64,
    pub reserve_lamport: u64,
    pub reserve_token: u64,
    pub max_buy: u64,
    pub max_sell: u64,
    pub curve_limit: u64,
    pub is_completed: bool,
}

/// Off-chain descriptive metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TokenMetadata {
    pub name: String,
    pub symbol: String,
    pub uri: String,
    pub image: Option<String>,
    pub description: Option<String>,
}

/// Aggregate maxima used for score normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatsMaxima {
    pub max_volume_24h: f64,
    pub max_holder_count: u64,
    pub max_market_cap: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_through_str() {
        for status in [
            TokenStatus::Active,
            TokenStatus::Migrating,
            TokenStatus::Withdrawn,
            TokenStatus::Migrated,
            TokenStatus::Locked,
            TokenStatus::MigrationFailed,
        ] {
            assert_eq!(status.as_str().parse::<TokenStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<TokenStatus>().is_err());
    }

    #[test]
    fn test_in_migration_guard_set() {
        assert!(!TokenStatus::Active.is_in_migration());
        assert!(!TokenStatus::MigrationFailed.is_in_migration());
        assert!(TokenStatus::Migrating.is_in_migration());
        assert!(TokenStatus::Locked.is_in_migration());
    }

    #[test]
    fn test_migration_state_tolerates_missing_fields() {
        let state: MigrationState =
            serde_json::from_str(r#"{"withdraw":{"status":"success","txId":"abc"}}"#).unwrap();
        assert!(state.withdraw.is_success());
        assert_eq!(state.withdraw.tx_id.as_deref(), Some("abc"));
        assert_eq!(state.create_pool.status, StepStatus::Unset);
        assert!(state.withdrawn_amounts.is_none());
        assert!(state.lock_tranches.is_empty());
    }

    #[test]
    fn test_lock_tranches_wire_format() {
        let state: MigrationState = serde_json::from_str(
            r#"{"lockTranches":[{"amount":900,"txId":"t1","nftMint":"n1"},{"amount":100}]}"#,
        )
        .unwrap();
        assert_eq!(state.lock_tranches[0].tx_id.as_deref(), Some("t1"));
        assert_eq!(state.lock_tranches[1], LockTranche::planned(100));
    }

    #[test]
    fn test_direction_wire_encoding() {
        assert_eq!(Direction::from_wire("0"), Some(Direction::Buy));
        assert_eq!(Direction::from_wire("1"), Some(Direction::Sell));
        assert_eq!(Direction::from_wire("2"), None);
    }
}
