use anyhow::{bail, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    pub environment: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub ws_url: String,
    pub program_id: String,
    pub keypair_path: String,
    /// Quote asset the curve trades against (wrapped SOL by default).
    #[serde(default = "default_quote_mint")]
    pub quote_mint: String,
    #[serde(default = "default_compute_unit_limit")]
    pub compute_unit_limit: u32,
    #[serde(default = "default_compute_unit_price")]
    pub compute_unit_price_micro_lamports: u64,
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CurveConfig {
    pub token_supply: u64,
    pub virtual_reserves: u64,
    pub curve_limit: u64,
    #[serde(default = "default_decimals")]
    pub default_decimals: u8,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MigrationConfig {
    #[serde(default = "default_fee_bps")]
    pub fee_bps: u64,
    #[serde(default = "default_primary_lock_pct")]
    pub primary_lock_pct: u64,
    #[serde(default = "default_secondary_lock_pct")]
    pub secondary_lock_pct: u64,
    #[serde(default = "default_step_attempts")]
    pub step_attempts: u32,
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,
    #[serde(default = "default_pool_poll_attempts")]
    pub pool_poll_attempts: u32,
    #[serde(default = "default_pool_poll_interval_ms")]
    pub pool_poll_interval_ms: u64,
    #[serde(default = "default_completion_confirm_attempts")]
    pub completion_confirm_attempts: u32,
    #[serde(default = "default_completion_confirm_delay_ms")]
    pub completion_confirm_delay_ms: u64,
    #[serde(default)]
    pub resume_failed_on_start: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackfillConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_slot_duration_ms")]
    pub slot_duration_ms: u64,
    #[serde(default = "default_fallback_slot_offset")]
    pub fallback_slot_offset: u64,
    #[serde(default = "default_inter_block_delay_ms")]
    pub inter_block_delay_ms: u64,
    #[serde(default = "default_block_attempts")]
    pub block_attempts: u32,
    #[serde(default = "default_block_retry_delay_ms")]
    pub block_retry_delay_ms: u64,
}

impl BackfillConfig {
    pub fn block_retry_delay(&self) -> Duration {
        Duration::from_millis(self.block_retry_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub interval_ms: u64,
    pub interval_cap: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    pub metadata_capacity: usize,
    pub metadata_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatsConfig {
    pub volume_weight: f64,
    pub holder_weight: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RefreshConfig {
    pub holders_interval_secs: u64,
    pub market_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AmmConfig {
    pub base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    pub hermes_url: String,
    pub feed_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: u8,
    pub password: String,
    pub channel_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LaunchpadConfig {
    pub runtime: RuntimeConfig,
    pub db: DbConfig,
    pub chain: ChainConfig,
    pub curve: CurveConfig,
    pub migration: MigrationConfig,
    pub backfill: BackfillConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub stats: StatsConfig,
    pub refresh: RefreshConfig,
    pub amm: AmmConfig,
    pub oracle: OracleConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

impl LaunchpadConfig {
    pub fn from_env() -> Result<Self> {
        // Load base config from `config/default.(toml|yaml|json)` relative to the
        // workspace root, then override with `LAUNCHPAD__...` environment variables.
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::Environment::with_prefix("LAUNCHPAD").separator("__"))
            .build()?;

        let parsed: Self = settings.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        self.migration.validate()?;
        if self.curve.curve_limit <= self.curve.virtual_reserves {
            bail!(
                "curve.curve_limit ({}) must exceed curve.virtual_reserves ({})",
                self.curve.curve_limit,
                self.curve.virtual_reserves
            );
        }
        if self.queue.concurrency == 0 {
            bail!("queue.concurrency must be at least 1");
        }
        Ok(())
    }
}

impl MigrationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.primary_lock_pct + self.secondary_lock_pct != 100 {
            bail!(
                "lock percentages must sum to 100 (primary {} + secondary {})",
                self.primary_lock_pct,
                self.secondary_lock_pct
            );
        }
        if self.fee_bps > 10_000 {
            bail!("migration.fee_bps ({}) exceeds 10000", self.fee_bps);
        }
        Ok(())
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    pub fn pool_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pool_poll_interval_ms)
    }

    pub fn completion_confirm_delay(&self) -> Duration {
        Duration::from_millis(self.completion_confirm_delay_ms)
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            fee_bps: default_fee_bps(),
            primary_lock_pct: default_primary_lock_pct(),
            secondary_lock_pct: default_secondary_lock_pct(),
            step_attempts: default_step_attempts(),
            step_delay_ms: default_step_delay_ms(),
            pool_poll_attempts: default_pool_poll_attempts(),
            pool_poll_interval_ms: default_pool_poll_interval_ms(),
            completion_confirm_attempts: default_completion_confirm_attempts(),
            completion_confirm_delay_ms: default_completion_confirm_delay_ms(),
            resume_failed_on_start: false,
        }
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slot_duration_ms: default_slot_duration_ms(),
            fallback_slot_offset: default_fallback_slot_offset(),
            inter_block_delay_ms: default_inter_block_delay_ms(),
            block_attempts: default_block_attempts(),
            block_retry_delay_ms: default_block_retry_delay_ms(),
        }
    }
}

fn default_quote_mint() -> String {
    "So11111111111111111111111111111111111111112".to_string()
}

fn default_compute_unit_limit() -> u32 {
    300_000
}

fn default_compute_unit_price() -> u64 {
    50_000
}

fn default_confirm_timeout_ms() -> u64 {
    60_000
}

fn default_decimals() -> u8 {
    6
}

fn default_fee_bps() -> u64 {
    10
}

fn default_primary_lock_pct() -> u64 {
    90
}

fn default_secondary_lock_pct() -> u64 {
    10
}

fn default_step_attempts() -> u32 {
    3
}

fn default_step_delay_ms() -> u64 {
    2_000
}

fn default_pool_poll_attempts() -> u32 {
    12
}

fn default_pool_poll_interval_ms() -> u64 {
    300_000
}

fn default_completion_confirm_attempts() -> u32 {
    15
}

fn default_completion_confirm_delay_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

fn default_slot_duration_ms() -> u64 {
    400
}

fn default_fallback_slot_offset() -> u64 {
    100
}

fn default_inter_block_delay_ms() -> u64 {
    5_000
}

fn default_block_attempts() -> u32 {
    5
}

fn default_block_retry_delay_ms() -> u64 {
    2_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_defaults_match_saga_budget() {
        let cfg = MigrationConfig::default();
        assert_eq!(cfg.step_attempts, 3);
        assert_eq!(cfg.step_delay(), Duration::from_secs(2));
        assert_eq!(cfg.pool_poll_attempts, 12);
        assert_eq!(cfg.pool_poll_interval(), Duration::from_secs(300));
        assert_eq!(cfg.completion_confirm_attempts, 15);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_lock_percentages_must_sum_to_100() {
        let cfg = MigrationConfig {
            primary_lock_pct: 80,
            secondary_lock_pct: 10,
            ..MigrationConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 100"));
    }

    #[test]
    fn test_fee_bps_upper_bound() {
        let cfg = MigrationConfig {
            fee_bps: 10_001,
            ..MigrationConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
