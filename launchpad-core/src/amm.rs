use crate::config::AmmConfig;
use crate::error::PipelineError;
use crate::models::PoolAddresses;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeConfig {
    pub id: String,
    pub index: u32,
    #[serde(default)]
    pub trade_fee_rate: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePoolRequest {
    pub mint_a: String,
    pub mint_b: String,
    pub amount_a: u64,
    pub amount_b: u64,
    pub fee_config: FeeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedPool {
    pub tx_id: String,
    pub pool: PoolAddresses,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolInfo {
    pub id: String,
    pub lp_mint: String,
    pub mint_a: String,
    pub mint_b: String,
    #[serde(default)]
    pub reserve_a: u64,
    #[serde(default)]
    pub reserve_b: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockReceipt {
    pub tx_id: String,
    pub nft_mint: String,
}

/// Operations of the external AMM integration service.
#[async_trait]
pub trait AmmClient: Send + Sync {
    async fn fee_configs(&self) -> Result<Vec<FeeConfig>>;

    /// Fails with [`PipelineError::OutcomeUnknown`] when the request may
    /// have reached the service; only errors raised before that are retryable.
    async fn create_pool(&self, req: &CreatePoolRequest) -> Result<CreatedPool>;

    /// A pool already created by this service for the pair, if any.
    async fn find_pool(&self, mint_a: &str, mint_b: &str) -> Result<Option<CreatedPool>>;

    /// Fails with [`PipelineError::NotYetIndexed`] until the pool is visible.
    async fn pool_info(&self, pool_id: &str) -> Result<PoolInfo>;

    /// LP balance held by the service wallet.
    async fn lp_balance(&self, lp_mint: &str) -> Result<u64>;

    async fn lock_liquidity(&self, pool: &PoolInfo, lp_amount: u64) -> Result<LockReceipt>;
}

pub struct HttpAmmClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct BalanceBody {
    amount: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LockBody<'a> {
    pool_id: &'a str,
    lp_amount: u64,
}

fn upstream(err: reqwest::Error) -> anyhow::Error {
    PipelineError::Upstream(err.to_string()).into()
}

/// Connection failures happen before the request is written; anything
/// later may have been acted on.
fn classify_send(what: &str, err: reqwest::Error) -> anyhow::Error {
    if err.is_connect() {
        upstream(err)
    } else {
        PipelineError::OutcomeUnknown(format!("{what}: {err}")).into()
    }
}

impl HttpAmmClient {
    pub fn new(cfg: &AmmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl AmmClient for HttpAmmClient {
    async fn fee_configs(&self) -> Result<Vec<FeeConfig>> {
        let configs = self
            .client
            .get(self.url("fee-configs"))
            .send()
            .await
            .map_err(upstream)?
            .error_for_status()
            .map_err(upstream)?
            .json()
            .await
            .context("Failed to parse fee configs")?;
        Ok(configs)
    }

    async fn create_pool(&self, req: &CreatePoolRequest) -> Result<CreatedPool> {
        let response = self
            .client
            .post(self.url("pools"))
            .json(req)
            .send()
            .await
            .map_err(|e| classify_send("pool creation", e))?;
        let status = response.status();
        if status.is_client_error() {
            return Err(PipelineError::Upstream(format!("pool creation rejected with {status}")).into());
        }
        if !status.is_success() {
            return Err(PipelineError::OutcomeUnknown(format!("pool creation returned {status}")).into());
        }
        response.json::<CreatedPool>().await.map_err(|e| {
            anyhow::Error::new(PipelineError::OutcomeUnknown(format!(
                "pool creation response unreadable: {e}"
            )))
        })
    }

    async fn find_pool(&self, mint_a: &str, mint_b: &str) -> Result<Option<CreatedPool>> {
        let response = self
            .client
            .get(self.url("pools"))
            .query(&[("mintA", mint_a), ("mintB", mint_b)])
            .send()
            .await
            .map_err(upstream)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let found: Vec<CreatedPool> = response
            .error_for_status()
            .map_err(upstream)?
            .json()
            .await
            .context("Failed to parse pool lookup")?;
        Ok(found.into_iter().next())
    }

    async fn pool_info(&self, pool_id: &str) -> Result<PoolInfo> {
        let response = self
            .client
            .get(self.url(&format!("pools/{pool_id}")))
            .send()
            .await
            .map_err(upstream)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(PipelineError::NotYetIndexed(pool_id.to_string()).into());
        }
        let found: Option<PoolInfo> = response
            .error_for_status()
            .map_err(upstream)?
            .json()
            .await
            .context("Failed to parse pool info")?;
        found.ok_or_else(|| PipelineError::NotYetIndexed(pool_id.to_string()).into())
    }

    async fn lp_balance(&self, lp_mint: &str) -> Result<u64> {
        let body: BalanceBody = self
            .client
            .get(self.url(&format!("wallet/balances/{lp_mint}")))
            .send()
            .await
            .map_err(upstream)?
            .error_for_status()
            .map_err(upstream)?
            .json()
            .await
            .context("Failed to parse LP balance")?;
        Ok(body.amount)
    }

    async fn lock_liquidity(&self, pool: &PoolInfo, lp_amount: u64) -> Result<LockReceipt> {
        let receipt = self
            .client
            .post(self.url("locks"))
            .json(&LockBody {
                pool_id: &pool.id,
                lp_amount,
            })
            .send()
            .await
            .map_err(upstream)?
            .error_for_status()
            .map_err(upstream)?
            .json()
            .await
            .context("Failed to parse lock receipt")?;
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalised() {
        let client = HttpAmmClient::new(&AmmConfig {
            base_url: "http://amm.local/api/".into(),
        })
        .unwrap();
        assert_eq!(client.url("pools/abc"), "http://amm.local/api/pools/abc");
    }

    #[test]
    fn test_pool_info_wire_format() {
        let info: PoolInfo = serde_json::from_str(
            r#"{"id":"P","lpMint":"L","mintA":"A","mintB":"B","reserveA":10}"#,
        )
        .unwrap();
        assert_eq!(info.lp_mint, "L");
        assert_eq!(info.reserve_a, 10);
        assert_eq!(info.reserve_b, 0);
    }

    #[tokio::test]
    async fn test_pool_creation_that_never_connected_is_retryable() {
        let client = HttpAmmClient::new(&AmmConfig {
            base_url: "http://127.0.0.1:9".into(),
        })
        .unwrap();
        let req = CreatePoolRequest {
            mint_a: "A".into(),
            mint_b: "B".into(),
            amount_a: 1,
            amount_b: 1,
            fee_config: FeeConfig {
                id: "f".into(),
                index: 0,
                trade_fee_rate: 0,
            },
        };
        let err = client.create_pool(&req).await.unwrap_err();
        assert!(crate::error::is_retryable(&err));
    }

    #[test]
    fn test_unknown_pool_creation_outcome_is_not_retried() {
        let err = anyhow::Error::new(PipelineError::OutcomeUnknown("pool creation".into()));
        assert!(!crate::error::is_retryable(&err));
    }

    #[tokio::test]
    async fn test_connection_failure_is_transient() {
        let client = HttpAmmClient::new(&AmmConfig {
            base_url: "http://127.0.0.1:9".into(),
        })
        .unwrap();
        let err = client.pool_info("P").await.unwrap_err();
        assert!(crate::error::is_retryable(&err));
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Upstream(_))
        ));
    }
}
