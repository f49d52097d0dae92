use crate::config::OracleConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// USD price of the quote asset. Implementations return `0.0` on any
/// failure; callers treat that as a degraded reading.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn quote_usd_price(&self) -> f64;
}

#[derive(Debug, Deserialize)]
struct HermesResponse {
    parsed: Vec<HermesParsed>,
}

#[derive(Debug, Deserialize)]
struct HermesParsed {
    price: HermesPrice,
}

#[derive(Debug, Deserialize)]
struct HermesPrice {
    price: String,
    expo: i32,
}

/// Pyth Hermes `price/latest` client.
pub struct PythOracle {
    client: reqwest::Client,
    url: String,
    feed_id: String,
}

impl PythOracle {
    pub fn new(cfg: &OracleConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            url: cfg.hermes_url.clone(),
            feed_id: cfg.feed_id.clone(),
        })
    }

    async fn fetch_price(&self) -> Result<f64> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("ids[]", self.feed_id.as_str())])
            .send()
            .await
            .context("Failed to send request to Pyth API")?
            .error_for_status()?;

        let body: HermesResponse = response
            .json()
            .await
            .context("Failed to parse Pyth response")?;
        parse_hermes(body)
    }
}

fn parse_hermes(body: HermesResponse) -> Result<f64> {
    let parsed = body.parsed.first().context("No price data in response")?;
    let raw: i64 = parsed
        .price
        .price
        .parse()
        .context("Failed to parse price string")?;
    Ok(raw as f64 * 10f64.powi(parsed.price.expo))
}

#[async_trait]
impl PriceOracle for PythOracle {
    async fn quote_usd_price(&self) -> f64 {
        match self.fetch_price().await {
            Ok(price) if price.is_finite() && price > 0.0 => price,
            Ok(price) => {
                warn!(price, "oracle returned unusable price");
                0.0
            }
            Err(err) => {
                warn!("oracle price fetch failed: {err:#}");
                0.0
            }
        }
    }
}

/// Constant price, for tests and dry runs.
pub struct FixedPrice(pub f64);

#[async_trait]
impl PriceOracle for FixedPrice {
    async fn quote_usd_price(&self) -> f64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hermes_applies_exponent() {
        let body: HermesResponse = serde_json::from_str(
            r#"{"binary":{},"parsed":[{"id":"ef0d","price":{"price":"14523000000","conf":"1000","expo":-8,"publish_time":1700000000}}]}"#,
        )
        .unwrap();
        let price = parse_hermes(body).unwrap();
        assert!((price - 145.23).abs() < 1e-9);
    }

    #[test]
    fn test_parse_hermes_empty_is_error() {
        let body: HermesResponse = serde_json::from_str(r#"{"parsed":[]}"#).unwrap();
        assert!(parse_hermes(body).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_oracle_degrades_to_zero() {
        let oracle = PythOracle::new(&OracleConfig {
            hermes_url: "http://127.0.0.1:9/v2/updates/price/latest".into(),
            feed_id: "0xef0d".into(),
        })
        .unwrap();
        assert_eq!(oracle.quote_usd_price().await, 0.0);
    }
}
