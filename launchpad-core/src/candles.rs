use crate::models::{Candle, Swap};
use crate::pricing::quote_volume;
use crate::store::TokenStore;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};

/// Candle widths, in minutes, the aggregator serves.
pub const SUPPORTED_PERIODS: [u32; 5] = [1, 5, 15, 60, 120];

pub fn validate_period(period_minutes: u32) -> Result<i64> {
    if !SUPPORTED_PERIODS.contains(&period_minutes) {
        bail!("unsupported candle period {period_minutes}m");
    }
    Ok(i64::from(period_minutes) * 60)
}

/// Epoch-aligned start of the window holding `ts`.
pub fn bucket_start(ts: i64, period_secs: i64) -> i64 {
    ts - ts.rem_euclid(period_secs)
}

struct Tick {
    price: f64,
    time: i64,
    volume: f64,
}

impl From<&Swap> for Tick {
    fn from(s: &Swap) -> Self {
        Self {
            price: s.price,
            time: s.timestamp.timestamp(),
            volume: quote_volume(s.direction, s.amount_in, s.amount_out),
        }
    }
}

/// Buckets swaps into OHLCV windows. Empty windows are omitted.
pub fn aggregate(swaps: &[Swap], period_secs: i64) -> Vec<Candle> {
    let mut ticks: Vec<Tick> = swaps.iter().map(Tick::from).collect();
    // Stable sort keeps arrival order for trades within the same second.
    ticks.sort_by_key(|t| t.time);

    let mut out: Vec<Candle> = Vec::new();
    for tick in ticks {
        let time = bucket_start(tick.time, period_secs);
        match out.last_mut() {
            Some(c) if c.time == time => {
                c.high = c.high.max(tick.price);
                c.low = c.low.min(tick.price);
                c.close = tick.price;
                c.volume += tick.volume;
            }
            _ => out.push(Candle {
                open: tick.price,
                high: tick.price,
                low: tick.price,
                close: tick.price,
                volume: tick.volume,
                time,
            }),
        }
    }
    out
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .with_context(|| format!("timestamp {ms}ms out of range"))
}

/// Candles for `mint` over `[start_ms, end_ms]`.
pub async fn get_candles(
    store: &dyn TokenStore,
    mint: &str,
    start_ms: i64,
    end_ms: i64,
    period_minutes: u32,
) -> Result<Vec<Candle>> {
    let period_secs = validate_period(period_minutes)?;
    if end_ms < start_ms {
        return Ok(Vec::new());
    }
    let swaps = store
        .swaps_between(mint, from_millis(start_ms)?, from_millis(end_ms)?)
        .await?;
    Ok(aggregate(&swaps, period_secs))
}

/// The single candle for the window containing `swap.timestamp`.
pub async fn get_latest_candle(
    store: &dyn TokenStore,
    swap: &Swap,
    period_minutes: u32,
) -> Result<Option<Candle>> {
    let period_secs = validate_period(period_minutes)?;
    let start = bucket_start(swap.timestamp.timestamp(), period_secs);
    let window_start = Utc
        .timestamp_opt(start, 0)
        .single()
        .context("candle window start out of range")?;
    let window_end = window_start + chrono::Duration::seconds(period_secs) - chrono::Duration::milliseconds(1);
    let mut swaps = store
        .swaps_between(&swap.token_mint, window_start, window_end)
        .await?;
    if !swaps.iter().any(|s| s.tx_id == swap.tx_id) {
        swaps.push(swap.clone());
    }
    Ok(aggregate(&swaps, period_secs).pop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use crate::store::MemoryStore;

    fn swap(tx: &str, price: f64, secs: i64, lamports: u64) -> Swap {
        Swap {
            token_mint: "M".into(),
            user: "u".into(),
            direction: Direction::Buy,
            amount_in: lamports,
            amount_out: 1_000_000,
            price,
            tx_id: tx.into(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_ohlc_within_one_window() {
        let base = 1_700_000_040;
        let swaps = vec![
            swap("a", 100.0, base, 1_000_000_000),
            swap("b", 105.0, base + 5, 1_000_000_000),
            swap("c", 98.0, base + 10, 1_000_000_000),
            swap("d", 102.0, base + 15, 1_000_000_000),
        ];
        let candles = aggregate(&swaps, 60);
        assert_eq!(candles.len(), 1);
        let c = candles[0];
        assert_eq!((c.open, c.high, c.low, c.close), (100.0, 105.0, 98.0, 102.0));
        assert_eq!(c.volume, 4.0);
        assert_eq!(c.time, 1_700_000_040 - 1_700_000_040 % 60);
    }

    #[test]
    fn test_out_of_order_input_and_gaps() {
        let swaps = vec![
            swap("late", 3.0, 600, 0),
            swap("early", 1.0, 0, 0),
            swap("mid", 2.0, 30, 0),
        ];
        let candles = aggregate(&swaps, 60);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open, 1.0);
        assert_eq!(candles[0].close, 2.0);
        assert_eq!(candles[1].time, 600);
    }

    #[test]
    fn test_rejects_unknown_period() {
        assert!(validate_period(7).is_err());
        assert_eq!(validate_period(120).unwrap(), 7200);
    }

    #[tokio::test]
    async fn test_latest_candle_covers_only_its_window() {
        let store = MemoryStore::new();
        for s in [
            swap("prev", 50.0, 3_540, 0),
            swap("a", 10.0, 3_600, 0),
            swap("b", 12.0, 3_620, 0),
        ] {
            store.insert_swap(&s).await.unwrap();
        }
        let latest = swap("c", 11.0, 3_650, 0);
        store.insert_swap(&latest).await.unwrap();
        let c = get_latest_candle(&store, &latest, 1).await.unwrap().unwrap();
        assert_eq!((c.open, c.high, c.low, c.close), (10.0, 12.0, 10.0, 11.0));
        assert_eq!(c.time, 3_600);
    }

    #[tokio::test]
    async fn test_get_candles_range() {
        let store = MemoryStore::new();
        store.insert_swap(&swap("a", 1.0, 100, 0)).await.unwrap();
        store.insert_swap(&swap("b", 2.0, 400, 0)).await.unwrap();
        let candles = get_candles(&store, "M", 0, 200_000, 5).await.unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 1.0);
        assert!(get_candles(&store, "M", 10, 0, 5).await.unwrap().is_empty());
    }
}
