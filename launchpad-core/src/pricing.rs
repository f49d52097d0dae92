use crate::error::PipelineError;
use crate::models::Direction;

pub const LAMPORTS_PER_SOL: f64 = 1e9;

fn scale(decimals: u8) -> f64 {
    10f64.powi(decimals as i32)
}

/// Execution price of a single trade, in SOL per whole token.
pub fn trade_price(direction: Direction, amount_in: u64, amount_out: u64, decimals: u8) -> f64 {
    let (lamports, raw_tokens) = match direction {
        Direction::Buy => (amount_in, amount_out),
        Direction::Sell => (amount_out, amount_in),
    };
    if raw_tokens == 0 {
        return 0.0;
    }
    (lamports as f64 / LAMPORTS_PER_SOL) / (raw_tokens as f64 / scale(decimals))
}

/// Spot price implied by curve reserves, in SOL per whole token.
pub fn current_price(reserve_lamport: u64, reserve_token: u64, decimals: u8) -> f64 {
    if reserve_token == 0 {
        return 0.0;
    }
    (reserve_lamport as f64 / LAMPORTS_PER_SOL) / (reserve_token as f64 / scale(decimals))
}

pub fn token_price_usd(current_price: f64, sol_price_usd: f64) -> f64 {
    if current_price <= 0.0 {
        return 0.0;
    }
    current_price * sol_price_usd
}

pub fn market_cap_usd(total_supply: u64, decimals: u8, token_price_usd: f64) -> f64 {
    total_supply as f64 / scale(decimals) * token_price_usd
}

pub fn liquidity_usd(
    reserve_lamport: u64,
    reserve_token: u64,
    decimals: u8,
    sol_price_usd: f64,
    token_price_usd: f64,
) -> f64 {
    reserve_lamport as f64 / LAMPORTS_PER_SOL * sol_price_usd
        + reserve_token as f64 / scale(decimals) * token_price_usd
}

/// Percentage of the funding target reached, clamped to `[0, 100]`.
pub fn curve_progress(reserve_lamport: u64, virtual_reserves: u64, curve_limit: u64) -> f64 {
    if curve_limit <= virtual_reserves {
        return 0.0;
    }
    let raw = 100.0 * (reserve_lamport as f64 - virtual_reserves as f64)
        / (curve_limit as f64 - virtual_reserves as f64);
    raw.clamp(0.0, 100.0)
}

/// USD value of the token leg of a trade.
pub fn trade_volume_usd(
    direction: Direction,
    amount_in: u64,
    amount_out: u64,
    decimals: u8,
    token_price_usd: f64,
) -> f64 {
    let raw_tokens = match direction {
        Direction::Buy => amount_out,
        Direction::Sell => amount_in,
    };
    raw_tokens as f64 / scale(decimals) * token_price_usd
}

/// Volume in quote units (SOL) for candle aggregation.
pub fn quote_volume(direction: Direction, amount_in: u64, amount_out: u64) -> f64 {
    match direction {
        Direction::Buy => amount_in as f64 / LAMPORTS_PER_SOL,
        Direction::Sell => amount_out as f64 / LAMPORTS_PER_SOL,
    }
}

pub fn price_change_pct(current: f64, reference: f64) -> f64 {
    if reference == 0.0 {
        return 0.0;
    }
    (current - reference) / reference * 100.0
}

/// `amount * bps / 10000`, floored. Returns `(fee, remaining)`.
pub fn split_fee(amount: u64, fee_bps: u64) -> (u64, u64) {
    let fee = (amount as u128 * fee_bps as u128 / 10_000) as u64;
    (fee, amount - fee)
}

/// Splits an LP balance into primary/secondary tranches. The secondary
/// tranche takes the rounding remainder so the two always sum to `total`.
pub fn lock_split(total: u64, primary_pct: u64, secondary_pct: u64) -> Result<(u64, u64), PipelineError> {
    if primary_pct + secondary_pct != 100 {
        return Err(PipelineError::LockSplit {
            primary: primary_pct,
            secondary: secondary_pct,
        });
    }
    let primary = (total as u128 * primary_pct as u128 / 100) as u64;
    Ok((primary, total - primary))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_buy_price_concrete_case() {
        let p = trade_price(Direction::Buy, 5_000_000, 1_000_000_000, 6);
        assert!(approx(p, 0.005), "got {p}");
    }

    #[test]
    fn test_sell_price_uses_amount_out_as_lamports() {
        let p = trade_price(Direction::Sell, 1_000_000_000, 5_000_000, 6);
        assert!(approx(p, 0.005), "got {p}");
        assert_eq!(trade_price(Direction::Sell, 0, 5_000_000, 6), 0.0);
    }

    #[test]
    fn test_curve_progress_bounds_and_monotonic() {
        let (v, l) = (30_000_000_000, 85_000_000_000);
        assert_eq!(curve_progress(v, v, l), 0.0);
        assert_eq!(curve_progress(l, v, l), 100.0);
        let mut last = -1.0;
        for r in (v..=l).step_by(5_000_000_000) {
            let p = curve_progress(r, v, l);
            assert!(p > last);
            last = p;
        }
        assert_eq!(curve_progress(v - 1, v, l), 0.0);
        assert_eq!(curve_progress(l + 1, v, l), 100.0);
    }

    #[test]
    fn test_market_fields() {
        // 30 SOL against 1e9 whole tokens.
        let price = current_price(30_000_000_000, 1_000_000_000_000_000, 6);
        assert!(approx(price, 3e-8));
        let usd = token_price_usd(price, 150.0);
        assert!(approx(usd, 4.5e-6));
        assert!((market_cap_usd(1_000_000_000_000_000, 6, usd) - 4500.0).abs() < 1e-6);
        let liq = liquidity_usd(30_000_000_000, 1_000_000_000_000_000, 6, 150.0, usd);
        assert!((liq - 9000.0).abs() < 1e-6);
    }

    #[test]
    fn test_fee_split() {
        assert_eq!(split_fee(85_000_000_000, 10), (85_000_000, 84_915_000_000));
        assert_eq!(split_fee(999, 10), (0, 999));
    }

    #[test]
    fn test_lock_split_sums_to_total() {
        for total in [0u64, 1, 2, 3, 7, 10, 99, 101, u64::MAX] {
            let (a, b) = lock_split(total, 90, 10).unwrap();
            assert_eq!(a + b, total, "total {total}");
        }
        assert_eq!(lock_split(1, 90, 10).unwrap(), (0, 1));
        assert_eq!(lock_split(3, 90, 10).unwrap(), (2, 1));
        assert_eq!(lock_split(10, 90, 10).unwrap(), (9, 1));
    }

    #[test]
    fn test_lock_split_rejects_bad_percentages() {
        assert!(matches!(
            lock_split(100, 90, 20),
            Err(PipelineError::LockSplit { primary: 90, secondary: 20 })
        ));
    }
}
