use crate::models::Direction;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;

const MINT_PREFIX: &str = "Mint:";
const SWAP_PREFIX: &str = "Swap:";
const RESERVES_PREFIX: &str = "Reserves:";
const FEE_PREFIX: &str = "fee:";
const SWAP_EVENT_PREFIX: &str = "SwapEvent:";
const NEW_TOKEN_PREFIX: &str = "NewToken:";
const COMPLETED_MARKER: &str = "curve is completed";
const SUCCESS_MARKER: &str = "success";

/// One transaction's worth of program logs, as delivered by the live
/// subscription or recovered from a block during backfill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogBundle {
    pub slot: u64,
    pub signature: String,
    pub logs: Vec<String>,
    /// Transaction error, if the transaction failed.
    pub err: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTokenEvent {
    pub mint: String,
    pub creator: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapEvent {
    pub mint: String,
    pub user: String,
    pub direction: Direction,
    pub amount_in: u64,
    pub amount_out: u64,
    pub reserve_token: u64,
    pub reserve_lamport: u64,
    pub fee: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurveCompletedEvent {
    pub mint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEvent {
    NewToken(NewTokenEvent),
    Swap(SwapEvent),
    CurveCompleted(CurveCompletedEvent),
}

impl ParsedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ParsedEvent::NewToken(_) => "new_token",
            ParsedEvent::Swap(_) => "swap",
            ParsedEvent::CurveCompleted(_) => "curve_completed",
        }
    }

    pub fn mint(&self) -> &str {
        match self {
            ParsedEvent::NewToken(e) => &e.mint,
            ParsedEvent::Swap(e) => &e.mint,
            ParsedEvent::CurveCompleted(e) => &e.mint,
        }
    }
}

/// Turns a bundle into typed events. Pure: no I/O, no clock.
///
/// Each event kind is extracted independently, so a malformed `Swap:` line
/// drops only the swap while a `NewToken:` line in the same bundle still
/// produces its event.
pub fn parse_bundle(bundle: &LogBundle) -> Vec<ParsedEvent> {
    if bundle.err.is_some() {
        return Vec::new();
    }
    let logs = &bundle.logs;
    let mut events = Vec::new();

    if let Some(ev) = find_log(logs, NEW_TOKEN_PREFIX).and_then(parse_new_token) {
        events.push(ParsedEvent::NewToken(ev));
    }

    if logs.iter().any(|l| l.contains(SUCCESS_MARKER)) {
        if let Some(ev) = parse_swap(logs) {
            events.push(ParsedEvent::Swap(ev));
        }
    }

    if find_log(logs, COMPLETED_MARKER).is_some() {
        if let Some(mint) = find_log(logs, MINT_PREFIX).and_then(parse_mint_line) {
            events.push(ParsedEvent::CurveCompleted(CurveCompletedEvent { mint }));
        }
    }

    events
}

/// The all-`1` signature some RPC nodes emit for simulated transactions.
pub fn is_placeholder_signature(signature: &str) -> bool {
    signature.len() == 64 && signature.bytes().all(|b| b == b'1')
}

fn find_log<'a>(logs: &'a [String], keyword: &str) -> Option<&'a str> {
    logs.iter().find(|l| l.contains(keyword)).map(String::as_str)
}

fn clean(token: &str) -> &str {
    token.trim_matches(|c| matches!(c, '"' | ',' | '(' | ')'))
}

fn after<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    line.split_once(keyword).map(|(_, rest)| rest.trim())
}

/// Last `n` whitespace-separated tokens of `payload`, cleaned.
fn tail_tokens(payload: &str, n: usize) -> Option<Vec<&str>> {
    let parts: Vec<&str> = payload
        .split_whitespace()
        .map(clean)
        .filter(|s| !s.is_empty())
        .collect();
    if parts.len() < n {
        return None;
    }
    Some(parts[parts.len() - n..].to_vec())
}

fn valid_address(raw: &str) -> Option<String> {
    Pubkey::from_str(raw).ok().map(|_| raw.to_string())
}

fn parse_u64(raw: &str) -> Option<u64> {
    raw.parse::<u64>().ok()
}

fn parse_mint_line(line: &str) -> Option<String> {
    let payload = after(line, MINT_PREFIX)?;
    let raw = payload.split_whitespace().next().map(clean)?;
    valid_address(raw)
}

fn parse_new_token(line: &str) -> Option<NewTokenEvent> {
    let payload = after(line, NEW_TOKEN_PREFIX)?;
    let parts = tail_tokens(payload, 2)?;
    Some(NewTokenEvent {
        mint: valid_address(parts[0])?,
        creator: valid_address(parts[1])?,
    })
}

/// Drops a trailing human annotation such as `(Amount to Swap)`. A trailing
/// parenthesised group with commas is treated as payload, not annotation.
fn strip_annotation(payload: &str) -> &str {
    let trimmed = payload.trim_end();
    if !trimmed.ends_with(')') {
        return trimmed;
    }
    match trimmed.rfind('(') {
        Some(open) => {
            let inner = &trimmed[open + 1..trimmed.len() - 1];
            if inner.contains(char::is_whitespace) && !inner.contains(',') {
                trimmed[..open].trim_end()
            } else {
                trimmed
            }
        }
        None => trimmed,
    }
}

fn parse_swap(logs: &[String]) -> Option<SwapEvent> {
    let mint = parse_mint_line(find_log(logs, MINT_PREFIX)?)?;

    // `SwapEvent:` also contains `Swap:`; pick the first line that is not it.
    let swap_line = logs
        .iter()
        .find(|l| l.contains(SWAP_PREFIX) && !l.contains(SWAP_EVENT_PREFIX))?;
    let swap_payload = strip_annotation(after(swap_line, SWAP_PREFIX)?);
    let swap = tail_tokens(swap_payload, 3)?;
    let user = valid_address(swap[0])?;
    let direction = Direction::from_wire(swap[1])?;
    let amount_in = parse_u64(swap[2])?;

    let reserves = tail_tokens(after(find_log(logs, RESERVES_PREFIX)?, RESERVES_PREFIX)?, 2)?;
    let reserve_token = parse_u64(reserves[0])?;
    let reserve_lamport = parse_u64(reserves[1])?;

    let fee_line = find_log(logs, FEE_PREFIX)?;
    let fee = parse_u64(after(fee_line, FEE_PREFIX)?.split_whitespace().next().map(clean)?)?;

    let event = tail_tokens(after(find_log(logs, SWAP_EVENT_PREFIX)?, SWAP_EVENT_PREFIX)?, 3)?;
    let amount_out = parse_u64(event[2])?;

    Some(SwapEvent {
        mint,
        user,
        direction,
        amount_in,
        amount_out,
        reserve_token,
        reserve_lamport,
        fee,
    })
}

/// Amounts reported by the program's withdraw instruction.
pub fn parse_withdraw_logs(logs: &[String]) -> (u64, u64) {
    let mut lamports = 0;
    let mut tokens = 0;
    for line in logs {
        if let Some(v) = after(line, "withdraw lamports:").and_then(parse_first_u64) {
            lamports = v;
        }
        if let Some(v) = after(line, "withdraw token:").and_then(parse_first_u64) {
            tokens = v;
        }
    }
    (lamports, tokens)
}

fn parse_first_u64(payload: &str) -> Option<u64> {
    payload.split_whitespace().next().map(clean).and_then(parse_u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINT: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";
    const USER: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";

    fn bundle(logs: &[&str]) -> LogBundle {
        LogBundle {
            slot: 42,
            signature: "sig".to_string(),
            logs: logs.iter().map(|s| s.to_string()).collect(),
            err: None,
        }
    }

    fn swap_logs() -> Vec<String> {
        vec![
            "Program 6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P invoke [1]".to_string(),
            format!("Program log: Mint: {MINT}"),
            format!("Program log: Swap: {USER} 0 5000000"),
            "Program log: Reserves: 1072999999000000 30005000000".to_string(),
            "Program log: fee: 50000".to_string(),
            format!("Program log: SwapEvent: {USER} 0 1000000000"),
            "Program 6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P success".to_string(),
        ]
    }

    #[test]
    fn test_parse_full_swap() {
        let b = LogBundle {
            logs: swap_logs(),
            ..bundle(&[])
        };
        let events = parse_bundle(&b);
        assert_eq!(
            events,
            vec![ParsedEvent::Swap(SwapEvent {
                mint: MINT.to_string(),
                user: USER.to_string(),
                direction: Direction::Buy,
                amount_in: 5_000_000,
                amount_out: 1_000_000_000,
                reserve_token: 1_072_999_999_000_000,
                reserve_lamport: 30_005_000_000,
                fee: 50_000,
            })]
        );
    }

    #[test]
    fn test_failed_transaction_yields_nothing() {
        let b = LogBundle {
            logs: swap_logs(),
            err: Some("InstructionError".to_string()),
            ..bundle(&[])
        };
        assert!(parse_bundle(&b).is_empty());
    }

    #[test]
    fn test_swap_requires_success_marker() {
        let mut logs = swap_logs();
        logs.pop();
        let b = LogBundle {
            logs,
            ..bundle(&[])
        };
        assert!(parse_bundle(&b).is_empty());
    }

    #[test]
    fn test_swap_missing_reserves_is_skipped() {
        let logs: Vec<String> = swap_logs()
            .into_iter()
            .filter(|l| !l.contains("Reserves:"))
            .collect();
        let b = LogBundle {
            logs,
            ..bundle(&[])
        };
        assert!(parse_bundle(&b).is_empty());
    }

    #[test]
    fn test_swap_annotation_and_quotes_are_stripped() {
        let mut logs = swap_logs();
        logs[2] = format!("Program log: Swap: \"{USER}\", 1, 250000000 (Amount to Swap)");
        let b = LogBundle {
            logs,
            ..bundle(&[])
        };
        match parse_bundle(&b).as_slice() {
            [ParsedEvent::Swap(s)] => {
                assert_eq!(s.user, USER);
                assert_eq!(s.direction, Direction::Sell);
                assert_eq!(s.amount_in, 250_000_000);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_bad_direction_skips_swap_only() {
        let mut logs = swap_logs();
        logs[2] = format!("Program log: Swap: {USER} 7 5000000");
        logs.push(format!("Program log: NewToken: {MINT} {USER}"));
        let b = LogBundle {
            logs,
            ..bundle(&[])
        };
        let events = parse_bundle(&b);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "new_token");
    }

    #[test]
    fn test_new_token_positional_fields() {
        let b = bundle(&[&format!("Program log: NewToken: \"{MINT}\", \"{USER}\")")]);
        assert_eq!(
            parse_bundle(&b),
            vec![ParsedEvent::NewToken(NewTokenEvent {
                mint: MINT.to_string(),
                creator: USER.to_string(),
            })]
        );
    }

    #[test]
    fn test_new_token_rejects_non_base58() {
        let b = bundle(&["Program log: NewToken: not-a-key 0OIl"]);
        assert!(parse_bundle(&b).is_empty());
    }

    #[test]
    fn test_curve_completed_needs_mint_line() {
        let only_marker = bundle(&["Program log: curve is completed"]);
        assert!(parse_bundle(&only_marker).is_empty());

        let with_mint = bundle(&[
            &format!("Program log: Mint: {MINT}"),
            "Program log: curve is completed",
        ]);
        assert_eq!(
            parse_bundle(&with_mint),
            vec![ParsedEvent::CurveCompleted(CurveCompletedEvent {
                mint: MINT.to_string()
            })]
        );
    }

    #[test]
    fn test_unrelated_lines_are_ignored() {
        let b = bundle(&["Program log: Instruction: Transfer", "Program consumed 3000 units"]);
        assert!(parse_bundle(&b).is_empty());
    }

    #[test]
    fn test_placeholder_signature() {
        assert!(is_placeholder_signature(&"1".repeat(64)));
        assert!(!is_placeholder_signature(&"1".repeat(63)));
        assert!(!is_placeholder_signature("5h6x"));
    }

    #[test]
    fn test_withdraw_amounts() {
        let logs = vec![
            "Program log: Instruction: Withdraw".to_string(),
            "Program log: withdraw lamports: 85000000000".to_string(),
            "Program log: withdraw token: 206900000000000".to_string(),
        ];
        assert_eq!(parse_withdraw_logs(&logs), (85_000_000_000, 206_900_000_000_000));
        assert_eq!(parse_withdraw_logs(&[]), (0, 0));
    }
}
