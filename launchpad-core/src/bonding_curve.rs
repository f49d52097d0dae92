use crate::models::BondingCurveAccount;
use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;

pub const SEED_CONFIG: &[u8] = b"config";
pub const SEED_BONDING_CURVE: &[u8] = b"bonding_curve";
pub const SEED_GLOBAL: &[u8] = b"global";

pub const TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
pub const ASSOCIATED_TOKEN_PROGRAM_ID: &str = "ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL";

fn anchor_hash(preimage: &str) -> [u8; 8] {
    let hash = Sha256::digest(preimage.as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash[..8]);
    out
}

/// Instruction discriminator: first 8 bytes of `sha256("global:<name>")`.
pub fn instruction_discriminator(ix_name: &str) -> [u8; 8] {
    anchor_hash(&format!("global:{ix_name}"))
}

/// Account discriminator: first 8 bytes of `sha256("account:<Type>")`.
pub fn account_discriminator(type_name: &str) -> [u8; 8] {
    anchor_hash(&format!("account:{type_name}"))
}

fn read_u64_le(bytes: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(arr))
}

fn read_i64_le(bytes: &[u8]) -> Option<i64> {
    let arr: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(i64::from_le_bytes(arr))
}

fn read_pubkey(bytes: &[u8]) -> Option<Pubkey> {
    let arr: [u8; 32] = bytes.get(..32)?.try_into().ok()?;
    Some(Pubkey::new_from_array(arr))
}

pub fn config_pda(program_id: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[SEED_CONFIG], program_id).0
}

pub fn global_vault_pda(program_id: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[SEED_GLOBAL], program_id).0
}

pub fn bonding_curve_pda(program_id: &Pubkey, mint: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[SEED_BONDING_CURVE, mint.as_ref()], program_id).0
}

pub fn associated_token_address(owner: &Pubkey, mint: &Pubkey, token_program: &Pubkey, ata_program: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[owner.as_ref(), token_program.as_ref(), mint.as_ref()],
        ata_program,
    )
    .0
}

/// Decodes the anchor `BondingCurve` account:
/// discriminator(8) | token_mint(32) | creator(32) | created_time(i64) |
/// init_bonding_curve(f64) | init_lamport | reserve_lamport | reserve_token |
/// max_buy | max_sell | curve_limit (u64 each) | is_completed(bool).
pub fn decode_bonding_curve(data: &[u8]) -> Option<BondingCurveAccount> {
    if data.get(..8)? != account_discriminator("BondingCurve") {
        return None;
    }
    let mut off = 8;
    let token_mint = read_pubkey(data.get(off..)?)?;
    off += 32;
    let creator = read_pubkey(data.get(off..)?)?;
    off += 32;
    let created_time = read_i64_le(data.get(off..)?)?;
    off += 8;
    let init_bonding_curve = f64::from_bits(read_u64_le(data.get(off..)?)?);
    off += 8;

    let mut next_u64 = || {
        let v = read_u64_le(data.get(off..)?);
        off += 8;
        v
    };
    let init_lamport = next_u64()?;
    let reserve_lamport = next_u64()?;
    let reserve_token = next_u64()?;
    let max_buy = next_u64()?;
    let max_sell = next_u64()?;
    let curve_limit = next_u64()?;
    let is_completed = *data.get(off)? != 0;

    Some(BondingCurveAccount {
        token_mint: token_mint.to_string(),
        creator: creator.to_string(),
        created_time,
        init_bonding_curve,
        init_lamport,
        reserve_lamport,
        reserve_token,
        max_buy,
        max_sell,
        curve_limit,
        is_completed,
    })
}

/// SPL mint account: decimals live at byte 44.
pub fn decode_mint_decimals(data: &[u8]) -> Option<u8> {
    data.get(44).copied()
}

#[cfg(test)]
pub(crate) fn encode_bonding_curve(acc: &BondingCurveAccount) -> Vec<u8> {
    use std::str::FromStr;
    let mut out = account_discriminator("BondingCurve").to_vec();
    out.extend_from_slice(Pubkey::from_str(&acc.token_mint).unwrap().as_ref());
    out.extend_from_slice(Pubkey::from_str(&acc.creator).unwrap().as_ref());
    out.extend_from_slice(&acc.created_time.to_le_bytes());
    out.extend_from_slice(&acc.init_bonding_curve.to_bits().to_le_bytes());
    for v in [
        acc.init_lamport,
        acc.reserve_lamport,
        acc.reserve_token,
        acc.max_buy,
        acc.max_sell,
        acc.curve_limit,
    ] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.push(acc.is_completed as u8);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BondingCurveAccount {
        BondingCurveAccount {
            token_mint: Pubkey::new_unique().to_string(),
            creator: Pubkey::new_unique().to_string(),
            created_time: 1_700_000_000,
            init_bonding_curve: 80.0,
            init_lamport: 30_000_000_000,
            reserve_lamport: 84_000_000_000,
            reserve_token: 200_000_000_000_000,
            max_buy: 0,
            max_sell: 0,
            curve_limit: 85_000_000_000,
            is_completed: true,
        }
    }

    #[test]
    fn test_discriminators_are_distinct_and_stable() {
        assert_eq!(instruction_discriminator("withdraw"), instruction_discriminator("withdraw"));
        assert_ne!(instruction_discriminator("withdraw"), instruction_discriminator("swap"));
        assert_ne!(instruction_discriminator("withdraw"), account_discriminator("withdraw"));
    }

    #[test]
    fn test_decode_bonding_curve_layout() {
        let acc = sample();
        let data = encode_bonding_curve(&acc);
        assert_eq!(data.len(), 8 + 32 + 32 + 8 + 8 + 6 * 8 + 1);
        assert_eq!(decode_bonding_curve(&data), Some(acc));
    }

    #[test]
    fn test_decode_rejects_truncated_or_foreign_accounts() {
        let data = encode_bonding_curve(&sample());
        assert_eq!(decode_bonding_curve(&data[..data.len() - 1]), None);
        let mut foreign = data.clone();
        foreign[0] ^= 0xff;
        assert_eq!(decode_bonding_curve(&foreign), None);
        assert_eq!(decode_bonding_curve(&[]), None);
    }

    #[test]
    fn test_pdas_depend_on_mint() {
        let program = Pubkey::new_unique();
        let a = bonding_curve_pda(&program, &Pubkey::new_unique());
        let b = bonding_curve_pda(&program, &Pubkey::new_unique());
        assert_ne!(a, b);
        assert_ne!(config_pda(&program), global_vault_pda(&program));
    }

    #[test]
    fn test_mint_decimals_offset() {
        let mut data = vec![0u8; 82];
        data[44] = 6;
        assert_eq!(decode_mint_decimals(&data), Some(6));
        assert_eq!(decode_mint_decimals(&data[..10]), None);
    }
}
