use crate::bonding_curve::{
    associated_token_address, bonding_curve_pda, config_pda, decode_bonding_curve,
    decode_mint_decimals, global_vault_pda, instruction_discriminator,
    ASSOCIATED_TOKEN_PROGRAM_ID, TOKEN_PROGRAM_ID,
};
use crate::config::ChainConfig;
use crate::error::PipelineError;
use crate::log_parser::LogBundle;
use crate::models::BondingCurveAccount;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{
    RpcAccountInfoConfig, RpcBlockConfig, RpcProgramAccountsConfig, RpcTransactionConfig,
    RpcTransactionLogsConfig, RpcTransactionLogsFilter,
};
use solana_client::rpc_filter::{Memcmp, RpcFilterType};
use solana_client::rpc_request::RpcError;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{read_keypair_file, Keypair, Signature, Signer};
use solana_sdk::system_program;
use solana_sdk::transaction::Transaction;
use solana_transaction_status::{
    option_serializer::OptionSerializer, TransactionDetails, UiTransactionEncoding,
};
use solana_account_decoder::{UiAccountEncoding, UiDataSliceConfig};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Result of submitting a transaction and waiting for confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedTx {
    pub signature: String,
    /// Confirmation error as reported by the cluster, if any.
    pub err: Option<String>,
    pub logs: Vec<String>,
}

/// Chain access needed by the pipeline and the migration saga.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn finalized_slot(&self) -> Result<u64>;

    async fn confirmed_slot(&self) -> Result<u64>;

    /// `None` for skipped or pruned slots.
    async fn block_time(&self, slot: u64) -> Result<Option<DateTime<Utc>>>;

    /// Bundles for every transaction in `slot` whose logs mention the program.
    async fn block_bundles(&self, slot: u64) -> Result<Vec<LogBundle>>;

    async fn bonding_curve(&self, mint: &str) -> Result<Option<BondingCurveAccount>>;

    async fn mint_decimals(&self, mint: &str) -> Result<u8>;

    /// Token accounts for `mint` with a non-zero balance.
    async fn holder_count(&self, mint: &str) -> Result<u64>;

    /// Sends the program's withdraw instruction for `mint` and waits for
    /// confirmation. A confirmation error is returned in `SubmittedTx::err`,
    /// not as `Err`.
    async fn send_withdraw(&self, mint: &str) -> Result<SubmittedTx>;

    /// Log messages of the confirmed transaction, if the node knows it.
    async fn transaction_logs(&self, signature: &str) -> Result<Option<Vec<String>>>;

    /// Log messages once the transaction is finalized. `None` when it does
    /// not finalize within the confirmation timeout.
    async fn finalized_transaction_logs(&self, signature: &str) -> Result<Option<Vec<String>>>;

    /// Streams program log notifications into `tx` until the subscription
    /// ends or errors.
    async fn stream_logs(&self, tx: mpsc::Sender<LogBundle>) -> Result<()>;

    fn program_id(&self) -> String;
}

pub struct SolanaChain {
    rpc: Arc<RpcClient>,
    ws_url: String,
    program_id: Pubkey,
    payer: Arc<Keypair>,
    compute_unit_limit: u32,
    compute_unit_price: u64,
    confirm_timeout: Duration,
    token_program: Pubkey,
    ata_program: Pubkey,
}

fn parse_pubkey(raw: &str, what: &str) -> Result<Pubkey> {
    Pubkey::from_str(raw).with_context(|| format!("invalid {what} pubkey {raw:?}"))
}

fn upstream<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> anyhow::Error {
    move |e| anyhow::Error::new(PipelineError::Upstream(format!("{what}: {e}")))
}

const SLOT_SKIPPED: i64 = -32007;
const LONG_TERM_STORAGE_SLOT_SKIPPED: i64 = -32009;

/// The node reports the slot as skipped, so there is no block to read.
fn is_skipped_slot(err: &ClientError) -> bool {
    matches!(
        err.kind(),
        ClientErrorKind::RpcError(RpcError::RpcResponseError { code, .. })
            if *code == SLOT_SKIPPED || *code == LONG_TERM_STORAGE_SLOT_SKIPPED
    )
}

fn transaction_config(commitment: CommitmentConfig) -> RpcTransactionConfig {
    RpcTransactionConfig {
        encoding: Some(UiTransactionEncoding::Json),
        commitment: Some(commitment),
        max_supported_transaction_version: Some(0),
    }
}

impl SolanaChain {
    pub fn new(cfg: &ChainConfig) -> Result<Self> {
        let payer = read_keypair_file(&cfg.keypair_path)
            .map_err(|e| anyhow!("failed to read keypair {}: {e}", cfg.keypair_path))?;
        Ok(Self {
            rpc: Arc::new(RpcClient::new_with_commitment(
                cfg.rpc_url.clone(),
                CommitmentConfig::confirmed(),
            )),
            ws_url: cfg.ws_url.clone(),
            program_id: parse_pubkey(&cfg.program_id, "program")?,
            payer: Arc::new(payer),
            compute_unit_limit: cfg.compute_unit_limit,
            compute_unit_price: cfg.compute_unit_price_micro_lamports,
            confirm_timeout: Duration::from_millis(cfg.confirm_timeout_ms),
            token_program: parse_pubkey(TOKEN_PROGRAM_ID, "token program")?,
            ata_program: parse_pubkey(ASSOCIATED_TOKEN_PROGRAM_ID, "ata program")?,
        })
    }

    pub fn payer(&self) -> Pubkey {
        self.payer.pubkey()
    }

    fn withdraw_instruction(&self, mint: &Pubkey) -> Instruction {
        let admin = self.payer.pubkey();
        let global_vault = global_vault_pda(&self.program_id);
        let accounts = vec![
            AccountMeta::new(admin, true),
            AccountMeta::new_readonly(config_pda(&self.program_id), false),
            AccountMeta::new(global_vault, false),
            AccountMeta::new(bonding_curve_pda(&self.program_id, mint), false),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new(
                associated_token_address(&global_vault, mint, &self.token_program, &self.ata_program),
                false,
            ),
            AccountMeta::new(
                associated_token_address(&admin, mint, &self.token_program, &self.ata_program),
                false,
            ),
            AccountMeta::new_readonly(system_program::id(), false),
            AccountMeta::new_readonly(self.token_program, false),
            AccountMeta::new_readonly(self.ata_program, false),
        ];
        Instruction {
            program_id: self.program_id,
            accounts,
            data: instruction_discriminator("withdraw").to_vec(),
        }
    }

    async fn await_confirmation(&self, signature: &Signature) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + self.confirm_timeout;
        loop {
            let status = self
                .rpc
                .get_signature_status_with_commitment(signature, CommitmentConfig::confirmed())
                .await
                .map_err(upstream("signature status"))?;
            match status {
                Some(Ok(())) => return Ok(None),
                Some(Err(tx_err)) => return Ok(Some(format!("{tx_err:?}"))),
                None if tokio::time::Instant::now() >= deadline => {
                    return Err(PipelineError::Upstream(format!(
                        "transaction {signature} was not confirmed within {:?}",
                        self.confirm_timeout
                    ))
                    .into());
                }
                None => tokio::time::sleep(Duration::from_millis(500)).await,
            }
        }
    }

    async fn logs_with_commitment(
        &self,
        signature: &str,
        commitment: CommitmentConfig,
    ) -> Result<Option<Vec<String>>> {
        let sig = Signature::from_str(signature).with_context(|| format!("invalid signature {signature}"))?;
        match self
            .rpc
            .get_transaction_with_config(&sig, transaction_config(commitment))
            .await
        {
            Ok(tx) => Ok(tx
                .transaction
                .meta
                .and_then(|m| match m.log_messages {
                    OptionSerializer::Some(logs) => Some(logs),
                    _ => None,
                })),
            Err(err) => {
                debug!(signature, ?commitment, "transaction lookup failed: {err}");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ChainClient for SolanaChain {
    async fn finalized_slot(&self) -> Result<u64> {
        self.rpc
            .get_slot_with_commitment(CommitmentConfig::finalized())
            .await
            .map_err(upstream("finalized slot"))
    }

    async fn confirmed_slot(&self) -> Result<u64> {
        self.rpc
            .get_slot_with_commitment(CommitmentConfig::confirmed())
            .await
            .map_err(upstream("confirmed slot"))
    }

    async fn block_time(&self, slot: u64) -> Result<Option<DateTime<Utc>>> {
        match self.rpc.get_block_time(slot).await {
            Ok(ts) => Ok(DateTime::from_timestamp(ts, 0)),
            Err(err) => {
                debug!(slot, "block time unavailable: {err}");
                Ok(None)
            }
        }
    }

    async fn block_bundles(&self, slot: u64) -> Result<Vec<LogBundle>> {
        let config = RpcBlockConfig {
            encoding: Some(UiTransactionEncoding::Base64),
            transaction_details: Some(TransactionDetails::Full),
            rewards: Some(false),
            commitment: Some(CommitmentConfig::confirmed()),
            max_supported_transaction_version: Some(0),
        };
        let block = match self.rpc.get_block_with_config(slot, config).await {
            Ok(block) => block,
            Err(err) if is_skipped_slot(&err) => {
                debug!(slot, "slot skipped: {err}");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(PipelineError::Upstream(format!("block {slot}: {err}")).into());
            }
        };

        let program = self.program_id.to_string();
        let mut out = Vec::new();
        for tx in block.transactions.unwrap_or_default() {
            let Some(meta) = tx.meta else { continue };
            let logs = Option::<Vec<String>>::from(meta.log_messages).unwrap_or_default();
            if !logs.iter().any(|l| l.contains(&program)) {
                continue;
            }
            let Some(decoded) = tx.transaction.decode() else {
                warn!(slot, "undecodable transaction in block");
                continue;
            };
            let Some(signature) = decoded.signatures.first() else { continue };
            out.push(LogBundle {
                slot,
                signature: signature.to_string(),
                logs,
                err: meta.err.map(|e| format!("{e:?}")),
            });
        }
        Ok(out)
    }

    async fn bonding_curve(&self, mint: &str) -> Result<Option<BondingCurveAccount>> {
        let mint = parse_pubkey(mint, "mint")?;
        let pda = bonding_curve_pda(&self.program_id, &mint);
        let account = self
            .rpc
            .get_account_with_commitment(&pda, CommitmentConfig::confirmed())
            .await
            .map_err(upstream("bonding curve account"))?
            .value;
        Ok(account.and_then(|a| decode_bonding_curve(&a.data)))
    }

    async fn mint_decimals(&self, mint: &str) -> Result<u8> {
        let mint = parse_pubkey(mint, "mint")?;
        let data = self
            .rpc
            .get_account_data(&mint)
            .await
            .map_err(upstream("mint account"))?;
        decode_mint_decimals(&data).ok_or_else(|| anyhow!("account {mint} is not an SPL mint"))
    }

    async fn holder_count(&self, mint: &str) -> Result<u64> {
        let mint = parse_pubkey(mint, "mint")?;
        let config = RpcProgramAccountsConfig {
            filters: Some(vec![
                RpcFilterType::DataSize(165),
                RpcFilterType::Memcmp(Memcmp::new_base58_encoded(0, mint.as_ref())),
            ]),
            account_config: RpcAccountInfoConfig {
                encoding: Some(UiAccountEncoding::Base64),
                // Only the amount field.
                data_slice: Some(UiDataSliceConfig {
                    offset: 64,
                    length: 8,
                }),
                commitment: Some(CommitmentConfig::confirmed()),
                min_context_slot: None,
            },
            ..Default::default()
        };
        let accounts = self
            .rpc
            .get_program_accounts_with_config(&self.token_program, config)
            .await
            .map_err(upstream("token accounts"))?;
        Ok(accounts
            .iter()
            .filter(|(_, acc)| {
                acc.data
                    .get(..8)
                    .and_then(|b| <[u8; 8]>::try_from(b).ok())
                    .map(u64::from_le_bytes)
                    .unwrap_or(0)
                    > 0
            })
            .count() as u64)
    }

    async fn send_withdraw(&self, mint: &str) -> Result<SubmittedTx> {
        let mint = parse_pubkey(mint, "mint")?;
        let instructions = vec![
            ComputeBudgetInstruction::set_compute_unit_limit(self.compute_unit_limit),
            ComputeBudgetInstruction::set_compute_unit_price(self.compute_unit_price),
            self.withdraw_instruction(&mint),
        ];
        let blockhash = self
            .rpc
            .get_latest_blockhash()
            .await
            .map_err(upstream("latest blockhash"))?;
        let payer = self.payer.pubkey();
        let tx = Transaction::new_signed_with_payer(
            &instructions,
            Some(&payer),
            &[self.payer.as_ref()],
            blockhash,
        );

        let sim = self
            .rpc
            .simulate_transaction(&tx)
            .await
            .map_err(upstream("simulate withdraw"))?
            .value;
        if let Some(err) = sim.err {
            return Err(PipelineError::TransactionFailed {
                signature: tx.signatures[0].to_string(),
                reason: format!("simulation failed: {err:?} logs={:?}", sim.logs.unwrap_or_default()),
            }
            .into());
        }

        let signature = self
            .rpc
            .send_transaction(&tx)
            .await
            .map_err(upstream("send withdraw"))?;
        info!(mint = %mint, %signature, "withdraw submitted");

        let err = self.await_confirmation(&signature).await?;
        let logs = self
            .transaction_logs(&signature.to_string())
            .await?
            .unwrap_or_default();
        Ok(SubmittedTx {
            signature: signature.to_string(),
            err,
            logs,
        })
    }

    async fn transaction_logs(&self, signature: &str) -> Result<Option<Vec<String>>> {
        self.logs_with_commitment(signature, CommitmentConfig::confirmed())
            .await
    }

    async fn finalized_transaction_logs(&self, signature: &str) -> Result<Option<Vec<String>>> {
        let deadline = tokio::time::Instant::now() + self.confirm_timeout;
        loop {
            let logs = self
                .logs_with_commitment(signature, CommitmentConfig::finalized())
                .await?;
            if logs.is_some() || tokio::time::Instant::now() >= deadline {
                return Ok(logs);
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    async fn stream_logs(&self, tx: mpsc::Sender<LogBundle>) -> Result<()> {
        let client = PubsubClient::new(&self.ws_url)
            .await
            .map_err(upstream("pubsub connect"))?;
        let (mut stream, unsubscribe) = client
            .logs_subscribe(
                RpcTransactionLogsFilter::Mentions(vec![self.program_id.to_string()]),
                RpcTransactionLogsConfig {
                    commitment: Some(CommitmentConfig::confirmed()),
                },
            )
            .await
            .map_err(upstream("logs subscribe"))?;
        info!(program = %self.program_id, "subscribed to program logs");

        while let Some(notice) = stream.next().await {
            let bundle = LogBundle {
                slot: notice.context.slot,
                signature: notice.value.signature,
                logs: notice.value.logs,
                err: notice.value.err.map(|e| format!("{e:?}")),
            };
            if tx.send(bundle).await.is_err() {
                debug!("log consumer dropped, closing subscription");
                break;
            }
        }
        unsubscribe().await;
        Ok(())
    }

    fn program_id(&self) -> String {
        self.program_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_client::rpc_request::RpcResponseErrorData;

    fn rpc_error(code: i64) -> ClientError {
        ClientErrorKind::RpcError(RpcError::RpcResponseError {
            code,
            message: format!("error {code}"),
            data: RpcResponseErrorData::Empty,
        })
        .into()
    }

    #[test]
    fn test_only_skipped_slots_count_as_empty_blocks() {
        assert!(is_skipped_slot(&rpc_error(SLOT_SKIPPED)));
        assert!(is_skipped_slot(&rpc_error(LONG_TERM_STORAGE_SLOT_SKIPPED)));
        // Block not available yet, and a rate limit, must surface as errors.
        assert!(!is_skipped_slot(&rpc_error(-32004)));
        assert!(!is_skipped_slot(&rpc_error(429)));
        assert!(!is_skipped_slot(
            &ClientErrorKind::Custom("HTTP status client error (429 Too Many Requests)".into()).into()
        ));
    }

    #[test]
    fn test_transaction_lookup_uses_requested_commitment() {
        let config = transaction_config(CommitmentConfig::finalized());
        assert_eq!(config.commitment, Some(CommitmentConfig::finalized()));
        assert_eq!(config.max_supported_transaction_version, Some(0));
    }
}
