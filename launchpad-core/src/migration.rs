use crate::amm::{CreatePoolRequest, PoolInfo};
use crate::context::PipelineContext;
use crate::error::{MigrationError, PipelineError};
use crate::fanout::{emit, token_room, FanoutEvent, GLOBAL_ROOM};
use crate::log_parser::parse_withdraw_logs;
use crate::models::{
    Direction, Fee, FeeKind, LockTranche, MigrationState, PoolAddresses, StepRecord, Token,
    TokenStatus, WithdrawnAmounts,
};
use crate::pricing::{lock_split, split_fee};
use crate::queue::{RateLimitedQueue, TaskHandle};
use crate::retry::RetryPolicy;
use crate::store::MigrationGate;
use anyhow::{Context, Result};
use chrono::Utc;
use std::future::Future;
use tracing::{debug, error, info, warn};

pub const STEP_WITHDRAW: &str = "withdraw";
pub const STEP_CREATE_POOL: &str = "createPool";
pub const STEP_LOCK_LP: &str = "lockLP";
pub const STEP_FINALIZE: &str = "finalize";

/// Recorded as the finalize step's transaction id; finalize is local only.
pub const FINALIZED_TX: &str = "finalized";

const PROGRAM_FAILED_TO_COMPLETE: &str = "ProgramFailedToComplete";

/// Withdraw, create pool, lock LP, finalize. Each step is skipped when its
/// persisted record is already `success`, so re-running is always safe.
#[derive(Clone)]
pub struct MigrationSaga {
    ctx: PipelineContext,
    step_policy: RetryPolicy,
    pool_poll: RetryPolicy,
    queue: RateLimitedQueue,
}

struct CreatedPoolStep {
    tx_id: String,
    pool: PoolAddresses,
    fee: WithdrawnAmounts,
}

struct LockStep {
    tx_id: String,
    nft_minted: String,
    locked_amount: u64,
}

/// True when the logs show the program itself ran to completion.
pub fn program_succeeded(logs: &[String], program_id: &str) -> bool {
    let own_success = format!("Program {program_id} success");
    logs.iter()
        .any(|l| l.trim() == own_success || l.contains("Program success"))
}

fn set_step(state: &mut MigrationState, step: &'static str, record: StepRecord) {
    match step {
        STEP_WITHDRAW => state.withdraw = record,
        STEP_CREATE_POOL => state.create_pool = record,
        STEP_LOCK_LP => state.lock_lp = record,
        _ => state.finalize = record,
    }
}

impl MigrationSaga {
    pub fn new(ctx: PipelineContext) -> Self {
        let m = &ctx.migration;
        let step_policy = RetryPolicy::fixed("migration-step", m.step_attempts, m.step_delay());
        let pool_poll = RetryPolicy::fixed("pool-info-poll", m.pool_poll_attempts, m.pool_poll_interval())
            .with_classifier(|err| {
                err.chain().any(|c| {
                    c.downcast_ref::<PipelineError>()
                        .is_some_and(PipelineError::is_transient)
                })
            });
        let queue = RateLimitedQueue::new(
            "migration",
            ctx.saga_concurrency,
            std::time::Duration::from_millis(1),
            usize::MAX,
        );
        Self {
            ctx,
            step_policy,
            pool_poll,
            queue,
        }
    }

    /// Runs the saga on the migration queue.
    pub fn spawn(&self, token: Token) -> TaskHandle<Token> {
        let saga = self.clone();
        self.queue
            .add(async move { saga.migrate_token(token).await.map_err(anyhow::Error::from) })
    }

    pub async fn on_idle(&self) {
        self.queue.on_idle().await
    }

    pub async fn migrate_token(&self, mut token: Token) -> Result<Token, MigrationError> {
        let mint = token.mint.clone();
        let mut state = token.migration.clone();
        info!(mint = %mint, status = %token.status, "migration started");

        if state.withdraw.is_success() {
            debug!(mint = %mint, step = STEP_WITHDRAW, "step already complete, skipping");
        } else {
            let (tx_id, amounts) = self
                .run_step(&mint, STEP_WITHDRAW, &mut state, |_| self.withdraw(&mint))
                .await?;
            let now = Utc::now();
            state.withdraw = StepRecord::success(tx_id, now);
            state.withdrawn_amounts = Some(amounts);
            self.persist(&mint, STEP_WITHDRAW, &mut state, TokenStatus::Withdrawn)
                .await?;
            token.status = TokenStatus::Withdrawn;
            info!(mint = %mint, lamports = amounts.lamports, tokens = amounts.tokens, "withdraw complete");
        }

        if state.create_pool.is_success() {
            debug!(mint = %mint, step = STEP_CREATE_POOL, "step already complete, skipping");
        } else {
            let withdrawn = state.withdrawn_amounts;
            let created = self
                .run_step(&mint, STEP_CREATE_POOL, &mut state, |_| {
                    self.create_pool(&mint, withdrawn)
                })
                .await?;
            let now = Utc::now();
            state.create_pool = StepRecord::success(created.tx_id.clone(), now);
            state.pool = Some(created.pool.clone());
            self.persist(&mint, STEP_CREATE_POOL, &mut state, TokenStatus::Migrated)
                .await?;
            token.status = TokenStatus::Migrated;
            self.record_migration_fee(&token, &created).await;
            info!(mint = %mint, pool = %created.pool.pool_id, tx = %created.tx_id, "pool created");
        }

        if state.lock_lp.is_success() {
            debug!(mint = %mint, step = STEP_LOCK_LP, "step already complete, skipping");
        } else {
            let locked = self.lock_lp(&mint, &mut state).await?;
            let now = Utc::now();
            state.lock_lp = StepRecord::success(locked.tx_id.clone(), now);
            state.nft_minted = Some(locked.nft_minted.clone());
            state.locked_amount = Some(locked.locked_amount);
            state.locked_at = Some(now);
            self.persist(&mint, STEP_LOCK_LP, &mut state, TokenStatus::Migrated)
                .await?;
            token.status = TokenStatus::Migrated;
            info!(mint = %mint, tx = %locked.tx_id, amount = locked.locked_amount, "liquidity locked");
        }

        if !state.finalize.is_success() {
            state.finalize = StepRecord::success(FINALIZED_TX, Utc::now());
            state.failed_at = None;
            state.last_error = None;
            self.persist(&mint, STEP_FINALIZE, &mut state, TokenStatus::Locked)
                .await?;
        }
        token.status = TokenStatus::Locked;
        token.migration = state;
        token.last_updated = Utc::now();

        let enriched = self.ctx.stats.enrich(token.clone()).await;
        emit(
            self.ctx.fanout.as_ref(),
            &token_room(&mint),
            FanoutEvent::UpdateToken(enriched.clone()),
        )
        .await;
        emit(self.ctx.fanout.as_ref(), GLOBAL_ROOM, FanoutEvent::UpdateToken(enriched)).await;
        info!(mint = %mint, "migration finalized");
        Ok(token)
    }

    async fn run_step<T, F, Fut>(
        &self,
        mint: &str,
        step: &'static str,
        state: &mut MigrationState,
        op: F,
    ) -> Result<T, MigrationError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.step_policy.run(op).await {
            Ok(v) => Ok(v),
            Err(err) => Err(self.fail(mint, step, state, err).await),
        }
    }

    /// Saves progress with the step retry budget. When the save keeps
    /// failing the step records are left as they are: the step's side effect
    /// already happened and a resumed run must not repeat it.
    async fn persist(
        &self,
        mint: &str,
        step: &'static str,
        state: &mut MigrationState,
        status: TokenStatus,
    ) -> Result<(), MigrationError> {
        let saved = {
            let snapshot: &MigrationState = state;
            self.step_policy
                .run(|_| {
                    self.ctx
                        .store
                        .save_migration(mint, snapshot, Some(status), Utc::now())
                })
                .await
        };
        match saved {
            Ok(()) => Ok(()),
            Err(err) => {
                let err = err.context("saving migration progress");
                Err(self.abort(mint, step, state, err).await)
            }
        }
    }

    /// Marks `step` failed, then aborts the run.
    async fn fail(
        &self,
        mint: &str,
        step: &'static str,
        state: &mut MigrationState,
        err: anyhow::Error,
    ) -> MigrationError {
        set_step(state, step, StepRecord::failure(Utc::now()));
        self.abort(mint, step, state, err).await
    }

    async fn abort(
        &self,
        mint: &str,
        step: &'static str,
        state: &mut MigrationState,
        err: anyhow::Error,
    ) -> MigrationError {
        let now = Utc::now();
        state.failed_at = Some(now);
        state.last_error = Some(format!("{err:#}"));
        error!(mint, step, "migration step failed: {err:?}");
        if let Err(store_err) = self.ctx.store.mark_migration_failed(mint, state, now).await {
            error!(mint, step, "failed to persist migration failure: {store_err:?}");
        }
        MigrationError {
            mint: mint.to_string(),
            step,
            source: err,
        }
    }

    async fn withdraw(&self, mint: &str) -> Result<(String, WithdrawnAmounts)> {
        let chain = &self.ctx.chain;
        let submitted = chain.send_withdraw(mint).await?;
        let signature = submitted.signature;
        let mut logs = match submitted.err {
            None => submitted.logs,
            Some(reason) if reason.contains(PROGRAM_FAILED_TO_COMPLETE) => {
                let logs = chain
                    .finalized_transaction_logs(&signature)
                    .await?
                    .unwrap_or_default();
                if !program_succeeded(&logs, &chain.program_id()) {
                    return Err(PipelineError::AmbiguousProgramFailure { signature, logs }.into());
                }
                warn!(mint, %signature, "confirmation reported {PROGRAM_FAILED_TO_COMPLETE} but logs show success");
                logs
            }
            Some(reason) => return Err(PipelineError::TransactionFailed { signature, reason }.into()),
        };

        let (mut lamports, mut tokens) = parse_withdraw_logs(&logs);
        if lamports == 0 && tokens == 0 {
            if let Some(fetched) = chain.transaction_logs(&signature).await? {
                logs = fetched;
                (lamports, tokens) = parse_withdraw_logs(&logs);
            }
        }
        if lamports == 0 && tokens == 0 {
            // The withdraw landed; resubmitting would not recover the amounts.
            return Err(PipelineError::MissingState {
                mint: mint.to_string(),
                what: "withdrawn amounts in withdraw logs",
            }
            .into());
        }
        Ok((signature, WithdrawnAmounts { lamports, tokens }))
    }

    async fn create_pool(
        &self,
        mint: &str,
        withdrawn: Option<WithdrawnAmounts>,
    ) -> Result<CreatedPoolStep> {
        let withdrawn = withdrawn.ok_or_else(|| PipelineError::MissingState {
            mint: mint.to_string(),
            what: "withdrawn amounts",
        })?;
        let bps = self.ctx.migration.fee_bps;
        let (fee_tokens, tokens) = split_fee(withdrawn.tokens, bps);
        let (fee_lamports, lamports) = split_fee(withdrawn.lamports, bps);
        let fee = WithdrawnAmounts {
            lamports: fee_lamports,
            tokens: fee_tokens,
        };

        // An earlier attempt may have created the pool without us learning it.
        if let Some(existing) = self.ctx.amm.find_pool(mint, &self.ctx.quote_mint).await? {
            warn!(mint, pool = %existing.pool.pool_id, "pool already exists, adopting it");
            return Ok(CreatedPoolStep {
                tx_id: existing.tx_id,
                pool: existing.pool,
                fee,
            });
        }

        let fee_config = self
            .ctx
            .amm
            .fee_configs()
            .await?
            .into_iter()
            .min_by_key(|c| c.index)
            .ok_or_else(|| PipelineError::Upstream("AMM returned no fee configs".into()))?;

        let created = self
            .ctx
            .amm
            .create_pool(&CreatePoolRequest {
                mint_a: mint.to_string(),
                mint_b: self.ctx.quote_mint.clone(),
                amount_a: tokens,
                amount_b: lamports,
                fee_config,
            })
            .await
            .context("pool creation")?;
        Ok(CreatedPoolStep {
            tx_id: created.tx_id,
            pool: created.pool,
            fee,
        })
    }

    async fn wait_for_pool(&self, pool_id: &str) -> Result<PoolInfo> {
        self.pool_poll
            .run(|attempt| {
                debug!(pool = pool_id, attempt, "polling pool info");
                self.ctx.amm.pool_info(pool_id)
            })
            .await
    }

    async fn plan_locks(&self, info: &PoolInfo) -> Result<Vec<LockTranche>> {
        let balance = self.ctx.amm.lp_balance(&info.lp_mint).await?;
        if balance == 0 {
            return Err(PipelineError::NotYetIndexed(format!("LP balance for {}", info.lp_mint)).into());
        }
        let m = &self.ctx.migration;
        let (primary, secondary) = lock_split(balance, m.primary_lock_pct, m.secondary_lock_pct)?;
        Ok([primary, secondary]
            .into_iter()
            .filter(|amount| *amount > 0)
            .map(LockTranche::planned)
            .collect())
    }

    /// Pool polling has its own budget and ends the step when spent. The
    /// split is planned and saved once; each lock runs once and is saved as
    /// it lands, so a later run only locks what is still missing.
    async fn lock_lp(
        &self,
        mint: &str,
        state: &mut MigrationState,
    ) -> Result<LockStep, MigrationError> {
        let Some(pool) = state.pool.clone() else {
            let err = PipelineError::MissingState {
                mint: mint.to_string(),
                what: "pool addresses",
            };
            return Err(self.fail(mint, STEP_LOCK_LP, state, err.into()).await);
        };

        let pending = state.lock_tranches.is_empty()
            || state.lock_tranches.iter().any(|t| t.tx_id.is_none());
        if pending {
            let info = match self.wait_for_pool(&pool.pool_id).await {
                Ok(info) => info,
                Err(err) => return Err(self.fail(mint, STEP_LOCK_LP, state, err).await),
            };
            if state.lock_tranches.is_empty() {
                let tranches = self
                    .run_step(mint, STEP_LOCK_LP, state, |_| self.plan_locks(&info))
                    .await?;
                state.lock_tranches = tranches;
                self.persist(mint, STEP_LOCK_LP, state, TokenStatus::Migrated)
                    .await?;
            }
            for i in 0..state.lock_tranches.len() {
                if state.lock_tranches[i].tx_id.is_some() {
                    continue;
                }
                let amount = state.lock_tranches[i].amount;
                let receipt = match self.ctx.amm.lock_liquidity(&info, amount).await {
                    Ok(receipt) => receipt,
                    Err(err) => {
                        let err = err.context(format!("lock of {amount} LP"));
                        return Err(self.fail(mint, STEP_LOCK_LP, state, err).await);
                    }
                };
                debug!(mint, amount, tx = %receipt.tx_id, "tranche locked");
                let tranche = &mut state.lock_tranches[i];
                tranche.tx_id = Some(receipt.tx_id);
                tranche.nft_mint = Some(receipt.nft_mint);
                self.persist(mint, STEP_LOCK_LP, state, TokenStatus::Migrated)
                    .await?;
            }
        }

        let tranches = &state.lock_tranches;
        let tx_ids: Vec<&str> = tranches.iter().filter_map(|t| t.tx_id.as_deref()).collect();
        let nfts: Vec<&str> = tranches.iter().filter_map(|t| t.nft_mint.as_deref()).collect();
        Ok(LockStep {
            tx_id: tx_ids.join(","),
            nft_minted: nfts.join(","),
            locked_amount: tranches.iter().map(|t| t.amount).sum(),
        })
    }

    async fn record_migration_fee(&self, token: &Token, created: &CreatedPoolStep) {
        let fee = Fee {
            token_mint: token.mint.clone(),
            user: token.creator.clone(),
            direction: Direction::Sell,
            kind: FeeKind::Migration,
            token_amount: created.fee.tokens,
            sol_amount: created.fee.lamports,
            tx_id: created.tx_id.clone(),
            timestamp: Utc::now(),
        };
        if let Err(err) = self.ctx.store.insert_fee(&fee).await {
            error!(mint = %token.mint, "failed to record migration fee: {err:?}");
        }
    }

    /// Guards on the store's status compare-and-set, then runs the saga in
    /// the background. Returns `None` when another trigger already owns it.
    pub async fn trigger(&self, mint: &str) -> Result<Option<TaskHandle<Token>>> {
        match self.ctx.store.try_begin_migration(mint, Utc::now()).await? {
            MigrationGate::Started(token) => {
                info!(mint, "curve completed, migration scheduled");
                Ok(Some(self.spawn(token)))
            }
            MigrationGate::AlreadyInProgress(status) => {
                debug!(mint, %status, "migration already in progress, ignoring trigger");
                Ok(None)
            }
            MigrationGate::NotFound => {
                warn!(mint, "curve completed for unknown token");
                Ok(None)
            }
        }
    }

    /// Re-drives sagas left `migrating` by a previous run, plus
    /// `migration_failed` ones when `include_failed` is set.
    pub async fn resume_pending(&self, include_failed: bool) -> Result<usize> {
        let mut resumed = 0;
        for token in self
            .ctx
            .store
            .tokens_with_status(&[TokenStatus::Migrating, TokenStatus::Withdrawn, TokenStatus::Migrated])
            .await?
        {
            if token.status == TokenStatus::Migrated && token.migration.finalize.is_success() {
                continue;
            }
            info!(mint = %token.mint, status = %token.status, "resuming migration");
            let _ = self.spawn(token);
            resumed += 1;
        }
        if include_failed {
            for token in self
                .ctx
                .store
                .tokens_with_status(&[TokenStatus::MigrationFailed])
                .await?
            {
                if self.trigger(&token.mint).await?.is_some() {
                    resumed += 1;
                }
            }
        }
        Ok(resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_success_detection() {
        let program = "Prog111";
        let ok = vec![
            "Program ComputeBudget111 success".to_string(),
            "Program Prog111 success".to_string(),
        ];
        assert!(program_succeeded(&ok, program));
        let other_only = vec!["Program ComputeBudget111 success".to_string()];
        assert!(!program_succeeded(&other_only, program));
        let bare = vec!["Program success".to_string()];
        assert!(program_succeeded(&bare, program));
    }

    #[test]
    fn test_failure_marks_only_named_step() {
        let mut state = MigrationState::default();
        let now = Utc::now();
        set_step(&mut state, STEP_CREATE_POOL, StepRecord::failure(now));
        assert_eq!(state.create_pool.status, crate::models::StepStatus::Failure);
        assert!(!state.withdraw.is_success());
        assert_eq!(state.withdraw.status, crate::models::StepStatus::Unset);
    }
}
