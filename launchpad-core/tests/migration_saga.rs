mod common;

use chrono::Utc;
use common::*;
use launchpad_core::migration::MigrationSaga;
use launchpad_core::models::{
    FeeKind, MigrationState, StepRecord, StepStatus, Token, TokenStatus, WithdrawnAmounts,
};
use launchpad_core::store::{MigrationGate, TokenStore};
use std::sync::atomic::Ordering;

async fn begin(h: &Harness) -> Token {
    match h.store.try_begin_migration(MINT, Utc::now()).await.unwrap() {
        MigrationGate::Started(token) => token,
        other => panic!("migration did not start: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_completions_run_one_saga() {
    let h = Harness::new(FakeAmm::new(2, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;
    h.chain.set_curve(MINT, CURVE_LIMIT, true);

    // The same completion seen by the live listener and by backfill.
    let live = completion_bundle(20, "sig-complete");
    let replayed = completion_bundle(20, "sig-complete");
    tokio::join!(h.pipeline.handle_bundle(&live), h.pipeline.handle_bundle(&replayed));
    h.pipeline.on_idle().await;

    assert_eq!(h.chain.withdraws(), 1);
    assert_eq!(h.amm.creates(), 1);
    assert_eq!(h.amm.pool_polls.load(Ordering::SeqCst), 3);
    assert_eq!(*h.amm.lock_calls.lock().unwrap(), vec![900, 100]);

    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.status, TokenStatus::Locked);
    let m = &token.migration;
    assert_eq!(m.withdraw.tx_id.as_deref(), Some("withdraw-1"));
    assert_eq!(m.create_pool.tx_id.as_deref(), Some("create-pool-tx"));
    assert_eq!(m.lock_lp.tx_id.as_deref(), Some("lock-tx-1,lock-tx-2"));
    assert_eq!(m.finalize.tx_id.as_deref(), Some("finalized"));
    assert_eq!(m.nft_minted.as_deref(), Some("nft-1,nft-2"));
    assert_eq!(m.locked_amount, Some(1_000));
    assert!(m.locked_at.is_some());
    assert!(m.failed_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_pool_is_created_from_withdrawn_amounts_less_fee() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;
    h.saga().migrate_token(begin(&h).await).await.unwrap();

    let created = h.amm.created.lock().unwrap().clone();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].mint_a, MINT);
    assert_eq!(created[0].mint_b, "So11111111111111111111111111111111111111112");
    assert_eq!(created[0].amount_a, 199_800_000_000_000);
    assert_eq!(created[0].amount_b, 84_915_000_000);
    assert_eq!(created[0].fee_config.index, 0);

    let fees: Vec<_> = h
        .store
        .fees_for(MINT)
        .await
        .into_iter()
        .filter(|f| f.kind == FeeKind::Migration)
        .collect();
    assert_eq!(fees.len(), 1);
    assert_eq!(fees[0].user, CREATOR);
    assert_eq!(fees[0].token_amount, 200_000_000_000);
    assert_eq!(fees[0].sol_amount, 85_000_000);
    assert_eq!(fees[0].tx_id, "create-pool-tx");
}

#[tokio::test(start_paused = true)]
async fn test_resume_skips_completed_withdraw() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;

    let state = MigrationState {
        withdraw: StepRecord::success("withdraw-earlier", Utc::now()),
        withdrawn_amounts: Some(WithdrawnAmounts {
            lamports: 85_000_000_000,
            tokens: 200_000_000_000_000,
        }),
        ..Default::default()
    };
    h.store
        .save_migration(MINT, &state, Some(TokenStatus::Withdrawn), Utc::now())
        .await
        .unwrap();

    assert_eq!(h.saga().resume_pending(false).await.unwrap(), 1);
    h.saga().on_idle().await;

    assert_eq!(h.chain.withdraws(), 0);
    assert_eq!(h.amm.creates(), 1);
    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.status, TokenStatus::Locked);
    assert_eq!(token.migration.withdraw.tx_id.as_deref(), Some("withdraw-earlier"));

    // Finished sagas are left alone.
    assert_eq!(h.saga().resume_pending(true).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_lock_is_resumed_without_repeating_earlier_steps() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;

    let mut ctx = h.ctx.clone();
    ctx.migration.primary_lock_pct = 80;
    let misconfigured = MigrationSaga::new(ctx);
    let err = misconfigured.migrate_token(begin(&h).await).await.unwrap_err();
    assert_eq!(err.step, "lockLP");

    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.status, TokenStatus::MigrationFailed);
    assert!(token.migration.withdraw.is_success());
    assert!(token.migration.create_pool.is_success());
    assert_eq!(token.migration.lock_lp.status, StepStatus::Failure);
    assert!(token.migration.failed_at.is_some());
    assert!(token
        .migration
        .last_error
        .as_deref()
        .unwrap()
        .contains("lock percentages must sum to 100"));
    assert!(h.amm.lock_calls.lock().unwrap().is_empty());

    assert_eq!(h.saga().resume_pending(true).await.unwrap(), 1);
    h.saga().on_idle().await;

    assert_eq!(h.chain.withdraws(), 1);
    assert_eq!(h.amm.creates(), 1);
    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.status, TokenStatus::Locked);
    assert!(token.migration.failed_at.is_none());
    assert!(token.migration.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_program_failed_to_complete_with_success_logs_is_accepted() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;
    *h.chain.withdraw_err.lock().unwrap() = Some("InstructionError(1, ProgramFailedToComplete)".into());
    let logs = h.chain.withdraw_logs.lock().unwrap().clone();
    h.chain.finalized_logs.lock().unwrap().insert("withdraw-1".into(), logs);

    let token = h.saga().migrate_token(begin(&h).await).await.unwrap();

    assert_eq!(h.chain.withdraws(), 1);
    assert_eq!(token.status, TokenStatus::Locked);
    assert_eq!(token.migration.withdraw.tx_id.as_deref(), Some("withdraw-1"));
    assert_eq!(
        token.migration.withdrawn_amounts,
        Some(WithdrawnAmounts {
            lamports: 85_000_000_000,
            tokens: 200_000_000_000_000,
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_program_failed_to_complete_without_success_is_retried() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;
    *h.chain.withdraw_err.lock().unwrap() = Some("InstructionError(1, ProgramFailedToComplete)".into());
    h.chain
        .withdraw_logs
        .lock()
        .unwrap()
        .retain(|l| !l.ends_with("success"));

    let token = h.saga().migrate_token(begin(&h).await).await.unwrap();

    assert_eq!(h.chain.withdraws(), 2);
    assert_eq!(token.migration.withdraw.tx_id.as_deref(), Some("withdraw-2"));
}

#[tokio::test(start_paused = true)]
async fn test_withdraw_without_amounts_fails_without_resubmitting() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;
    h.chain
        .withdraw_logs
        .lock()
        .unwrap()
        .retain(|l| !l.contains("withdraw"));

    let err = h.saga().migrate_token(begin(&h).await).await.unwrap_err();

    assert_eq!(err.step, "withdraw");
    assert_eq!(h.chain.withdraws(), 1);
    assert_eq!(h.amm.creates(), 0);
    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.status, TokenStatus::MigrationFailed);
    assert_eq!(token.migration.withdraw.status, StepStatus::Failure);
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_completion_does_not_migrate() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;
    h.chain.set_curve(MINT, 80_000_000_000, false);

    h.pipeline.handle_bundle(&completion_bundle(20, "sig-complete")).await;
    h.pipeline.on_idle().await;

    assert_eq!(h.chain.withdraws(), 0);
    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.status, TokenStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_logs_alone_do_not_settle_program_failure() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;
    *h.chain.withdraw_err.lock().unwrap() = Some("InstructionError(1, ProgramFailedToComplete)".into());
    // Success at confirmed commitment, but nothing finalized yet.
    let logs = h.chain.withdraw_logs.lock().unwrap().clone();
    h.chain.tx_logs.lock().unwrap().insert("withdraw-1".into(), logs);

    let token = h.saga().migrate_token(begin(&h).await).await.unwrap();

    assert_eq!(h.chain.withdraws(), 2);
    assert_eq!(token.migration.withdraw.tx_id.as_deref(), Some("withdraw-2"));
}

#[tokio::test(start_paused = true)]
async fn test_pool_that_never_indexes_ends_lock_step_after_poll_budget() {
    let h = Harness::new(FakeAmm::new(1_000, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;

    let err = h.saga().migrate_token(begin(&h).await).await.unwrap_err();

    assert_eq!(err.step, "lockLP");
    assert_eq!(h.amm.pool_polls.load(Ordering::SeqCst), 12);
    assert!(h.amm.locks().is_empty());
    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.status, TokenStatus::MigrationFailed);
    assert_eq!(token.migration.lock_lp.status, StepStatus::Failure);
    assert!(token.migration.create_pool.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_failed_second_lock_is_not_resplit() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    *h.amm.fail_lock_call.lock().unwrap() = Some(2);
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;

    let err = h.saga().migrate_token(begin(&h).await).await.unwrap_err();

    assert_eq!(err.step, "lockLP");
    assert_eq!(h.amm.locks(), vec![900, 100]);
    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.status, TokenStatus::MigrationFailed);
    let tranches = &token.migration.lock_tranches;
    assert_eq!(tranches.len(), 2);
    assert_eq!(tranches[0].tx_id.as_deref(), Some("lock-tx-1"));
    assert!(tranches[1].tx_id.is_none());
    assert!(token.migration.locked_amount.is_none());

    assert_eq!(h.saga().resume_pending(true).await.unwrap(), 1);
    h.saga().on_idle().await;

    assert_eq!(h.amm.locks(), vec![900, 100, 100]);
    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.status, TokenStatus::Locked);
    let m = &token.migration;
    assert_eq!(m.lock_lp.tx_id.as_deref(), Some("lock-tx-1,lock-tx-3"));
    assert_eq!(m.nft_minted.as_deref(), Some("nft-1,nft-3"));
    assert_eq!(m.locked_amount, Some(1_000));
}

#[tokio::test(start_paused = true)]
async fn test_progress_save_is_retried_without_repeating_withdraw() {
    let (h, store) = Harness::flaky(FakeAmm::new(0, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;
    store.save_failures.store(1, Ordering::SeqCst);

    let token = h.saga().migrate_token(begin(&h).await).await.unwrap();

    assert_eq!(h.chain.withdraws(), 1);
    assert_eq!(token.status, TokenStatus::Locked);
    assert_eq!(token.migration.withdraw.tx_id.as_deref(), Some("withdraw-1"));
}

#[tokio::test(start_paused = true)]
async fn test_unsaved_withdraw_keeps_its_success_record() {
    let (h, store) = Harness::flaky(FakeAmm::new(0, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;
    store.save_failures.store(3, Ordering::SeqCst);

    let err = h.saga().migrate_token(begin(&h).await).await.unwrap_err();

    assert_eq!(err.step, "withdraw");
    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.status, TokenStatus::MigrationFailed);
    assert!(token.migration.withdraw.is_success());
    assert_eq!(token.migration.withdraw.tx_id.as_deref(), Some("withdraw-1"));
    assert!(token.migration.withdrawn_amounts.is_some());
    assert!(token.migration.failed_at.is_some());

    assert_eq!(h.saga().resume_pending(true).await.unwrap(), 1);
    h.saga().on_idle().await;

    assert_eq!(h.chain.withdraws(), 1);
    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.status, TokenStatus::Locked);
}

#[tokio::test(start_paused = true)]
async fn test_pool_creation_with_lost_response_is_adopted_not_repeated() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.amm.create_response_lost.store(true, Ordering::SeqCst);
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;

    let err = h.saga().migrate_token(begin(&h).await).await.unwrap_err();

    assert_eq!(err.step, "createPool");
    assert_eq!(h.amm.creates(), 1);
    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.status, TokenStatus::MigrationFailed);
    assert_eq!(token.migration.create_pool.status, StepStatus::Failure);

    assert_eq!(h.saga().resume_pending(true).await.unwrap(), 1);
    h.saga().on_idle().await;

    assert_eq!(h.amm.creates(), 1);
    assert_eq!(h.chain.withdraws(), 1);
    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.status, TokenStatus::Locked);
    assert_eq!(token.migration.create_pool.tx_id.as_deref(), Some("create-pool-tx"));
    assert_eq!(token.migration.pool.as_ref().unwrap().pool_id, "POOL");
}

#[tokio::test(start_paused = true)]
async fn test_pool_creation_refused_before_sending_is_retried() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.amm.create_refusals.store(1, Ordering::SeqCst);
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;

    let token = h.saga().migrate_token(begin(&h).await).await.unwrap();

    assert_eq!(h.amm.creates(), 2);
    assert_eq!(h.amm.created.lock().unwrap().len(), 1);
    assert_eq!(token.status, TokenStatus::Locked);
}
