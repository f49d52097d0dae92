mod common;

use common::*;
use launchpad_core::log_parser::LogBundle;
use launchpad_core::models::{FeeKind, TokenStatus};
use launchpad_core::store::TokenStore;

#[tokio::test]
async fn test_new_token_bootstraps_from_defaults() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    let parsed = h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;
    assert_eq!(parsed, 1);

    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.creator, CREATOR);
    assert_eq!(token.name, "Test Cat");
    assert_eq!(token.symbol, "TCAT");
    assert_eq!(token.status, TokenStatus::Active);
    assert_eq!(token.reserve_lamport, VIRTUAL_RESERVES);
    assert_eq!(token.reserve_token, TOKEN_SUPPLY);
    assert_eq!(token.curve_progress, 0.0);
    assert!(token.current_price > 0.0);
    assert_eq!(token.price_24h_ago, token.current_price);
}

#[tokio::test]
async fn test_duplicate_new_token_keeps_first_record() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;
    h.pipeline.handle_bundle(&new_token_bundle(12, "sig-create-again")).await;

    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.tx_id, "sig-create");
}

#[tokio::test]
async fn test_buy_updates_reserves_and_progress() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;
    h.pipeline.handle_bundle(&buy_bundle(11, "sig-buy", 57_500_000_000)).await;

    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.reserve_lamport, 57_500_000_000);
    assert_eq!(token.reserve_token, 999_000_000_000_000);
    assert!((token.curve_progress - 50.0).abs() < 1e-9);
    assert!(token.volume_24h > 0.0);
    assert_eq!(token.sol_price_usd, 150.0);

    let fees = h.store.fees_for(MINT).await;
    assert_eq!(fees.len(), 1);
    assert_eq!(fees[0].kind, FeeKind::Swap);
    assert_eq!(fees[0].sol_amount, 50_000);
    assert_eq!(fees[0].tx_id, "sig-buy");
}

#[tokio::test]
async fn test_replayed_swap_is_applied_once() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;
    let buy = buy_bundle(11, "sig-buy", 40_000_000_000);

    h.pipeline.handle_bundle(&buy).await;
    let first = h.store.get_token(MINT).await.unwrap().unwrap();
    h.pipeline.handle_bundle(&buy).await;
    h.pipeline.handle_bundle(&buy).await;
    let replayed = h.store.get_token(MINT).await.unwrap().unwrap();

    assert_eq!(h.store.swap_count().await, 1);
    assert_eq!(h.store.fee_count().await, 1);
    assert_eq!(first, replayed);
}

#[tokio::test]
async fn test_swap_for_unseen_token_bootstraps_it() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.chain.set_curve(MINT, 45_000_000_000, false);
    h.pipeline.handle_bundle(&buy_bundle(11, "sig-buy", 46_000_000_000)).await;

    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.creator, CREATOR);
    assert_eq!(token.reserve_lamport, 46_000_000_000);
    assert_eq!(h.store.swap_count().await, 1);
}

#[tokio::test]
async fn test_swap_publishes_to_token_and_global_rooms() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;
    let mut rx = h.fanout.subscribe();
    h.pipeline.handle_bundle(&buy_bundle(11, "sig-buy", 40_000_000_000)).await;

    let mut seen = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        seen.push((msg.room, msg.event.name()));
    }
    let room = format!("token-{MINT}");
    assert!(seen.contains(&(room.clone(), "newSwap")));
    assert!(seen.contains(&(room.clone(), "newCandle")));
    assert!(seen.contains(&(room, "updateToken")));
    assert!(seen.contains(&("global".to_string(), "updateToken")));
}

#[tokio::test]
async fn test_failed_and_placeholder_transactions_are_skipped() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;

    let mut failed = buy_bundle(11, "sig-failed", 40_000_000_000);
    failed.err = Some("InstructionError(0, Custom(6001))".into());
    assert_eq!(h.pipeline.handle_bundle(&failed).await, 0);

    let placeholder = LogBundle {
        signature: "1".repeat(64),
        ..buy_bundle(12, "unused", 41_000_000_000)
    };
    assert_eq!(h.pipeline.handle_bundle(&placeholder).await, 0);

    assert_eq!(h.store.swap_count().await, 0);
    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.reserve_lamport, VIRTUAL_RESERVES);
}

#[tokio::test]
async fn test_swap_whose_write_failed_is_applied_on_replay() {
    let (h, store) = Harness::flaky(FakeAmm::new(0, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(10, "sig-create")).await;
    let before = h.store.get_token(MINT).await.unwrap().unwrap();
    store.record_swap_failures.store(1, std::sync::atomic::Ordering::SeqCst);

    let buy = buy_bundle(11, "sig-buy", 40_000_000_000);
    h.pipeline.handle_bundle(&buy).await;
    assert_eq!(h.store.swap_count().await, 0);
    assert_eq!(h.store.fee_count().await, 0);
    assert_eq!(h.store.get_token(MINT).await.unwrap().unwrap(), before);

    h.pipeline.handle_bundle(&buy).await;
    assert_eq!(h.store.swap_count().await, 1);
    assert_eq!(h.store.fee_count().await, 1);
    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.reserve_lamport, 40_000_000_000);
    assert!(token.volume_24h > 0.0);
}
