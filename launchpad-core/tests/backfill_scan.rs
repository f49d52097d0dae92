mod common;

use common::*;
use launchpad_core::backfill::GapRecoveryScanner;
use launchpad_core::models::TokenStatus;
use launchpad_core::store::TokenStore;

fn scanner(h: &Harness) -> GapRecoveryScanner {
    GapRecoveryScanner::new(h.ctx.clone(), h.pipeline.clone())
}

#[tokio::test(start_paused = true)]
async fn test_no_blocks_fetched_when_caught_up() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    let report = scanner(&h).scan(500, 500).await.unwrap();
    assert_eq!(report.blocks_fetched, 0);
    assert_eq!(h.chain.fetches(), 0);

    let report = scanner(&h).scan(510, 500).await.unwrap();
    assert_eq!(report.blocks_fetched, 0);
    assert_eq!(h.chain.fetches(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_right_after_an_update_has_nothing_to_do() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.pipeline.handle_bundle(&new_token_bundle(400, "sig-create")).await;
    h.chain.set_slots(500, 500);

    let report = scanner(&h).run().await.unwrap();
    assert_eq!(report.from_slot, 500);
    assert_eq!(h.chain.fetches(), 0);
}

#[tokio::test]
async fn test_estimate_falls_back_without_tokens() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.chain.set_slots(1_000, 1_010);
    assert_eq!(scanner(&h).estimate_last_slot().await.unwrap(), 900);

    h.chain.set_slots(40, 40);
    assert_eq!(scanner(&h).estimate_last_slot().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_gap_is_replayed_through_the_pipeline() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.chain.add_block(101, vec![new_token_bundle(101, "sig-create")]);
    h.chain.add_block(103, vec![buy_bundle(103, "sig-buy-1", 40_000_000_000)]);
    h.chain.add_block(104, vec![buy_bundle(104, "sig-buy-2", 42_000_000_000)]);

    let report = scanner(&h).scan(100, 105).await.unwrap();

    assert_eq!(h.chain.fetches(), 5);
    assert_eq!(report.blocks_fetched, 5);
    assert_eq!(report.bundles, 3);
    assert_eq!(report.events, 3);
    assert_eq!(h.store.swap_count().await, 2);
    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.reserve_lamport, 42_000_000_000);
}

#[tokio::test(start_paused = true)]
async fn test_overlap_with_live_events_is_idempotent() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    let create = new_token_bundle(101, "sig-create");
    let buy = buy_bundle(102, "sig-buy", 40_000_000_000);
    h.pipeline.handle_bundle(&create).await;
    h.pipeline.handle_bundle(&buy).await;
    let live = h.store.get_token(MINT).await.unwrap().unwrap();

    h.chain.add_block(101, vec![create]);
    h.chain.add_block(102, vec![buy]);
    scanner(&h).scan(100, 102).await.unwrap();

    assert_eq!(h.store.swap_count().await, 1);
    assert_eq!(h.store.fee_count().await, 1);
    assert_eq!(h.store.get_token(MINT).await.unwrap().unwrap(), live);
}

#[tokio::test(start_paused = true)]
async fn test_completion_found_in_gap_starts_migration() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.chain.set_curve(MINT, CURVE_LIMIT, true);
    h.chain.add_block(201, vec![new_token_bundle(201, "sig-create")]);
    h.chain.add_block(202, vec![completion_bundle(202, "sig-complete")]);

    scanner(&h).scan(200, 202).await.unwrap();

    assert_eq!(h.chain.withdraws(), 1);
    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.status, TokenStatus::Locked);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_block_is_refetched_not_skipped() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.chain.add_block(11, vec![new_token_bundle(11, "sig-create")]);
    h.chain.add_block(12, vec![buy_bundle(12, "sig-buy", 40_000_000_000)]);
    h.chain.fail_block(12, 1);

    let report = scanner(&h).scan(10, 13).await.unwrap();

    assert_eq!(h.chain.fetches(), 4);
    assert_eq!(report.blocks_fetched, 3);
    assert_eq!(h.store.swap_count().await, 1);
    let token = h.store.get_token(MINT).await.unwrap().unwrap();
    assert_eq!(token.reserve_lamport, 40_000_000_000);
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_block_stops_the_scan() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.chain.add_block(11, vec![new_token_bundle(11, "sig-create")]);
    h.chain.add_block(13, vec![buy_bundle(13, "sig-buy", 40_000_000_000)]);
    h.chain.fail_block(12, usize::MAX);

    let err = scanner(&h).scan(10, 13).await.unwrap_err();

    assert!(format!("{err:#}").contains("slot 12"));
    // One fetch for slot 11, then the full retry budget for slot 12.
    assert_eq!(h.chain.fetches(), 1 + 5);
    assert_eq!(h.store.swap_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_spawned_scan_does_not_block_the_caller() {
    let h = Harness::new(FakeAmm::new(0, 1_000));
    h.chain.set_slots(200, 103);
    h.chain.add_block(101, vec![new_token_bundle(101, "sig-create")]);
    h.chain.add_block(103, vec![buy_bundle(103, "sig-buy", 40_000_000_000)]);

    let handle = scanner(&h).spawn();
    tokio::task::yield_now().await;
    assert!(!handle.is_finished());

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.from_slot, 100);
    assert_eq!(report.events, 2);
    assert_eq!(h.store.swap_count().await, 1);
}
