//! End-to-end lifecycle tests: investment accounting, the escrow release
//! pipeline, payback and distribution, and the payback monitor's
//! escalation ladder, all against the in-memory store and mock chain.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::errors::{EngineError, StoreError};
use crate::monitor::{self, Band};
use crate::stage::Stage;
use crate::testutil::*;
use crate::types::Entity;

const WEEK: i64 = 7 * 24 * 3600;

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Poll the store until `pred` holds or the deadline passes.
async fn wait_until(harness: &Harness, project: u64, pred: impl Fn(&crate::types::Project) -> bool) {
    for _ in 0..300 {
        if pred(&harness.store.get_project(project)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}

// ─────────────────────────────────────────────────────────
// Investment accounting
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn investment_exceeding_gap_is_rejected_without_mutation() {
    let harness = Harness::new();
    let project = harness.seed_project(|p| p.stage = Stage::Selected);
    harness.seed_investor(1, "alice", 10_000.0);

    harness.engine.invest(project.index, 1, 600.0, "alice").await.unwrap();

    let err = harness
        .engine
        .invest(project.index, 1, 500.0, "alice")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::ExceedsGap { amount, remaining }
            if amount == 500.0 && remaining == 400.0
    ));

    let stored = harness.store.get_project(project.index);
    assert_eq!(stored.money_raised, 600.0);
    assert_eq!(stored.investor_indices, vec![1]);
    assert!(!stored.lock);
}

#[tokio::test]
async fn accepted_amounts_sum_to_money_raised() {
    let harness = Harness::new();
    let project = harness.seed_project(|p| {
        p.stage = Stage::Selected;
        p.recipient_index = 20;
    });
    harness.seed_investor(1, "alice", 10_000.0);
    harness.seed_investor(2, "bob", 10_000.0);
    harness.seed_recipient(20, "openup");

    for (investor, seed, amount) in
        [(1u64, "alice", 100.0), (2, "bob", 200.0), (1, "alice", 300.0), (2, "bob", 400.0)]
    {
        harness.engine.invest(project.index, investor, amount, seed).await.unwrap();
    }

    let stored = harness.store.get_project(project.index);
    assert_eq!(stored.money_raised, 1000.0);
    assert_eq!(stored.money_raised, stored.total_value);
    assert_eq!(stored.investor_indices, vec![1, 2, 1, 2]);
    // ownership shares follow issued instrument balances
    assert_eq!(stored.investor_map[&MockChain::pubkey_for("alice")], 0.4);
    assert_eq!(stored.investor_map[&MockChain::pubkey_for("bob")], 0.6);
}

#[tokio::test]
async fn precondition_failures_are_distinct_and_mutation_free() {
    let harness = Harness::new();
    let project = harness.seed_project(|p| p.stage = Stage::Selected);
    harness.seed_investor(1, "poor", 100.0);

    let err = harness.engine.invest(project.index, 1, 200.0, "poor").await.unwrap_err();
    assert!(matches!(err, EngineError::InsufficientBalance(_)));

    harness.seed_investor(2, "ghost", 10_000.0);
    harness.chain.missing_accounts.insert(MockChain::pubkey_for("ghost"), ());
    let err = harness.engine.invest(project.index, 2, 200.0, "ghost").await.unwrap_err();
    assert!(matches!(err, EngineError::AccountMissing(_)));

    let stored = harness.store.get_project(project.index);
    assert_eq!(stored.money_raised, 0.0);
    assert!(stored.investor_indices.is_empty());
}

#[tokio::test]
async fn invest_rejects_unfundable_stages() {
    let harness = Harness::new();
    let project = harness.seed_project(|p| p.stage = Stage::Proposed);
    harness.seed_investor(1, "alice", 10_000.0);

    let err = harness.engine.invest(project.index, 1, 100.0, "alice").await.unwrap_err();
    assert!(matches!(err, EngineError::WrongStage(_, Stage::Proposed)));
}

#[tokio::test]
async fn seed_round_applies_cap_factor_and_fixed_asset() {
    let harness = Harness::new();
    let project = harness.seed_project(|p| {
        p.stage = Stage::Originated;
        p.seed_investment_factor = 2.0;
    });
    harness.seed_investor(1, "alice", 10_000.0);

    let err = harness
        .engine
        .seed_invest(project.index, 1, 501.0, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ExceedsSeedCap { cap, .. } if cap == 500.0));

    harness.engine.seed_invest(project.index, 1, 300.0, "alice").await.unwrap();

    let stored = harness.store.get_project(project.index);
    assert_eq!(stored.seed_asset_code, "SEEDASSET");
    assert_eq!(stored.money_raised, 300.0);
    // surplus owed to seed investors: amount * (factor - 1)
    assert_eq!(stored.seed_money_raised, 300.0);
    // instrument balance carries the full factor
    assert_eq!(
        stored.investor_map[&MockChain::pubkey_for("alice")],
        600.0 / 1000.0
    );

    // the main entry point routes stage-1/2 investments to the seed round
    harness.engine.invest(project.index, 1, 200.0, "alice").await.unwrap();
    assert_eq!(harness.store.get_project(project.index).seed_money_raised, 500.0);
}

#[tokio::test]
async fn one_failing_balance_query_zeroes_only_that_share() {
    let harness = Harness::new();
    let project = harness.seed_project(|p| p.stage = Stage::Selected);
    harness.seed_investor(1, "alice", 10_000.0);
    harness.seed_investor(2, "bob", 10_000.0);
    harness.seed_investor(3, "carol", 10_000.0);

    harness.engine.invest(project.index, 1, 300.0, "alice").await.unwrap();
    harness.engine.invest(project.index, 2, 300.0, "bob").await.unwrap();

    harness.chain.failing_balance_pubkeys.insert(MockChain::pubkey_for("bob"), ());
    harness.engine.invest(project.index, 3, 100.0, "carol").await.unwrap();

    let map = harness.store.get_project(project.index).investor_map;
    assert_eq!(map[&MockChain::pubkey_for("alice")], 0.3);
    assert_eq!(map[&MockChain::pubkey_for("bob")], 0.0);
    assert_eq!(map[&MockChain::pubkey_for("carol")], 0.1);
}

// ─────────────────────────────────────────────────────────
// Raise completion and escrow release
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn full_raise_locks_once_and_releases_through_escrow() {
    let harness = Harness::new();
    let project = harness.seed_project(|p| {
        p.stage = Stage::Selected;
        p.recipient_index = 20;
    });
    harness.seed_investor(1, "alice", 10_000.0);
    let recipient = harness.seed_recipient(20, "openup");

    harness.engine.invest(project.index, 1, 1000.0, "alice").await.unwrap();

    let stored = harness.store.get_project(project.index);
    assert!(stored.lock);
    assert_eq!(harness.notifier.count("unlock_request"), 1);

    harness
        .engine
        .unlock_project(&recipient.username, &recipient.pwhash, project.index, "openup")
        .await
        .unwrap();
    assert!(!harness.store.get_project(project.index).lock);

    wait_until(&harness, project.index, |p| p.stage == Stage::Raised).await;

    let stored = harness.store.get_project(project.index);
    assert_eq!(stored.escrow_pubkey, format!("ESCROW{}", project.index));
    assert_eq!(stored.bal_left, 1000.0);
    // the transient secret is gone once the pipeline has read it
    assert!(stored.lock_pwd.is_empty());
    assert!(stored.debt_asset_code.starts_with("MUNIDEBT"));
    assert!(stored.payback_asset_code.starts_with("MUNIPB"));
    // the payback clock starts at release, not at epoch 0, so the fresh
    // monitor sees the project as on track
    assert!(stored.date_last_paid > 0);

    // the pipeline ran exactly once
    assert_eq!(harness.chain.escrow_inits.load(Ordering::SeqCst), 1);
    let deposits = harness.chain.escrow_deposits.lock().unwrap().clone();
    assert_eq!(deposits, vec![(project.index, format!("ESCROW{}", project.index), 1000.0)]);

    // debt/payback instruments issued over acquisition * 12 months
    let issues = harness.chain.recipient_issues.lock().unwrap().clone();
    assert_eq!(issues, vec![(project.index, 60.0, 1000.0)]);
}

#[tokio::test]
async fn unlock_wait_window_expiry_leaves_project_locked() {
    let mut config = test_config();
    config.unlock_wait_secs = 0;
    let harness = Harness::with_config(config);
    let project = harness.seed_project(|p| {
        p.stage = Stage::Selected;
        p.recipient_index = 20;
    });
    harness.seed_investor(1, "alice", 10_000.0);
    harness.seed_recipient(20, "openup");

    harness.engine.invest(project.index, 1, 1000.0, "alice").await.unwrap();

    // give the pipeline a moment to observe the expired window
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stored = harness.store.get_project(project.index);
    assert!(stored.lock);
    assert_eq!(stored.stage, Stage::Selected);
    assert_eq!(harness.chain.escrow_inits.load(Ordering::SeqCst), 0);
    assert_eq!(harness.notifier.count("operator_alert"), 1);
}

#[tokio::test]
async fn unlock_validates_credentials_seed_and_lock_state() {
    let harness = Harness::new();
    let project = harness.seed_project(|p| {
        p.recipient_index = 20;
        p.lock = true;
    });
    let recipient = harness.seed_recipient(20, "openup");

    let err = harness
        .engine
        .unlock_project(&recipient.username, "wrong", project.index, "openup")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Store(StoreError::InvalidCredentials)));

    let err = harness
        .engine
        .unlock_project(&recipient.username, &recipient.pwhash, project.index, "nope")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SeedMismatch));

    harness
        .engine
        .unlock_project(&recipient.username, &recipient.pwhash, project.index, "openup")
        .await
        .unwrap();
    let stored = harness.store.get_project(project.index);
    assert!(!stored.lock);
    assert_eq!(stored.lock_pwd, "openup");

    // unlocking twice: the project is no longer locked
    let err = harness
        .engine
        .unlock_project(&recipient.username, &recipient.pwhash, project.index, "openup")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotLocked(_)));
}

// ─────────────────────────────────────────────────────────
// Payback and distribution
// ─────────────────────────────────────────────────────────

fn funded_project(harness: &Harness) -> crate::types::Project {
    let project = harness.seed_project(|p| {
        p.stage = Stage::Raised;
        p.recipient_index = 20;
        p.escrow_pubkey = "ESCROWX".to_string();
        p.bal_left = 1000.0;
        p.amount_owed = 100.0;
        p.investor_map
            .insert(MockChain::pubkey_for("alice"), 0.6);
        p.investor_map.insert(MockChain::pubkey_for("bob"), 0.4);
    });
    harness.seed_recipient(20, "openup");
    project
}

#[tokio::test]
async fn payback_updates_amortization_state_and_distributes() {
    let harness = Harness::new();
    let project = funded_project(&harness);
    harness.chain.set_payback_pct(0.2);

    harness
        .engine
        .payback(20, project.index, "MUNIPBSOLARF", 100.0, "rseed")
        .await
        .unwrap();

    let stored = harness.store.get_project(project.index);
    assert_eq!(stored.bal_left, 920.0);
    assert_eq!(stored.amount_owed, 0.0);
    assert_eq!(stored.ownership_shift, 0.2);
    assert!(stored.date_last_paid > 0);
    assert_eq!(stored.stage, Stage::Raised);

    // 5% default return rate on 100 paid, split 60/40, always drawn on
    // the project's recorded escrow account
    let sends = harness.chain.escrow_sends.lock().unwrap().clone();
    assert_eq!(sends.len(), 2);
    assert!(sends.iter().all(|(escrow, _, _)| escrow == "ESCROWX"));
    let total: f64 = sends.iter().map(|(_, _, amount)| amount).sum();
    assert!((total - 5.0).abs() < 1e-9);
    assert!(sends.contains(&("ESCROWX".to_string(), MockChain::pubkey_for("alice"), 3.0)));
    assert!(sends.contains(&("ESCROWX".to_string(), MockChain::pubkey_for("bob"), 2.0)));
}

#[tokio::test]
async fn non_positive_payback_is_rejected_without_mutation() {
    let harness = Harness::new();
    let project = funded_project(&harness);
    harness.chain.set_payback_pct(0.2);

    for amount in [-100.0, 0.0] {
        let err = harness
            .engine
            .payback(20, project.index, "MUNIPBSOLARF", amount, "rseed")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NonPositiveAmount(_)));
    }

    let stored = harness.store.get_project(project.index);
    assert_eq!(stored.bal_left, 1000.0);
    assert_eq!(stored.amount_owed, 100.0);
    assert_eq!(stored.ownership_shift, 0.0);
    assert!(harness.chain.escrow_sends.lock().unwrap().is_empty());
}

#[tokio::test]
async fn non_positive_distribution_and_waterfall_amounts_are_rejected() {
    let harness = Harness::new();
    let project = funded_project(&harness);

    let err = harness
        .engine
        .distribute_payments("rseed", project.index, -1.0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NonPositiveAmount(_)));
    assert!(harness.chain.escrow_sends.lock().unwrap().is_empty());

    let err = harness
        .engine
        .add_waterfall_account(project.index, "PK_w", 0.0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NonPositiveAmount(_)));
    assert!(harness.store.get_project(project.index).waterfall_map.is_empty());
}

#[tokio::test]
async fn paying_balance_to_zero_reaches_stage_nine() {
    let harness = Harness::new();
    let project = funded_project(&harness);
    harness.store.update_project(project.index, |p| p.bal_left = 80.0);
    harness.chain.set_payback_pct(0.2);

    harness
        .engine
        .payback(20, project.index, "MUNIPBSOLARF", 100.0, "rseed")
        .await
        .unwrap();

    let stored = harness.store.get_project(project.index);
    assert_eq!(stored.bal_left, 0.0);
    assert_eq!(stored.stage, Stage::PaidOff);
}

#[tokio::test]
async fn full_ownership_zeroes_balance_and_owed_regardless_of_rounding() {
    let harness = Harness::new();
    let project = funded_project(&harness);
    harness.store.update_project(project.index, |p| {
        p.ownership_shift = 0.9;
        p.bal_left = 123.45;
        p.amount_owed = 67.89;
    });
    harness.chain.set_payback_pct(0.2);

    harness
        .engine
        .payback(20, project.index, "MUNIPBSOLARF", 10.0, "rseed")
        .await
        .unwrap();

    let stored = harness.store.get_project(project.index);
    assert_eq!(stored.ownership_shift, 1.0);
    assert_eq!(stored.bal_left, 0.0);
    assert_eq!(stored.amount_owed, 0.0);
    assert_eq!(stored.stage, Stage::PaidOff);
}

#[tokio::test]
async fn locked_escrow_blocks_distribution_entirely() {
    let harness = Harness::new();
    let project = funded_project(&harness);
    harness.store.update_project(project.index, |p| p.escrow_lock = true);

    let err = harness
        .engine
        .distribute_payments("rseed", project.index, 100.0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::EscrowLocked(_)));
    assert!(harness.chain.escrow_sends.lock().unwrap().is_empty());
}

#[tokio::test]
async fn one_unreachable_investor_never_blocks_the_rest() {
    let harness = Harness::new();
    let project = funded_project(&harness);
    harness
        .chain
        .failing_escrow_dests
        .insert(MockChain::pubkey_for("bob"), ());

    let report = harness
        .engine
        .distribute_payments("rseed", project.index, 100.0)
        .await
        .unwrap();

    assert_eq!(report.succeeded, vec![MockChain::pubkey_for("alice")]);
    assert_eq!(report.failed, vec![MockChain::pubkey_for("bob")]);
    let sends = harness.chain.escrow_sends.lock().unwrap().clone();
    assert_eq!(
        sends,
        vec![("ESCROWX".to_string(), MockChain::pubkey_for("alice"), 3.0)]
    );
}

// ─────────────────────────────────────────────────────────
// Payback monitor
// ─────────────────────────────────────────────────────────

fn monitored_project(harness: &Harness, weeks_late: i64) -> crate::types::Project {
    let project = harness.seed_project(|p| {
        p.stage = Stage::Raised;
        p.recipient_index = 20;
        p.guarantor_index = 30;
        p.payback_period_weeks = 1;
        p.escrow_pubkey = "ESCROWX".to_string();
        p.date_last_paid = now() - weeks_late * WEEK;
        p.investor_indices = vec![1, 2, 1];
    });
    harness.seed_recipient(20, "openup");
    harness.seed_investor(1, "alice", 0.0);
    harness.seed_investor(2, "bob", 0.0);
    harness.store.put_entity(Entity {
        index: 30,
        email: "guarantor@example.org".to_string(),
        encrypted_seed: b"gseed".to_vec(),
        first_loss_guarantee_pwd: "flgpwd".to_string(),
        first_loss_guarantee_amt: 300.0,
        ..Entity::default()
    });
    project
}

#[tokio::test]
async fn on_track_cycle_takes_no_action_and_persists_nothing() {
    let harness = Harness::new();
    let project = monitored_project(&harness, 0);

    let band = monitor::cycle(&harness.engine, project.index, 20).await.unwrap();
    assert_eq!(band, Band::OnTrack);
    assert!(harness.notifier.events.lock().unwrap().is_empty());
    // accrual is cumulative-by-recompute; the stored record never moves here
    assert_eq!(harness.store.get_project(project.index).amount_owed, 0.0);
}

#[tokio::test]
async fn gentle_band_sends_only_a_mild_reminder() {
    let harness = Harness::new();
    let project = monitored_project(&harness, 2);

    let band = monitor::cycle(&harness.engine, project.index, 20).await.unwrap();
    assert_eq!(band, Band::Gentle);
    assert_eq!(harness.notifier.count("gentle"), 1);
    assert_eq!(harness.notifier.count("stern"), 0);
}

#[tokio::test]
async fn stern_band_alerts_recipient_investors_and_guarantor() {
    let harness = Harness::new();
    let project = monitored_project(&harness, 5);
    // bob opted out
    harness.store.put_investor(crate::types::Investor {
        notification: false,
        ..harness.store.get_investor(2)
    });

    let band = monitor::cycle(&harness.engine, project.index, 20).await.unwrap();
    assert_eq!(band, Band::Stern);
    assert_eq!(harness.notifier.count("stern"), 1);
    // alice once (indices deduplicated), bob opted out
    assert_eq!(harness.notifier.count("stern_investor"), 1);
    assert_eq!(harness.notifier.count("stern_guarantor"), 1);
    assert!(harness.chain.asset_sends.lock().unwrap().is_empty());
}

#[tokio::test]
async fn disconnection_band_notifies_and_covers_first_loss_clamped() {
    let harness = Harness::new();
    let project = monitored_project(&harness, 10);

    let band = monitor::cycle(&harness.engine, project.index, 20).await.unwrap();
    assert_eq!(band, Band::Disconnect);
    assert_eq!(harness.notifier.count("disconnect_investor"), 2);
    assert_eq!(harness.notifier.count("disconnect_guarantor"), 1);

    // accrued ~1000 owed, clamped to the 300 guarantee ceiling, paid in the
    // test-network settlement asset
    let sends = harness.chain.asset_sends.lock().unwrap().clone();
    assert_eq!(sends.len(), 1);
    let (code, dest, amount) = &sends[0];
    assert_eq!(code, "STABLEUSD");
    assert_eq!(dest, "ESCROWX");
    assert_eq!(*amount, 300.0);
}

#[tokio::test]
async fn archived_project_ends_the_monitor_with_an_alert() {
    let harness = Harness::new();
    let project = monitored_project(&harness, 0);
    harness.store.remove_project(project.index);

    let cancel = harness.engine.shutdown.child_token();
    let handle = tokio::spawn(monitor::run(harness.engine.clone(), project.index, 20, cancel));

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("monitor should exit on its own")
        .unwrap();
    assert_eq!(harness.notifier.count("operator_alert"), 1);
}

#[tokio::test]
async fn shutdown_cancels_the_monitor() {
    let harness = Harness::new();
    let project = monitored_project(&harness, 0);

    let cancel = harness.engine.shutdown.child_token();
    let handle = tokio::spawn(monitor::run(harness.engine.clone(), project.index, 20, cancel));
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.engine.shutdown();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("monitor should honor cancellation")
        .unwrap();
}

// ─────────────────────────────────────────────────────────
// First-loss cover
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn cover_first_loss_clamps_to_the_guarantee_ceiling() {
    let harness = Harness::new();
    let project = monitored_project(&harness, 0);

    harness.engine.cover_first_loss(project.index, 30, 1000.0).await.unwrap();

    let sends = harness.chain.asset_sends.lock().unwrap().clone();
    assert_eq!(sends, vec![("STABLEUSD".to_string(), "ESCROWX".to_string(), 300.0)]);

    // below the ceiling the requested amount passes through untouched
    harness.engine.cover_first_loss(project.index, 30, 40.0).await.unwrap();
    let sends = harness.chain.asset_sends.lock().unwrap().clone();
    assert_eq!(sends[1].2, 40.0);
}

#[tokio::test]
async fn cover_first_loss_rejects_non_positive_requests() {
    let harness = Harness::new();
    let project = monitored_project(&harness, 0);

    // a negative request would slip under the ceiling clamp entirely
    for amount in [-10.0, 0.0] {
        let err = harness
            .engine
            .cover_first_loss(project.index, 30, amount)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NonPositiveAmount(_)));
    }
    assert!(harness.chain.asset_sends.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cover_first_loss_rejects_non_guarantor_entities() {
    let harness = Harness::new();
    let project = monitored_project(&harness, 0);
    harness.store.put_entity(Entity { index: 31, ..Entity::default() });

    let err = harness
        .engine
        .cover_first_loss(project.index, 31, 10.0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::GuarantorMismatch(30, 31)));
    assert!(harness.chain.asset_sends.lock().unwrap().is_empty());
}
