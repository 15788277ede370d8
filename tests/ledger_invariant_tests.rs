//! Credit Ledger Invariant Tests
//!
//! These tests exercise the balance kernel and journal replay against the
//! lifecycle scenarios the ledger must uphold, without needing a DB pool.

use chrono::{Duration, Utc};
use uuid::Uuid;

use pledgevault_server::error::CoreError;
use pledgevault_server::ledger::balance::{apply, check_new_total, replay, Balances};
use pledgevault_server::models::{
    CreditLimit, CreditLimitStatus, CreditLimitType, CreditLimitUsage, UsageKind,
};
use pledgevault_server::warning::usage_warning;

fn limit(total: i64, used: i64, frozen: i64) -> CreditLimit {
    let now = Utc::now();
    CreditLimit {
        id: Uuid::new_v4(),
        enterprise_id: Uuid::new_v4(),
        limit_type: CreditLimitType::Financing,
        total_amount: total,
        used_amount: used,
        frozen_amount: frozen,
        warning_threshold: 80,
        effective_from: now - Duration::days(1),
        expires_at: now + Duration::days(365),
        status: CreditLimitStatus::Active,
        risk_level: 0,
        overdue_count: 0,
        bad_debt_count: 0,
        created_at: now,
        updated_at: now,
    }
}

fn journal_entry(
    limit_id: Uuid,
    kind: UsageKind,
    amount: i64,
    used_before: i64,
    used_after: i64,
    frozen_before: i64,
    frozen_after: i64,
) -> CreditLimitUsage {
    CreditLimitUsage {
        id: Uuid::new_v4(),
        credit_limit_id: limit_id,
        kind,
        business_ref: "FIN-001".to_string(),
        amount,
        used_before,
        used_after,
        frozen_before,
        frozen_after,
        operator: Uuid::new_v4(),
        anchor_tx_ref: None,
        created_at: Utc::now(),
    }
}

// ============================================================================
// Reservation Lifecycle Tests
// ============================================================================

#[test]
fn test_reserve_then_warning_crossing() {
    // 1M limit with an 80% warning threshold.
    let mut l = limit(1_000_000, 0, 0);

    // First reservation of 300k: 700k available, no warning.
    let b = apply(Balances::of(&l), UsageKind::Use, 300_000).unwrap();
    l.used_amount = b.used;
    assert_eq!(l.available(), 700_000);
    assert!(usage_warning(&l).is_none());

    // Second reservation of 500k: 800k used, rate exactly 80%, warning fires.
    let b = apply(Balances::of(&l), UsageKind::Use, 500_000).unwrap();
    l.used_amount = b.used;
    assert_eq!(l.used_amount, 800_000);
    assert_eq!(l.usage_rate_pct(), 80);
    assert!(usage_warning(&l).is_some());
}

#[test]
fn test_reserve_beyond_available_is_rejected_whole() {
    let l = limit(1_000_000, 800_000, 150_000);
    let err = apply(Balances::of(&l), UsageKind::Use, 100_000).unwrap_err();
    match err {
        CoreError::InsufficientAvailable {
            available,
            requested,
        } => {
            assert_eq!(available, 50_000);
            assert_eq!(requested, 100_000);
        }
        other => panic!("expected InsufficientAvailable, got {:?}", other),
    }
}

#[test]
fn test_full_reserve_release_cycle_restores_available() {
    let start = Balances {
        total: 500_000,
        used: 0,
        frozen: 0,
    };
    let reserved = apply(start, UsageKind::Use, 200_000).unwrap();
    let frozen = apply(reserved, UsageKind::Freeze, 100_000).unwrap();
    assert_eq!(frozen.available(), 200_000);

    let unfrozen = apply(frozen, UsageKind::Unfreeze, 100_000).unwrap();
    let released = apply(unfrozen, UsageKind::Release, 200_000).unwrap();
    assert_eq!(released, start);
}

#[test]
fn test_freeze_and_use_compete_for_the_same_available() {
    let l = limit(100, 40, 0);
    let b = apply(Balances::of(&l), UsageKind::Freeze, 60).unwrap();
    assert_eq!(b.available(), 0);
    assert!(matches!(
        apply(b, UsageKind::Use, 1),
        Err(CoreError::InsufficientAvailable { .. })
    ));
}

#[test]
fn test_release_more_than_used_never_clamps() {
    let l = limit(1_000, 100, 0);
    let err = apply(Balances::of(&l), UsageKind::Release, 200).unwrap_err();
    assert!(matches!(err, CoreError::InvariantViolation(_)));
}

// ============================================================================
// Total Adjustment Tests
// ============================================================================

#[test]
fn test_adjust_total_must_cover_committed_capacity() {
    let l = limit(1_000_000, 600_000, 300_000);
    let b = Balances::of(&l);

    // Raising is always fine; shrinking to exactly committed is fine.
    assert!(check_new_total(b, 2_000_000).is_ok());
    assert!(check_new_total(b, 900_000).is_ok());

    // Shrinking below used + frozen is rejected.
    assert!(matches!(
        check_new_total(b, 899_999),
        Err(CoreError::Validation(_))
    ));
}

#[test]
fn test_adjust_rejects_negative_total() {
    let b = Balances {
        total: 100,
        used: 0,
        frozen: 0,
    };
    assert!(matches!(
        check_new_total(b, -1),
        Err(CoreError::Validation(_))
    ));
}

// ============================================================================
// Journal Replay Tests
// ============================================================================

#[test]
fn test_replay_reproduces_balances() {
    let id = Uuid::new_v4();
    let entries = vec![
        journal_entry(id, UsageKind::Use, 300_000, 0, 300_000, 0, 0),
        journal_entry(id, UsageKind::Freeze, 100_000, 300_000, 300_000, 0, 100_000),
        journal_entry(id, UsageKind::Use, 500_000, 300_000, 800_000, 100_000, 100_000),
        journal_entry(id, UsageKind::Release, 200_000, 800_000, 600_000, 100_000, 100_000),
        journal_entry(id, UsageKind::Unfreeze, 100_000, 600_000, 600_000, 100_000, 0),
    ];

    assert_eq!(replay(&entries).unwrap(), (600_000, 0));
}

#[test]
fn test_replay_detects_tampered_snapshot() {
    let id = Uuid::new_v4();
    let entries = vec![
        journal_entry(id, UsageKind::Use, 300_000, 0, 300_000, 0, 0),
        // Recorded before-snapshot disagrees with the running balance.
        journal_entry(id, UsageKind::Use, 100_000, 350_000, 450_000, 0, 0),
    ];

    assert!(matches!(
        replay(&entries).unwrap_err(),
        CoreError::InvariantViolation(_)
    ));
}

#[test]
fn test_replay_detects_negative_excursion() {
    let id = Uuid::new_v4();
    let entries = vec![journal_entry(id, UsageKind::Release, 50, 0, -50, 0, 0)];

    assert!(matches!(
        replay(&entries).unwrap_err(),
        CoreError::InvariantViolation(_)
    ));
}

#[test]
fn test_replay_of_empty_journal_is_zero() {
    assert_eq!(replay(&[]).unwrap(), (0, 0));
}
