//! Data models for the PledgeVault core
//!
//! Monetary amounts are integer minor-units (`i64`), rates and ratios are
//! basis points (`i32`). Nothing financial is ever a float.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Credit limit categories
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "credit_limit_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CreditLimitType {
    Financing,
    Guarantee,
    Credit,
}

/// Credit limit lifecycle status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "credit_limit_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CreditLimitStatus {
    Active,
    Frozen,
    Expired,
    Cancelled,
}

/// An enterprise's pre-approved financing capacity for one limit type.
///
/// Balance invariant, checked after every mutation:
/// `0 <= used_amount`, `0 <= frozen_amount`,
/// `used_amount + frozen_amount <= total_amount`.
/// Limits are never deleted; they are retired via `status`.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct CreditLimit {
    pub id: Uuid,
    pub enterprise_id: Uuid,
    pub limit_type: CreditLimitType,
    pub total_amount: i64,
    pub used_amount: i64,
    pub frozen_amount: i64,
    /// Usage-rate percentage at which the warning engine fires.
    pub warning_threshold: i32,
    pub effective_from: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: CreditLimitStatus,
    pub risk_level: i32,
    pub overdue_count: i32,
    pub bad_debt_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CreditLimit {
    /// Remaining capacity. Derived, never stored.
    pub fn available(&self) -> i64 {
        self.total_amount - self.used_amount - self.frozen_amount
    }

    /// Usage rate as a whole percentage, rounded down. Zero-total limits
    /// report 0.
    pub fn usage_rate_pct(&self) -> i64 {
        if self.total_amount == 0 {
            return 0;
        }
        // i128 keeps used * 100 from overflowing near i64::MAX.
        ((self.used_amount as i128 * 100) / self.total_amount as i128) as i64
    }

    /// Whether the usage rate has reached the warning threshold.
    ///
    /// Compares `used * 100 >= total * threshold` so an exact threshold hit
    /// fires without integer-division truncation.
    pub fn needs_warning(&self) -> bool {
        if self.total_amount == 0 {
            return false;
        }
        self.used_amount as i128 * 100
            >= self.total_amount as i128 * self.warning_threshold as i128
    }

    /// Inside the effective window, end-exclusive.
    pub fn is_within_window(&self, now: DateTime<Utc>) -> bool {
        now >= self.effective_from && now < self.expires_at
    }

    /// Usable for new reservations: ACTIVE and inside the window.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.status == CreditLimitStatus::Active && self.is_within_window(now)
    }
}

/// Kind of a usage journal entry
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "usage_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    /// used += amount
    Use,
    /// used -= amount
    Release,
    /// frozen += amount
    Freeze,
    /// frozen -= amount
    Unfreeze,
}

/// One append-only usage journal entry.
///
/// Written in the same transaction as the balance mutation it records.
/// Replaying all entries for a limit in order from zero reproduces its
/// current used/frozen exactly.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct CreditLimitUsage {
    pub id: Uuid,
    pub credit_limit_id: Uuid,
    pub kind: UsageKind,
    pub business_ref: String,
    pub amount: i64,
    pub used_before: i64,
    pub used_after: i64,
    pub frozen_before: i64,
    pub frozen_after: i64,
    pub operator: Uuid,
    pub anchor_tx_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Adjust request workflow status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "adjust_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AdjustStatus {
    Pending,
    Approved,
    Rejected,
}

/// A request to change a limit's total. Approval mutates `total_amount`
/// only, never used/frozen.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct CreditLimitAdjustRequest {
    pub id: Uuid,
    pub credit_limit_id: Uuid,
    pub proposed_total: i64,
    pub reason: String,
    pub status: AdjustStatus,
    pub requested_by: Uuid,
    pub decided_by: Option<Uuid>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decision_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Warehouse receipt custody status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "receipt_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    /// Idle, owner-controlled.
    Normal,
    /// A pledge has been proposed; the owner is locked out.
    Frozen,
    /// The financier holds custody; a loan is active.
    Pledged,
}

/// The subset of a warehouse receipt the custody engine owns.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct WarehouseReceipt {
    pub id: Uuid,
    pub owner_id: Uuid,
    /// Current custody holder's chain address. Changes only as the side
    /// effect of a confirmed endorsement.
    pub holder_address: String,
    pub total_value: i64,
    pub status: ReceiptStatus,
    pub is_financed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Direction of a custody change
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "endorsement_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EndorsementKind {
    Pledge,
    Release,
    Transfer,
}

/// Endorsement lifecycle status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "endorsement_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EndorsementStatus {
    Pending,
    Confirmed,
    Cancelled,
}

/// One intended or confirmed custody change for a receipt: the audit trail
/// for custody, as the usage journal is for money. A receipt has at most one
/// PENDING endorsement at a time.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct Endorsement {
    pub id: Uuid,
    pub receipt_id: Uuid,
    pub kind: EndorsementKind,
    pub status: EndorsementStatus,
    pub from_party: Uuid,
    pub to_party: Uuid,
    pub from_address: String,
    pub to_address: String,
    pub amount: i64,
    /// Requested loan end date; the financing term is derived from it.
    pub due_at: Option<DateTime<Utc>>,
    pub anchor_tx_ref: Option<String>,
    pub anchor_block_ref: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pledge record status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "pledge_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PledgeStatus {
    Active,
    Released,
    /// Terminal; entered on default.
    Liquidated,
}

/// One confirmed pledge. 1:1 with the endorsement that created it and, once
/// released, with the endorsement that released it. A receipt has at most
/// one ACTIVE pledge record.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct PledgeRecord {
    pub id: Uuid,
    pub receipt_id: Uuid,
    pub endorsement_id: Uuid,
    pub release_endorsement_id: Option<Uuid>,
    pub owner_id: Uuid,
    pub financier_id: Uuid,
    pub pledge_amount: i64,
    pub status: PledgeStatus,
    pub pledge_tx_ref: String,
    pub release_tx_ref: Option<String>,
    pub pledged_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Financing record status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "financing_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FinancingStatus {
    Active,
    PaidOff,
    Overdue,
    Defaulted,
}

/// Loan terms derived from a confirmed pledge, 1:1 with its pledge record.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct FinancingRecord {
    pub id: Uuid,
    pub pledge_record_id: Uuid,
    pub principal: i64,
    pub rate_bps: i32,
    /// Simple pro-rata interest: `principal * rate_bps * days / (10_000 * 365)`.
    pub interest: i64,
    /// `principal + interest`; full repayment must cover this.
    pub repayment_amount: i64,
    pub starts_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub status: FinancingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FinancingRecord {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == FinancingStatus::Active && now > self.due_at
    }
}

/// Kind of a chain submission
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "intent_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    Pledge,
    Release,
}

/// Anchor intent lifecycle
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "intent_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    /// Recorded locally; submission not yet made.
    Pending,
    /// Submitted to the chain; tx ref recorded; local transition not applied.
    Submitted,
    /// Local transition committed.
    Applied,
    /// Chain definitively rejected the submission; no local effect.
    Failed,
    /// Crashed before the tx ref was recorded; cannot be completed.
    Abandoned,
}

/// Journal row for one chain submission. Written before the anchor call and
/// finalized in the same transaction as the local transition, so a
/// SUBMITTED intent with a tx ref is always recoverable.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct AnchorIntent {
    pub id: Uuid,
    pub endorsement_id: Uuid,
    pub kind: IntentKind,
    pub status: IntentStatus,
    /// Serialized transition plan; enough to complete the local transition
    /// after a crash.
    pub payload: serde_json::Value,
    pub anchor_tx_ref: Option<String>,
    pub anchor_block_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn limit(total: i64, used: i64, frozen: i64, threshold: i32) -> CreditLimit {
        let now = Utc::now();
        CreditLimit {
            id: Uuid::new_v4(),
            enterprise_id: Uuid::new_v4(),
            limit_type: CreditLimitType::Financing,
            total_amount: total,
            used_amount: used,
            frozen_amount: frozen,
            warning_threshold: threshold,
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

    #[test]
    fn test_available_is_derived() {
        let l = limit(1_000_000, 300_000, 100_000, 80);
        assert_eq!(l.available(), 600_000);
    }

    #[test]
    fn test_usage_rate_rounds_down() {
        let l = limit(3, 1, 0, 80);
        assert_eq!(l.usage_rate_pct(), 33);
    }

    #[test]
    fn test_warning_fires_on_exact_threshold() {
        let l = limit(1_000_000, 800_000, 0, 80);
        assert_eq!(l.usage_rate_pct(), 80);
        assert!(l.needs_warning());
    }

    #[test]
    fn test_warning_quiet_below_threshold() {
        let l = limit(1_000_000, 300_000, 0, 80);
        assert!(!l.needs_warning());
    }

    #[test]
    fn test_zero_total_never_warns() {
        let l = limit(0, 0, 0, 80);
        assert_eq!(l.usage_rate_pct(), 0);
        assert!(!l.needs_warning());
    }

    #[test]
    fn test_window_is_end_exclusive() {
        let mut l = limit(100, 0, 0, 80);
        let now = Utc::now();
        l.effective_from = now - Duration::days(1);
        l.expires_at = now;
        assert!(!l.is_within_window(now));
        assert!(l.is_within_window(now - Duration::seconds(1)));
    }

    #[test]
    fn test_frozen_limit_not_usable() {
        let mut l = limit(100, 0, 0, 80);
        l.status = CreditLimitStatus::Frozen;
        assert!(!l.is_usable(Utc::now()));
    }
}
