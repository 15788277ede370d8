//! Request types for the pledge workflow

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

/// Owner proposes a pledge of their receipt.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct InitiateRequest {
    pub receipt_id: Uuid,
    pub financier_id: Uuid,
    #[validate(length(min = 1, max = 128))]
    pub financier_address: String,
    /// Requested pledge amount, minor-units.
    #[validate(range(min = 1))]
    pub amount: i64,
    /// Requested loan end date; the financing term derives from it.
    pub due_at: DateTime<Utc>,
}

/// Financier accepts a pending proposal with concrete terms.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AcceptRequest {
    pub endorsement_id: Uuid,
    #[validate(range(min = 1))]
    pub approved_amount: i64,
    #[validate(range(min = 0, max = 10_000))]
    pub rate_bps: i32,
}

/// Financier rejects a pending proposal.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RejectRequest {
    pub endorsement_id: Uuid,
    #[validate(length(min = 1, max = 512))]
    pub reason: String,
}

/// Owner repays in full and asks for custody back.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ReleaseRequest {
    pub receipt_id: Uuid,
    /// Offered repayment, minor-units; must cover the financing record's
    /// repayment amount.
    #[validate(range(min = 1))]
    pub repay_amount: i64,
}
