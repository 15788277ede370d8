//! Request and response types for the credit ledger

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::CreditLimit;

/// Common shape of reserve/release/freeze/unfreeze requests.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UsageRequest {
    pub limit_id: Uuid,
    /// Minor-units; must be positive.
    #[validate(range(min = 1))]
    pub amount: i64,
    /// Opaque reference to the business document driving the change.
    #[validate(length(min = 1, max = 64))]
    pub business_ref: String,
    /// Carried onto the journal entry when the change mirrors a chain leg.
    pub anchor_tx_ref: Option<String>,
}

/// Open an adjust request against a limit's total.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AdjustRequestInput {
    pub limit_id: Uuid,
    #[validate(range(min = 0))]
    pub proposed_total: i64,
    #[validate(length(min = 1, max = 512))]
    pub reason: String,
}

/// Point-in-time view of a limit returned by every mutating operation.
#[derive(Debug, Clone, Serialize)]
pub struct LimitSnapshot {
    pub limit_id: Uuid,
    pub enterprise_id: Uuid,
    pub total: i64,
    pub used: i64,
    pub frozen: i64,
    pub available: i64,
    pub usage_rate_pct: i64,
    pub needs_warning: bool,
}

impl From<&CreditLimit> for LimitSnapshot {
    fn from(limit: &CreditLimit) -> Self {
        Self {
            limit_id: limit.id,
            enterprise_id: limit.enterprise_id,
            total: limit.total_amount,
            used: limit.used_amount,
            frozen: limit.frozen_amount,
            available: limit.available(),
            usage_rate_pct: limit.usage_rate_pct(),
            needs_warning: limit.needs_warning(),
        }
    }
}
