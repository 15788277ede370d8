//! Warning engine
//!
//! A read-only derived view: scans credit-limit snapshots for threshold
//! crossings and active financings for missed due dates. Idempotent, owns
//! no invariants, never mutates ledger or workflow state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::events::{DomainEvent, EventBus};
use crate::models::{CreditLimit, FinancingRecord};

/// A threshold-crossing observation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    UsageThreshold {
        limit_id: Uuid,
        enterprise_id: Uuid,
        usage_rate_pct: i64,
        threshold_pct: i32,
        available: i64,
    },
    FinancingOverdue {
        financing_id: Uuid,
        pledge_record_id: Uuid,
        receipt_id: Uuid,
        due_at: DateTime<Utc>,
        days_overdue: i64,
    },
}

/// Usage warning predicate; pure.
pub fn usage_warning(limit: &CreditLimit) -> Option<Warning> {
    if !limit.needs_warning() {
        return None;
    }
    Some(Warning::UsageThreshold {
        limit_id: limit.id,
        enterprise_id: limit.enterprise_id,
        usage_rate_pct: limit.usage_rate_pct(),
        threshold_pct: limit.warning_threshold,
        available: limit.available(),
    })
}

/// Overdue warning predicate; pure.
pub fn overdue_warning(
    financing: &FinancingRecord,
    pledge_record_id: Uuid,
    receipt_id: Uuid,
    now: DateTime<Utc>,
) -> Option<Warning> {
    if !financing.is_overdue(now) {
        return None;
    }
    Some(Warning::FinancingOverdue {
        financing_id: financing.id,
        pledge_record_id,
        receipt_id,
        due_at: financing.due_at,
        days_overdue: (now - financing.due_at).num_days(),
    })
}

#[derive(Clone)]
pub struct WarningEngine {
    pool: PgPool,
    events: EventBus,
}

impl WarningEngine {
    pub fn new(pool: PgPool, events: EventBus) -> Self {
        Self { pool, events }
    }

    /// Scan every ACTIVE limit and report threshold crossings.
    pub async fn scan_credit_usage(&self) -> CoreResult<Vec<Warning>> {
        let limits = sqlx::query_as::<_, CreditLimit>(
            "SELECT * FROM credit_limits WHERE status = 'active'",
        )
        .fetch_all(&self.pool)
        .await?;

        let warnings: Vec<Warning> = limits.iter().filter_map(usage_warning).collect();
        self.publish(&warnings);
        Ok(warnings)
    }

    /// Scan every ACTIVE financing record for missed due dates.
    pub async fn scan_overdue_financing(&self) -> CoreResult<Vec<Warning>> {
        let now = Utc::now();

        #[derive(sqlx::FromRow)]
        struct OverdueRow {
            #[sqlx(flatten)]
            financing: FinancingRecord,
            receipt_id: Uuid,
        }

        let rows = sqlx::query_as::<_, OverdueRow>(
            r#"
            SELECT f.*, p.receipt_id
            FROM financing_records f
            JOIN pledge_records p ON p.id = f.pledge_record_id
            WHERE f.status = 'active' AND f.due_at < $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let warnings: Vec<Warning> = rows
            .iter()
            .filter_map(|row| {
                overdue_warning(
                    &row.financing,
                    row.financing.pledge_record_id,
                    row.receipt_id,
                    now,
                )
            })
            .collect();
        self.publish(&warnings);
        Ok(warnings)
    }

    fn publish(&self, warnings: &[Warning]) {
        let now = Utc::now();
        for warning in warnings {
            tracing::warn!(?warning, "Threshold warning raised");
            self.events.emit(DomainEvent::WarningRaised {
                warning: warning.clone(),
                raised_at: now,
            });
        }
    }

    /// Periodic scan driver; runs until the process shuts down.
    pub async fn run_scan_loop(&self, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.scan_credit_usage().await {
                tracing::error!(error = %e, "Credit usage scan errored");
            }
            if let Err(e) = self.scan_overdue_financing().await {
                tracing::error!(error = %e, "Overdue financing scan errored");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreditLimitStatus, CreditLimitType, FinancingStatus};
    use chrono::Duration;

    fn limit(total: i64, used: i64, threshold: i32) -> CreditLimit {
        let now = Utc::now();
        CreditLimit {
            id: Uuid::new_v4(),
            enterprise_id: Uuid::new_v4(),
            limit_type: CreditLimitType::Financing,
            total_amount: total,
            used_amount: used,
            frozen_amount: 0,
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

    fn financing(due_in_days: i64, status: FinancingStatus) -> FinancingRecord {
        let now = Utc::now();
        FinancingRecord {
            id: Uuid::new_v4(),
            pledge_record_id: Uuid::new_v4(),
            principal: 100_000,
            rate_bps: 1_200,
            interest: 2_958,
            repayment_amount: 102_958,
            starts_at: now - Duration::days(90),
            due_at: now + Duration::days(due_in_days),
            status,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_usage_warning_at_and_above_threshold() {
        assert!(usage_warning(&limit(1_000_000, 800_000, 80)).is_some());
        assert!(usage_warning(&limit(1_000_000, 900_000, 80)).is_some());
    }

    #[test]
    fn test_usage_warning_quiet_below_threshold() {
        assert!(usage_warning(&limit(1_000_000, 799_999, 80)).is_none());
    }

    #[test]
    fn test_overdue_counts_whole_days() {
        let f = financing(-3, FinancingStatus::Active);
        let now = Utc::now();
        match overdue_warning(&f, Uuid::nil(), Uuid::nil(), now) {
            Some(Warning::FinancingOverdue { days_overdue, .. }) => {
                assert!(days_overdue == 2 || days_overdue == 3)
            }
            other => panic!("expected overdue warning, got {:?}", other),
        }
    }

    #[test]
    fn test_paid_off_financing_never_overdue() {
        let f = financing(-30, FinancingStatus::PaidOff);
        assert!(overdue_warning(&f, Uuid::nil(), Uuid::nil(), Utc::now()).is_none());
    }

    #[test]
    fn test_future_due_date_not_overdue() {
        let f = financing(5, FinancingStatus::Active);
        assert!(overdue_warning(&f, Uuid::nil(), Uuid::nil(), Utc::now()).is_none());
    }
}
