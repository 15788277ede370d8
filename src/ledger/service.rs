//! Credit ledger service
//!
//! Owns the balance-sheet invariants for (enterprise, limit type) pairs.
//! Every mutation runs in one transaction that locks the limit row
//! (`SELECT ... FOR UPDATE`), applies the pure balance kernel, updates the
//! row and appends the journal entry. The lock is the per-limit
//! serialization point.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;
use validator::Validate;

use crate::error::{CoreError, CoreResult};
use crate::events::{DomainEvent, EventBus};
use crate::ledger::balance::{self, Balances};
use crate::ledger::model::{AdjustRequestInput, LimitSnapshot, UsageRequest};
use crate::models::{
    AdjustStatus, CreditLimit, CreditLimitAdjustRequest, CreditLimitUsage, UsageKind,
};

#[derive(Clone)]
pub struct CreditLedgerService {
    pool: PgPool,
    events: EventBus,
}

impl CreditLedgerService {
    pub fn new(pool: PgPool, events: EventBus) -> Self {
        Self { pool, events }
    }

    /// Reserve credit: books `amount` out of available into used.
    pub async fn reserve(&self, caller: Uuid, req: UsageRequest) -> CoreResult<LimitSnapshot> {
        self.apply_usage(caller, UsageKind::Use, req).await
    }

    /// Release previously used credit back to available.
    pub async fn release(&self, caller: Uuid, req: UsageRequest) -> CoreResult<LimitSnapshot> {
        self.apply_usage(caller, UsageKind::Release, req).await
    }

    /// Freeze available capacity without consuming it.
    pub async fn freeze(&self, caller: Uuid, req: UsageRequest) -> CoreResult<LimitSnapshot> {
        self.apply_usage(caller, UsageKind::Freeze, req).await
    }

    /// Return frozen capacity to available.
    pub async fn unfreeze(&self, caller: Uuid, req: UsageRequest) -> CoreResult<LimitSnapshot> {
        self.apply_usage(caller, UsageKind::Unfreeze, req).await
    }

    async fn apply_usage(
        &self,
        caller: Uuid,
        kind: UsageKind,
        req: UsageRequest,
    ) -> CoreResult<LimitSnapshot> {
        req.validate()?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        let limit = sqlx::query_as::<_, CreditLimit>(
            "SELECT * FROM credit_limits WHERE id = $1 FOR UPDATE",
        )
        .bind(req.limit_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("credit limit {}", req.limit_id)))?;

        // Capacity-consuming kinds require a live limit; returning capacity
        // must work regardless of status.
        if matches!(kind, UsageKind::Use | UsageKind::Freeze) && !limit.is_usable(now) {
            return Err(CoreError::StateConflict(format!(
                "credit limit {} is {:?} or outside its effective window",
                limit.id, limit.status
            )));
        }

        let before = Balances::of(&limit);
        let after = balance::apply(before, kind, req.amount)?;

        sqlx::query(
            "UPDATE credit_limits SET used_amount = $1, frozen_amount = $2, updated_at = $3 WHERE id = $4",
        )
        .bind(after.used)
        .bind(after.frozen)
        .bind(now)
        .bind(limit.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO credit_limit_usages (
                id, credit_limit_id, kind, business_ref, amount,
                used_before, used_after, frozen_before, frozen_after,
                operator, anchor_tx_ref, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(limit.id)
        .bind(kind)
        .bind(&req.business_ref)
        .bind(req.amount)
        .bind(before.used)
        .bind(after.used)
        .bind(before.frozen)
        .bind(after.frozen)
        .bind(caller)
        .bind(&req.anchor_tx_ref)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut updated = limit;
        updated.used_amount = after.used;
        updated.frozen_amount = after.frozen;
        let snapshot = LimitSnapshot::from(&updated);

        tracing::info!(
            limit_id = %updated.id,
            ?kind,
            amount = req.amount,
            business_ref = %req.business_ref,
            available = snapshot.available,
            "Credit usage applied"
        );

        self.events.emit(match kind {
            UsageKind::Use => DomainEvent::CreditReserved {
                limit_id: updated.id,
                amount: req.amount,
                business_ref: req.business_ref,
                operator: caller,
                used_after: after.used,
                available_after: snapshot.available,
            },
            UsageKind::Release => DomainEvent::CreditReleased {
                limit_id: updated.id,
                amount: req.amount,
                business_ref: req.business_ref,
                operator: caller,
                used_after: after.used,
            },
            UsageKind::Freeze => DomainEvent::CreditFrozen {
                limit_id: updated.id,
                amount: req.amount,
                business_ref: req.business_ref,
                operator: caller,
                frozen_after: after.frozen,
            },
            UsageKind::Unfreeze => DomainEvent::CreditUnfrozen {
                limit_id: updated.id,
                amount: req.amount,
                business_ref: req.business_ref,
                operator: caller,
                frozen_after: after.frozen,
            },
        });

        Ok(snapshot)
    }

    /// Open a PENDING adjust request against a limit's total.
    pub async fn create_adjust_request(
        &self,
        caller: Uuid,
        input: AdjustRequestInput,
    ) -> CoreResult<CreditLimitAdjustRequest> {
        input.validate()?;
        let now = Utc::now();

        let request = sqlx::query_as::<_, CreditLimitAdjustRequest>(
            r#"
            INSERT INTO credit_limit_adjust_requests (
                id, credit_limit_id, proposed_total, reason, status,
                requested_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.limit_id)
        .bind(input.proposed_total)
        .bind(&input.reason)
        .bind(AdjustStatus::Pending)
        .bind(caller)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            request_id = %request.id,
            limit_id = %input.limit_id,
            proposed_total = input.proposed_total,
            "Adjust request opened"
        );

        Ok(request)
    }

    /// Approve a PENDING adjust request, mutating the limit's total in the
    /// same transaction. Rejects totals below committed capacity.
    pub async fn approve_adjust(
        &self,
        approver: Uuid,
        request_id: Uuid,
    ) -> CoreResult<LimitSnapshot> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let request = sqlx::query_as::<_, CreditLimitAdjustRequest>(
            "SELECT * FROM credit_limit_adjust_requests WHERE id = $1 FOR UPDATE",
        )
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("adjust request {}", request_id)))?;

        if request.status != AdjustStatus::Pending {
            return Err(CoreError::StateConflict(format!(
                "adjust request {} already {:?}",
                request.id, request.status
            )));
        }

        let limit = sqlx::query_as::<_, CreditLimit>(
            "SELECT * FROM credit_limits WHERE id = $1 FOR UPDATE",
        )
        .bind(request.credit_limit_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("credit limit {}", request.credit_limit_id)))?;

        balance::check_new_total(Balances::of(&limit), request.proposed_total)?;

        sqlx::query("UPDATE credit_limits SET total_amount = $1, updated_at = $2 WHERE id = $3")
            .bind(request.proposed_total)
            .bind(now)
            .bind(limit.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE credit_limit_adjust_requests
            SET status = $1, decided_by = $2, decided_at = $3, updated_at = $3
            WHERE id = $4
            "#,
        )
        .bind(AdjustStatus::Approved)
        .bind(approver)
        .bind(now)
        .bind(request.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut updated = limit;
        let old_total = updated.total_amount;
        updated.total_amount = request.proposed_total;

        tracing::info!(
            limit_id = %updated.id,
            request_id = %request.id,
            old_total,
            new_total = updated.total_amount,
            "Credit limit total adjusted"
        );

        self.events.emit(DomainEvent::LimitAdjusted {
            limit_id: updated.id,
            adjust_request_id: request.id,
            old_total,
            new_total: updated.total_amount,
            approver,
        });

        Ok(LimitSnapshot::from(&updated))
    }

    /// Reject a PENDING adjust request; the limit is untouched.
    pub async fn reject_adjust(
        &self,
        approver: Uuid,
        request_id: Uuid,
        note: String,
    ) -> CoreResult<()> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE credit_limit_adjust_requests
            SET status = $1, decided_by = $2, decided_at = $3, decision_note = $4, updated_at = $3
            WHERE id = $5 AND status = $6
            "#,
        )
        .bind(AdjustStatus::Rejected)
        .bind(approver)
        .bind(now)
        .bind(&note)
        .bind(request_id)
        .bind(AdjustStatus::Pending)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::StateConflict(format!(
                "adjust request {} is not pending",
                request_id
            )));
        }

        tracing::info!(request_id = %request_id, "Adjust request rejected");
        Ok(())
    }

    pub async fn get_limit(&self, limit_id: Uuid) -> CoreResult<CreditLimit> {
        sqlx::query_as::<_, CreditLimit>("SELECT * FROM credit_limits WHERE id = $1")
            .bind(limit_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("credit limit {}", limit_id)))
    }

    /// All journal entries for a limit, oldest first.
    pub async fn list_usage(&self, limit_id: Uuid) -> CoreResult<Vec<CreditLimitUsage>> {
        let entries = sqlx::query_as::<_, CreditLimitUsage>(
            "SELECT * FROM credit_limit_usages WHERE credit_limit_id = $1 ORDER BY created_at, id",
        )
        .bind(limit_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// Replay the journal from zero and compare against the stored balances.
    /// A mismatch is an InvariantViolation.
    pub async fn verify_journal(&self, limit_id: Uuid) -> CoreResult<LimitSnapshot> {
        let limit = self.get_limit(limit_id).await?;
        let entries = self.list_usage(limit_id).await?;

        let (used, frozen) = balance::replay(&entries)?;
        if used != limit.used_amount || frozen != limit.frozen_amount {
            return Err(CoreError::InvariantViolation(format!(
                "journal replay for {} computed used {}/frozen {} but row holds {}/{}",
                limit.id, used, frozen, limit.used_amount, limit.frozen_amount
            )));
        }

        Ok(LimitSnapshot::from(&limit))
    }
}
