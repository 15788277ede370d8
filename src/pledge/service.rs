//! Pledge workflow service
//!
//! Drives the custody state machine over warehouse receipts. Local-only
//! transitions (initiate, reject, cancel) commit in a single transaction.
//! Chain-coordinated transitions (accept, release) follow a strict order:
//! journal an anchor intent, submit to the chain, await the receipt with no
//! database transaction open, then finalize locally in one transaction that
//! compare-and-sets the guarded row. An anchor failure leaves no local state
//! behind; a local failure after a confirmed anchor leaves a SUBMITTED
//! intent for the reconciliation pass.

use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;
use validator::Validate;

use crate::anchor::{AnchorError, AnchorReceipt, ChainAnchor, TxRef};
use crate::error::{CoreError, CoreResult};
use crate::events::{DomainEvent, EventBus};
use crate::models::{
    AnchorIntent, Endorsement, EndorsementStatus, FinancingRecord, IntentKind, IntentStatus,
    PledgeRecord, WarehouseReceipt,
};
use crate::pledge::model::{AcceptRequest, InitiateRequest, RejectRequest, ReleaseRequest};
use crate::pledge::transitions::{self, AcceptPlan, ReleasePlan};

#[derive(Clone)]
pub struct PledgeWorkflowService {
    pub(crate) pool: PgPool,
    pub(crate) anchor: Arc<dyn ChainAnchor>,
    pub(crate) events: EventBus,
    pledge_ratio_bps: i32,
}

impl PledgeWorkflowService {
    pub fn new(
        pool: PgPool,
        anchor: Arc<dyn ChainAnchor>,
        events: EventBus,
        pledge_ratio_bps: i32,
    ) -> Self {
        Self {
            pool,
            anchor,
            events,
            pledge_ratio_bps,
        }
    }

    /// NORMAL -> FROZEN: owner proposes a pledge. Purely local.
    pub async fn initiate(&self, caller: Uuid, req: InitiateRequest) -> CoreResult<Endorsement> {
        req.validate()?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        let receipt = sqlx::query_as::<_, WarehouseReceipt>(
            "SELECT * FROM warehouse_receipts WHERE id = $1 FOR UPDATE",
        )
        .bind(req.receipt_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("receipt {}", req.receipt_id)))?;

        let has_pending: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM endorsements WHERE receipt_id = $1 AND status = 'pending')",
        )
        .bind(receipt.id)
        .fetch_one(&mut *tx)
        .await?;

        let input = transitions::InitiateInput {
            financier_id: req.financier_id,
            financier_address: req.financier_address,
            amount: req.amount,
            due_at: req.due_at,
        };
        let plan = transitions::plan_initiate(
            &receipt,
            caller,
            &input,
            self.pledge_ratio_bps,
            has_pending,
            now,
        )?;

        let e = &plan.endorsement;
        sqlx::query(
            r#"
            INSERT INTO endorsements (
                id, receipt_id, kind, status, from_party, to_party,
                from_address, to_address, amount, due_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
            "#,
        )
        .bind(e.id)
        .bind(e.receipt_id)
        .bind(e.kind)
        .bind(e.status)
        .bind(e.from_party)
        .bind(e.to_party)
        .bind(&e.from_address)
        .bind(&e.to_address)
        .bind(e.amount)
        .bind(e.due_at)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            map_constraint(err, "uniq_pending_endorsement_per_receipt", || {
                CoreError::StateConflict(format!(
                    "receipt {} already has a pending endorsement",
                    receipt.id
                ))
            })
        })?;

        sqlx::query("UPDATE warehouse_receipts SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(plan.receipt_status)
            .bind(now)
            .bind(receipt.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            receipt_id = %receipt.id,
            endorsement_id = %e.id,
            amount = e.amount,
            "Pledge initiated, receipt frozen"
        );

        self.events.emit(DomainEvent::PledgeInitiated {
            receipt_id: receipt.id,
            endorsement_id: e.id,
            owner_id: e.from_party,
            financier_id: e.to_party,
            amount: e.amount,
        });

        Ok(plan.endorsement)
    }

    /// FROZEN -> PLEDGED: financier accepts with concrete terms. Anchors the
    /// custody transfer before any local state changes.
    pub async fn accept(
        &self,
        caller: Uuid,
        req: AcceptRequest,
    ) -> CoreResult<(PledgeRecord, FinancingRecord)> {
        req.validate()?;
        let now = Utc::now();

        let endorsement = self.get_endorsement(req.endorsement_id).await?;
        let receipt = self.get_receipt(endorsement.receipt_id).await?;

        let plan = transitions::plan_accept(
            &receipt,
            &endorsement,
            caller,
            req.approved_amount,
            req.rate_bps,
            now,
        )?;

        let payload = serde_json::to_value(&plan)
            .map_err(|e| CoreError::Validation(format!("unserializable plan: {}", e)))?;
        let intent_id = self
            .create_intent(endorsement.id, IntentKind::Pledge, payload)
            .await?;

        let chain_receipt = self.anchor_round_trip(intent_id, &plan.anchor_op).await?;

        let result = self.finalize_accept(&plan, &chain_receipt, intent_id).await;
        if let Err(CoreError::StaleState(_)) = &result {
            // A confirmed anchor leg with a lost CAS is a conflict the books
            // must not absorb silently.
            self.mark_intent_failed(intent_id, "endorsement changed after anchor confirmation")
                .await?;
            tracing::error!(
                endorsement_id = %endorsement.id,
                tx_ref = %chain_receipt.tx_ref,
                "Anchored pledge leg lost the endorsement CAS"
            );
        }
        result
    }

    pub(crate) async fn finalize_accept(
        &self,
        plan: &AcceptPlan,
        chain: &AnchorReceipt,
        intent_id: Uuid,
    ) -> CoreResult<(PledgeRecord, FinancingRecord)> {
        let now = Utc::now();
        let (pledge, financing) = plan.records(chain, now);

        let mut tx = self.pool.begin().await?;

        // Re-read under lock; the guard makes a re-apply of the same
        // confirmed leg a StaleState no-op instead of a double write.
        let current = sqlx::query_as::<_, Endorsement>(
            "SELECT * FROM endorsements WHERE id = $1 FOR UPDATE",
        )
        .bind(plan.endorsement_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("endorsement {}", plan.endorsement_id)))?;
        transitions::confirm_accept_guard(&current)?;

        sqlx::query(
            r#"
            UPDATE endorsements
            SET status = 'confirmed', anchor_tx_ref = $1, anchor_block_ref = $2, updated_at = $3
            WHERE id = $4
            "#,
        )
        .bind(&chain.tx_ref.0)
        .bind(&chain.block_ref)
        .bind(now)
        .bind(plan.endorsement_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE warehouse_receipts
            SET status = 'pledged', holder_address = $1, is_financed = TRUE, updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(&plan.financier_address)
        .bind(now)
        .bind(plan.receipt_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO pledge_records (
                id, receipt_id, endorsement_id, owner_id, financier_id,
                pledge_amount, status, pledge_tx_ref, pledged_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            "#,
        )
        .bind(pledge.id)
        .bind(pledge.receipt_id)
        .bind(pledge.endorsement_id)
        .bind(pledge.owner_id)
        .bind(pledge.financier_id)
        .bind(pledge.pledge_amount)
        .bind(pledge.status)
        .bind(&pledge.pledge_tx_ref)
        .bind(pledge.pledged_at)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            map_constraint(err, "uniq_active_pledge_per_receipt", || {
                CoreError::StaleState(format!(
                    "receipt {} already has an active pledge",
                    pledge.receipt_id
                ))
            })
        })?;

        sqlx::query(
            r#"
            INSERT INTO financing_records (
                id, pledge_record_id, principal, rate_bps, interest,
                repayment_amount, starts_at, due_at, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            "#,
        )
        .bind(financing.id)
        .bind(financing.pledge_record_id)
        .bind(financing.principal)
        .bind(financing.rate_bps)
        .bind(financing.interest)
        .bind(financing.repayment_amount)
        .bind(financing.starts_at)
        .bind(financing.due_at)
        .bind(financing.status)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        self.mark_intent_applied(&mut tx, intent_id, &chain.block_ref)
            .await?;

        tx.commit().await?;

        tracing::info!(
            receipt_id = %plan.receipt_id,
            endorsement_id = %plan.endorsement_id,
            pledge_record_id = %pledge.id,
            principal = financing.principal,
            repayment = financing.repayment_amount,
            tx_ref = %chain.tx_ref,
            "Pledge confirmed"
        );

        self.events.emit(DomainEvent::PledgeConfirmed {
            receipt_id: plan.receipt_id,
            endorsement_id: plan.endorsement_id,
            pledge_record_id: pledge.id,
            financing_record_id: financing.id,
            principal: financing.principal,
            anchor_tx_ref: chain.tx_ref.0.clone(),
        });

        Ok((pledge, financing))
    }

    /// FROZEN -> NORMAL: financier declines. Purely local, and barred once
    /// an anchor submission for the endorsement is in flight.
    pub async fn reject(&self, caller: Uuid, req: RejectRequest) -> CoreResult<()> {
        req.validate()?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        // Lock the endorsement row; intent creation takes the same lock, so
        // a racing accept either sees this rejection or blocks it here.
        let endorsement = sqlx::query_as::<_, Endorsement>(
            "SELECT * FROM endorsements WHERE id = $1 FOR UPDATE",
        )
        .bind(req.endorsement_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("endorsement {}", req.endorsement_id)))?;

        let receipt = sqlx::query_as::<_, WarehouseReceipt>(
            "SELECT * FROM warehouse_receipts WHERE id = $1 FOR UPDATE",
        )
        .bind(endorsement.receipt_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("receipt {}", endorsement.receipt_id)))?;

        let intent_in_flight = self.intent_in_flight(&mut tx, endorsement.id).await?;
        transitions::plan_reject(&receipt, &endorsement, caller, &req.reason, intent_in_flight)?;

        sqlx::query(
            r#"
            UPDATE endorsements
            SET status = 'cancelled', cancel_reason = $1, updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(&req.reason)
        .bind(now)
        .bind(endorsement.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE warehouse_receipts SET status = 'normal', updated_at = $1 WHERE id = $2")
            .bind(now)
            .bind(receipt.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            receipt_id = %receipt.id,
            endorsement_id = %endorsement.id,
            reason = %req.reason,
            "Pledge rejected, receipt back to normal"
        );

        self.events.emit(DomainEvent::PledgeRejected {
            receipt_id: receipt.id,
            endorsement_id: endorsement.id,
            reason: req.reason,
        });

        Ok(())
    }

    /// FROZEN -> NORMAL: owner withdraws their own proposal. Permitted only
    /// before any anchor submission began.
    pub async fn cancel(&self, caller: Uuid, endorsement_id: Uuid) -> CoreResult<()> {
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        // Same lock order as reject and intent creation.
        let endorsement = sqlx::query_as::<_, Endorsement>(
            "SELECT * FROM endorsements WHERE id = $1 FOR UPDATE",
        )
        .bind(endorsement_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("endorsement {}", endorsement_id)))?;

        let intent_in_flight = self.intent_in_flight(&mut tx, endorsement.id).await?;
        transitions::plan_cancel(&endorsement, caller, intent_in_flight)?;

        sqlx::query(
            r#"
            UPDATE endorsements
            SET status = 'cancelled', cancel_reason = 'withdrawn by owner', updated_at = $1
            WHERE id = $2
            "#,
        )
        .bind(now)
        .bind(endorsement.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE warehouse_receipts SET status = 'normal', updated_at = $1 WHERE id = $2")
            .bind(now)
            .bind(endorsement.receipt_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            receipt_id = %endorsement.receipt_id,
            endorsement_id = %endorsement.id,
            "Pledge withdrawn by owner"
        );

        self.events.emit(DomainEvent::PledgeCancelled {
            receipt_id: endorsement.receipt_id,
            endorsement_id: endorsement.id,
        });

        Ok(())
    }

    /// PLEDGED -> NORMAL: owner repays in full. Anchors the custody
    /// reversion before any local state changes.
    pub async fn release(&self, caller: Uuid, req: ReleaseRequest) -> CoreResult<PledgeRecord> {
        req.validate()?;

        let receipt = self.get_receipt(req.receipt_id).await?;
        let pledge = sqlx::query_as::<_, PledgeRecord>(
            "SELECT * FROM pledge_records WHERE receipt_id = $1 AND status = 'active'",
        )
        .bind(receipt.id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("active pledge for receipt {}", receipt.id)))?;
        let financing = sqlx::query_as::<_, FinancingRecord>(
            "SELECT * FROM financing_records WHERE pledge_record_id = $1",
        )
        .bind(pledge.id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("financing for pledge {}", pledge.id)))?;
        let pledge_endorsement = self.get_endorsement(pledge.endorsement_id).await?;

        let plan = transitions::plan_release(
            &receipt,
            &pledge_endorsement,
            &pledge,
            &financing,
            caller,
            req.repay_amount,
        )?;

        let payload = serde_json::to_value(&plan)
            .map_err(|e| CoreError::Validation(format!("unserializable plan: {}", e)))?;
        let intent_id = self
            .create_intent(pledge_endorsement.id, IntentKind::Release, payload)
            .await?;

        let chain_receipt = self.anchor_round_trip(intent_id, &plan.anchor_op).await?;

        let result = self.finalize_release(&plan, &chain_receipt, intent_id).await;
        if let Err(CoreError::StaleState(_)) = &result {
            self.mark_intent_failed(intent_id, "pledge record changed after anchor confirmation")
                .await?;
            tracing::error!(
                pledge_record_id = %pledge.id,
                tx_ref = %chain_receipt.tx_ref,
                "Anchored release leg lost the pledge-record CAS"
            );
        }
        result
    }

    pub(crate) async fn finalize_release(
        &self,
        plan: &ReleasePlan,
        chain: &AnchorReceipt,
        intent_id: Uuid,
    ) -> CoreResult<PledgeRecord> {
        let now = Utc::now();
        let release = plan.release_endorsement(chain, now);

        let mut tx = self.pool.begin().await?;

        // Same re-read-under-lock pattern as finalize_accept.
        let current = sqlx::query_as::<_, PledgeRecord>(
            "SELECT * FROM pledge_records WHERE id = $1 FOR UPDATE",
        )
        .bind(plan.pledge_record_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            CoreError::NotFound(format!("pledge record {}", plan.pledge_record_id))
        })?;
        transitions::confirm_release_guard(&current)?;

        sqlx::query(
            r#"
            UPDATE pledge_records
            SET status = 'released', release_endorsement_id = $1, release_tx_ref = $2,
                released_at = $3, updated_at = $3
            WHERE id = $4
            "#,
        )
        .bind(release.id)
        .bind(&chain.tx_ref.0)
        .bind(now)
        .bind(plan.pledge_record_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO endorsements (
                id, receipt_id, kind, status, from_party, to_party,
                from_address, to_address, amount, anchor_tx_ref, anchor_block_ref,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
            "#,
        )
        .bind(release.id)
        .bind(release.receipt_id)
        .bind(release.kind)
        .bind(release.status)
        .bind(release.from_party)
        .bind(release.to_party)
        .bind(&release.from_address)
        .bind(&release.to_address)
        .bind(release.amount)
        .bind(&release.anchor_tx_ref)
        .bind(&release.anchor_block_ref)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE financing_records SET status = 'paid_off', updated_at = $1 WHERE pledge_record_id = $2",
        )
        .bind(now)
        .bind(plan.pledge_record_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE warehouse_receipts
            SET status = 'normal', holder_address = $1, is_financed = FALSE, updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(&plan.restored_holder)
        .bind(now)
        .bind(plan.receipt_id)
        .execute(&mut *tx)
        .await?;

        self.mark_intent_applied(&mut tx, intent_id, &chain.block_ref)
            .await?;

        tx.commit().await?;

        tracing::info!(
            receipt_id = %plan.receipt_id,
            pledge_record_id = %plan.pledge_record_id,
            repay_amount = plan.repay_amount,
            tx_ref = %chain.tx_ref,
            "Pledge released, custody reverted"
        );

        self.events.emit(DomainEvent::PledgeReleased {
            receipt_id: plan.receipt_id,
            endorsement_id: release.id,
            pledge_record_id: plan.pledge_record_id,
            repay_amount: plan.repay_amount,
            anchor_tx_ref: chain.tx_ref.0.clone(),
        });

        let released = sqlx::query_as::<_, PledgeRecord>(
            "SELECT * FROM pledge_records WHERE id = $1",
        )
        .bind(plan.pledge_record_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(released)
    }

    // ===== Anchor intent journal =====

    /// Journal the intent, submit, and await confirmation. No database
    /// transaction is open across either anchor call. Any failure marks the
    /// intent FAILED with no other local effect.
    async fn anchor_round_trip(
        &self,
        intent_id: Uuid,
        op: &crate::anchor::AnchorOp,
    ) -> CoreResult<AnchorReceipt> {
        let tx_ref = match self.anchor.submit(op).await {
            Ok(r) => r,
            Err(e) => {
                self.mark_intent_failed(intent_id, &e.to_string()).await?;
                return Err(e.into());
            }
        };

        self.mark_intent_submitted(intent_id, &tx_ref).await?;

        let chain_receipt = match self.anchor.await_receipt(&tx_ref).await {
            Ok(r) => r,
            Err(e) if e.is_indeterminate() => {
                // The chain may still commit; the reconciliation pass will
                // resolve this intent by tx ref.
                tracing::warn!(
                    intent_id = %intent_id,
                    tx_ref = %tx_ref,
                    error = %e,
                    "Anchor confirmation unresolved, intent left submitted"
                );
                return Err(e.into());
            }
            Err(e) => {
                self.mark_intent_failed(intent_id, &e.to_string()).await?;
                return Err(e.into());
            }
        };

        if !chain_receipt.success {
            let reason = chain_receipt
                .revert_reason
                .clone()
                .unwrap_or_else(|| "reverted".to_string());
            self.mark_intent_failed(intent_id, &reason).await?;
            return Err(AnchorError::Reverted(reason).into());
        }

        Ok(chain_receipt)
    }

    /// Journal a new intent. Locks the endorsement row and re-verifies its
    /// status first: once this commits, reject and cancel are barred, so the
    /// endorsement must not have been cancelled underneath the caller's
    /// earlier snapshot read.
    async fn create_intent(
        &self,
        endorsement_id: Uuid,
        kind: IntentKind,
        payload: serde_json::Value,
    ) -> CoreResult<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        let status: EndorsementStatus = sqlx::query_scalar(
            "SELECT status FROM endorsements WHERE id = $1 FOR UPDATE",
        )
        .bind(endorsement_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("endorsement {}", endorsement_id)))?;

        // A pledge leg anchors a PENDING endorsement; a release leg anchors
        // the already-CONFIRMED pledge endorsement.
        let expected = match kind {
            IntentKind::Pledge => EndorsementStatus::Pending,
            IntentKind::Release => EndorsementStatus::Confirmed,
        };
        if status != expected {
            return Err(CoreError::StaleState(format!(
                "endorsement {} is {:?}, expected {:?} before a {:?} submission",
                endorsement_id, status, expected, kind
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO anchor_intents (id, endorsement_id, kind, status, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            "#,
        )
        .bind(id)
        .bind(endorsement_id)
        .bind(kind)
        .bind(IntentStatus::Pending)
        .bind(payload)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            map_constraint(err, "uniq_inflight_intent_per_endorsement", || {
                CoreError::StaleState(format!(
                    "endorsement {} already has an anchor submission in flight",
                    endorsement_id
                ))
            })
        })?;

        tx.commit().await?;
        Ok(id)
    }

    async fn intent_in_flight(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        endorsement_id: Uuid,
    ) -> CoreResult<bool> {
        let in_flight: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM anchor_intents
                WHERE endorsement_id = $1 AND status IN ('pending', 'submitted')
            )
            "#,
        )
        .bind(endorsement_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(in_flight)
    }

    async fn mark_intent_submitted(&self, intent_id: Uuid, tx_ref: &TxRef) -> CoreResult<()> {
        sqlx::query(
            "UPDATE anchor_intents SET status = 'submitted', anchor_tx_ref = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(&tx_ref.0)
        .bind(Utc::now())
        .bind(intent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(crate) async fn mark_intent_failed(
        &self,
        intent_id: Uuid,
        reason: &str,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE anchor_intents SET status = 'failed', failure_reason = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(intent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_intent_applied(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        intent_id: Uuid,
        block_ref: &str,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE anchor_intents SET status = 'applied', anchor_block_ref = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(block_ref)
        .bind(Utc::now())
        .bind(intent_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    // ===== Lookups =====

    pub(crate) async fn get_endorsement(&self, id: Uuid) -> CoreResult<Endorsement> {
        sqlx::query_as::<_, Endorsement>("SELECT * FROM endorsements WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("endorsement {}", id)))
    }

    pub(crate) async fn get_receipt(&self, id: Uuid) -> CoreResult<WarehouseReceipt> {
        sqlx::query_as::<_, WarehouseReceipt>("SELECT * FROM warehouse_receipts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("receipt {}", id)))
    }

    pub async fn list_intents(&self, status: IntentStatus) -> CoreResult<Vec<AnchorIntent>> {
        let intents = sqlx::query_as::<_, AnchorIntent>(
            "SELECT * FROM anchor_intents WHERE status = $1 ORDER BY created_at",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(intents)
    }
}

/// Map a unique-constraint violation onto a domain error; pass everything
/// else through as a database error.
fn map_constraint(
    err: sqlx::Error,
    constraint: &str,
    domain: impl FnOnce() -> CoreError,
) -> CoreError {
    if let sqlx::Error::Database(ref db) = err {
        if db.constraint() == Some(constraint) {
            return domain();
        }
    }
    CoreError::Database(err)
}
