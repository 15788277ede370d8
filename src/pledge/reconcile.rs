//! Anchor reconciliation pass
//!
//! The dangerous window is a local-store failure after a successful anchor
//! call: the chain has committed but the local transition never landed. Each
//! such case leaves a SUBMITTED anchor intent carrying its tx ref and the
//! serialized transition plan, and this pass completes them. Finalization is
//! idempotent: the endorsement/pledge-record status guard makes a second
//! apply a StaleState no-op, and an intent only reaches APPLIED in the same
//! transaction as the transition itself.

use chrono::{Duration, Utc};
use serde::Serialize;

use crate::anchor::{AnchorError, AnchorReceipt, TxRef};
use crate::error::{CoreError, CoreResult};
use crate::models::{AnchorIntent, IntentKind};
use crate::pledge::service::PledgeWorkflowService;
use crate::pledge::transitions::{AcceptPlan, ReleasePlan};

/// Outcome counts of one reconciliation pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconcileSummary {
    pub applied: u32,
    pub failed: u32,
    pub abandoned: u32,
    pub still_pending: u32,
}

/// The transition plan journaled with an intent.
#[derive(Debug)]
enum IntentPlan {
    Pledge(Box<AcceptPlan>),
    Release(Box<ReleasePlan>),
}

/// What one reconciliation step should do with a submitted intent.
#[derive(Debug)]
enum IntentResolution {
    /// Confirmed on chain: complete the local transition.
    Apply {
        plan: IntentPlan,
        chain_receipt: AnchorReceipt,
    },
    /// Definitively rejected on chain: close the intent out.
    Fail(String),
    /// Outcome still unknown: leave SUBMITTED for the next pass.
    Retry,
}

/// Pure decision step: map a confirmation attempt onto the action to take.
/// Only a revert (as an error or an unsuccessful receipt) is terminal;
/// indeterminate errors keep the intent open. A payload that no longer
/// deserializes is fatal, since the journaled plan is the only way to
/// complete the transition.
fn resolve_confirmation(
    intent: &AnchorIntent,
    outcome: Result<AnchorReceipt, AnchorError>,
) -> CoreResult<IntentResolution> {
    let chain_receipt = match outcome {
        Ok(r) if r.success => r,
        Ok(r) => {
            let reason = r.revert_reason.unwrap_or_else(|| "reverted".to_string());
            return Ok(IntentResolution::Fail(reason));
        }
        Err(e) if e.is_indeterminate() => return Ok(IntentResolution::Retry),
        Err(e) => return Ok(IntentResolution::Fail(e.to_string())),
    };

    let payload_err = |e: serde_json::Error| {
        CoreError::InvariantViolation(format!(
            "intent {} payload does not deserialize: {}",
            intent.id, e
        ))
    };
    let plan = match intent.kind {
        IntentKind::Pledge => IntentPlan::Pledge(Box::new(
            serde_json::from_value(intent.payload.clone()).map_err(payload_err)?,
        )),
        IntentKind::Release => IntentPlan::Release(Box::new(
            serde_json::from_value(intent.payload.clone()).map_err(payload_err)?,
        )),
    };

    Ok(IntentResolution::Apply {
        plan,
        chain_receipt,
    })
}

impl PledgeWorkflowService {
    /// Run one reconciliation pass over intents older than `grace`.
    ///
    /// SUBMITTED intents are re-confirmed by tx ref and finalized or failed.
    /// PENDING intents past the grace period crashed before their tx ref was
    /// recorded; they cannot be completed and are marked ABANDONED. The
    /// chain may still have committed, which operators must resolve by hand.
    pub async fn reconcile_pass(&self, grace: Duration) -> CoreResult<ReconcileSummary> {
        let cutoff = Utc::now() - grace;
        let mut summary = ReconcileSummary::default();

        let stale_submitted = sqlx::query_as::<_, AnchorIntent>(
            "SELECT * FROM anchor_intents WHERE status = 'submitted' AND updated_at < $1 ORDER BY created_at",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        for intent in stale_submitted {
            match self.reconcile_submitted(&intent).await {
                Ok(true) => summary.applied += 1,
                Ok(false) => summary.still_pending += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        intent_id = %intent.id,
                        endorsement_id = %intent.endorsement_id,
                        error = %e,
                        "Reconciliation of submitted intent failed"
                    );
                }
            }
        }

        let abandoned = sqlx::query(
            r#"
            UPDATE anchor_intents
            SET status = 'abandoned', failure_reason = 'no tx ref recorded before crash', updated_at = $1
            WHERE status = 'pending' AND updated_at < $2
            "#,
        )
        .bind(Utc::now())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        summary.abandoned = abandoned.rows_affected() as u32;
        if summary.abandoned > 0 {
            tracing::warn!(
                count = summary.abandoned,
                "Abandoned anchor intents without tx refs; chain may hold unmatched submissions"
            );
        }

        if summary.applied + summary.failed + summary.abandoned > 0 {
            tracing::info!(?summary, "Reconciliation pass completed");
        }

        Ok(summary)
    }

    /// Returns Ok(true) when the local transition was applied, Ok(false)
    /// when the intent should stay SUBMITTED for the next pass or was
    /// closed out as failed.
    async fn reconcile_submitted(&self, intent: &AnchorIntent) -> CoreResult<bool> {
        let Some(tx_ref) = intent.anchor_tx_ref.clone() else {
            // Submitted without a ref should be impossible; treat like a
            // pending crash.
            self.mark_intent_failed(intent.id, "submitted intent carries no tx ref")
                .await?;
            return Ok(false);
        };
        let tx_ref = TxRef(tx_ref);

        let outcome = self.anchor.await_receipt(&tx_ref).await;
        match resolve_confirmation(intent, outcome)? {
            IntentResolution::Retry => Ok(false),
            IntentResolution::Fail(reason) => {
                self.mark_intent_failed(intent.id, &reason).await?;
                Ok(false)
            }
            IntentResolution::Apply {
                plan,
                chain_receipt,
            } => {
                match plan {
                    IntentPlan::Pledge(p) => {
                        self.finalize_accept(&p, &chain_receipt, intent.id).await?;
                    }
                    IntentPlan::Release(p) => {
                        self.finalize_release(&p, &chain_receipt, intent.id).await?;
                    }
                }
                tracing::info!(
                    intent_id = %intent.id,
                    endorsement_id = %intent.endorsement_id,
                    tx_ref = %tx_ref,
                    "Completed local transition for confirmed anchor leg"
                );
                Ok(true)
            }
        }
    }

    /// Periodic reconciliation driver; runs until the process shuts down.
    pub async fn run_reconcile_loop(&self, interval: std::time::Duration, grace: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.reconcile_pass(grace).await {
                tracing::error!(error = %e, "Reconciliation pass errored");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::AnchorOp;
    use crate::models::IntentStatus;
    use uuid::Uuid;

    fn accept_plan() -> AcceptPlan {
        let now = Utc::now();
        AcceptPlan {
            receipt_id: Uuid::new_v4(),
            endorsement_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            financier_id: Uuid::new_v4(),
            financier_address: "GFINANCIER".to_string(),
            principal: 100_000,
            rate_bps: 1_200,
            interest: 2_958,
            repayment_amount: 102_958,
            starts_at: now,
            due_at: now + Duration::days(90),
            anchor_op: AnchorOp::PledgeTransfer {
                receipt_id: Uuid::new_v4(),
                endorsement_id: Uuid::new_v4(),
                from_address: "GOWNER".to_string(),
                to_address: "GFINANCIER".to_string(),
                amount: 100_000,
            },
        }
    }

    fn intent(kind: IntentKind, payload: serde_json::Value) -> AnchorIntent {
        let now = Utc::now();
        AnchorIntent {
            id: Uuid::new_v4(),
            endorsement_id: Uuid::new_v4(),
            kind,
            status: IntentStatus::Submitted,
            payload,
            anchor_tx_ref: Some("tx-1".to_string()),
            anchor_block_ref: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn confirmed() -> AnchorReceipt {
        AnchorReceipt {
            tx_ref: TxRef("tx-1".to_string()),
            block_ref: "block-9".to_string(),
            success: true,
            revert_reason: None,
        }
    }

    #[test]
    fn test_confirmed_leg_is_applied_with_its_journaled_plan() {
        let plan = accept_plan();
        let i = intent(IntentKind::Pledge, serde_json::to_value(&plan).unwrap());

        match resolve_confirmation(&i, Ok(confirmed())).unwrap() {
            IntentResolution::Apply {
                plan: IntentPlan::Pledge(recovered),
                ..
            } => assert_eq!(recovered.endorsement_id, plan.endorsement_id),
            other => panic!("expected apply, got {:?}", other),
        }
    }

    #[test]
    fn test_unsuccessful_receipt_closes_the_intent() {
        let i = intent(IntentKind::Pledge, serde_json::json!({}));
        let receipt = AnchorReceipt {
            success: false,
            revert_reason: Some("custody mismatch".to_string()),
            ..confirmed()
        };

        match resolve_confirmation(&i, Ok(receipt)).unwrap() {
            IntentResolution::Fail(reason) => assert_eq!(reason, "custody mismatch"),
            other => panic!("expected fail, got {:?}", other),
        }
    }

    #[test]
    fn test_revert_error_closes_the_intent() {
        let i = intent(IntentKind::Pledge, serde_json::json!({}));
        match resolve_confirmation(&i, Err(AnchorError::Reverted("nope".to_string()))).unwrap() {
            IntentResolution::Fail(reason) => assert!(reason.contains("nope")),
            other => panic!("expected fail, got {:?}", other),
        }
    }

    #[test]
    fn test_indeterminate_errors_leave_the_intent_open() {
        let i = intent(IntentKind::Pledge, serde_json::json!({}));

        for outcome in [
            AnchorError::Timeout("no confirmation".to_string()),
            AnchorError::Protocol("malformed receipt".to_string()),
        ] {
            match resolve_confirmation(&i, Err(outcome)).unwrap() {
                IntentResolution::Retry => {}
                other => panic!("expected retry, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_undeserializable_payload_is_fatal() {
        let i = intent(IntentKind::Release, serde_json::json!({"not": "a plan"}));
        let err = resolve_confirmation(&i, Ok(confirmed())).unwrap_err();
        assert!(matches!(err, CoreError::InvariantViolation(_)));
    }
}
