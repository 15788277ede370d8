//! Pure transition kernel for the pledge state machine
//!
//! Each operation is validated here against entity snapshots, producing a
//! plan of the writes to make. The service executes plans transactionally;
//! nothing in this module touches the database or the chain, so the whole
//! state machine is testable in memory.
//!
//! Custody states: NORMAL -> FROZEN (initiate) -> PLEDGED (accept) -> NORMAL
//! (release), with FROZEN -> NORMAL on reject/cancel and LIQUIDATED as the
//! terminal default branch.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::anchor::{AnchorOp, AnchorReceipt};
use crate::error::{CoreError, CoreResult};
use crate::models::{
    Endorsement, EndorsementKind, EndorsementStatus, FinancingRecord, FinancingStatus,
    PledgeRecord, PledgeStatus, ReceiptStatus, WarehouseReceipt,
};

/// Highest acceptable financing rate: 100%.
pub const MAX_RATE_BPS: i32 = 10_000;

/// Maximum pledgeable amount for a receipt: `total_value * ratio_bps / 10_000`.
pub fn pledge_cap(total_value: i64, ratio_bps: i32) -> i64 {
    ((total_value as i128 * ratio_bps as i128) / 10_000) as i64
}

/// Loan term in whole days, never less than one.
pub fn term_days(starts_at: DateTime<Utc>, due_at: DateTime<Utc>) -> CoreResult<i64> {
    if due_at <= starts_at {
        return Err(CoreError::Validation(format!(
            "due date {} is not after start {}",
            due_at, starts_at
        )));
    }
    Ok((due_at - starts_at).num_days().max(1))
}

/// Simple pro-rata interest: `principal * rate_bps * days / (10_000 * 365)`,
/// integer minor-units, rounded down.
pub fn compute_interest(principal: i64, rate_bps: i32, days: i64) -> CoreResult<i64> {
    if principal <= 0 {
        return Err(CoreError::Validation(format!(
            "principal must be positive, got {}",
            principal
        )));
    }
    if !(0..=MAX_RATE_BPS).contains(&rate_bps) {
        return Err(CoreError::Validation(format!(
            "rate {} bps outside 0..={}",
            rate_bps, MAX_RATE_BPS
        )));
    }
    if days < 1 {
        return Err(CoreError::Validation(format!(
            "term must be at least one day, got {}",
            days
        )));
    }

    let interest =
        (principal as i128 * rate_bps as i128 * days as i128) / (10_000i128 * 365i128);
    interest
        .try_into()
        .map_err(|_| CoreError::InvariantViolation("interest overflows i64".to_string()))
}

/// Parameters for a pledge proposal.
#[derive(Debug, Clone)]
pub struct InitiateInput {
    pub financier_id: Uuid,
    pub financier_address: String,
    pub amount: i64,
    /// Requested loan end date; structured, never parsed out of free text.
    pub due_at: DateTime<Utc>,
}

/// Writes for NORMAL -> FROZEN.
#[derive(Debug, Clone)]
pub struct InitiatePlan {
    pub endorsement: Endorsement,
    pub receipt_status: ReceiptStatus,
}

pub fn plan_initiate(
    receipt: &WarehouseReceipt,
    caller: Uuid,
    input: &InitiateInput,
    pledge_ratio_bps: i32,
    has_pending_endorsement: bool,
    now: DateTime<Utc>,
) -> CoreResult<InitiatePlan> {
    if caller != receipt.owner_id {
        return Err(CoreError::Validation(format!(
            "caller {} is not the owner of receipt {}",
            caller, receipt.id
        )));
    }
    if receipt.status != ReceiptStatus::Normal {
        return Err(CoreError::StateConflict(format!(
            "receipt {} is {:?}, not NORMAL",
            receipt.id, receipt.status
        )));
    }
    if has_pending_endorsement {
        return Err(CoreError::StateConflict(format!(
            "receipt {} already has a pending endorsement",
            receipt.id
        )));
    }
    if input.amount <= 0 {
        return Err(CoreError::Validation(format!(
            "pledge amount must be positive, got {}",
            input.amount
        )));
    }
    let cap = pledge_cap(receipt.total_value, pledge_ratio_bps);
    if input.amount > cap {
        return Err(CoreError::Validation(format!(
            "pledge amount {} exceeds cap {} ({} bps of value {})",
            input.amount, cap, pledge_ratio_bps, receipt.total_value
        )));
    }
    if input.due_at <= now {
        return Err(CoreError::Validation(format!(
            "requested due date {} is in the past",
            input.due_at
        )));
    }
    if input.financier_address.is_empty() {
        return Err(CoreError::Validation(
            "financier address must not be empty".to_string(),
        ));
    }

    Ok(InitiatePlan {
        endorsement: Endorsement {
            id: Uuid::new_v4(),
            receipt_id: receipt.id,
            kind: EndorsementKind::Pledge,
            status: EndorsementStatus::Pending,
            from_party: receipt.owner_id,
            to_party: input.financier_id,
            from_address: receipt.holder_address.clone(),
            to_address: input.financier_address.clone(),
            amount: input.amount,
            due_at: Some(input.due_at),
            anchor_tx_ref: None,
            anchor_block_ref: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        },
        receipt_status: ReceiptStatus::Frozen,
    })
}

/// Validated terms for FROZEN -> PLEDGED, computed before the anchor call.
/// Serializable: journaled with the anchor intent so the transition can be
/// completed after a crash.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AcceptPlan {
    pub receipt_id: Uuid,
    pub endorsement_id: Uuid,
    pub owner_id: Uuid,
    pub financier_id: Uuid,
    pub financier_address: String,
    pub principal: i64,
    pub rate_bps: i32,
    pub interest: i64,
    pub repayment_amount: i64,
    pub starts_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub anchor_op: AnchorOp,
}

pub fn plan_accept(
    receipt: &WarehouseReceipt,
    endorsement: &Endorsement,
    caller: Uuid,
    approved_amount: i64,
    rate_bps: i32,
    now: DateTime<Utc>,
) -> CoreResult<AcceptPlan> {
    if endorsement.kind != EndorsementKind::Pledge {
        return Err(CoreError::StateConflict(format!(
            "endorsement {} is a {:?}, not a pledge",
            endorsement.id, endorsement.kind
        )));
    }
    if endorsement.status != EndorsementStatus::Pending {
        return Err(CoreError::StateConflict(format!(
            "endorsement {} is {:?}, not PENDING",
            endorsement.id, endorsement.status
        )));
    }
    if receipt.status != ReceiptStatus::Frozen {
        return Err(CoreError::StateConflict(format!(
            "receipt {} is {:?}, not FROZEN",
            receipt.id, receipt.status
        )));
    }
    if caller != endorsement.to_party {
        return Err(CoreError::Validation(format!(
            "caller {} is not the addressed financier",
            caller
        )));
    }
    if approved_amount <= 0 || approved_amount > endorsement.amount {
        return Err(CoreError::Validation(format!(
            "approved amount {} outside 1..={} requested",
            approved_amount, endorsement.amount
        )));
    }
    let due_at = endorsement.due_at.ok_or_else(|| {
        CoreError::Validation(format!(
            "endorsement {} carries no requested due date",
            endorsement.id
        ))
    })?;

    let days = term_days(now, due_at)?;
    let interest = compute_interest(approved_amount, rate_bps, days)?;
    let repayment_amount = approved_amount
        .checked_add(interest)
        .ok_or_else(|| CoreError::InvariantViolation("repayment overflows i64".to_string()))?;

    Ok(AcceptPlan {
        receipt_id: receipt.id,
        endorsement_id: endorsement.id,
        owner_id: endorsement.from_party,
        financier_id: endorsement.to_party,
        financier_address: endorsement.to_address.clone(),
        principal: approved_amount,
        rate_bps,
        interest,
        repayment_amount,
        starts_at: now,
        due_at,
        anchor_op: AnchorOp::PledgeTransfer {
            receipt_id: receipt.id,
            endorsement_id: endorsement.id,
            from_address: endorsement.from_address.clone(),
            to_address: endorsement.to_address.clone(),
            amount: approved_amount,
        },
    })
}

impl AcceptPlan {
    /// Build the records to persist once the anchor has confirmed.
    pub fn records(
        &self,
        receipt: &AnchorReceipt,
        now: DateTime<Utc>,
    ) -> (PledgeRecord, FinancingRecord) {
        let pledge = PledgeRecord {
            id: Uuid::new_v4(),
            receipt_id: self.receipt_id,
            endorsement_id: self.endorsement_id,
            release_endorsement_id: None,
            owner_id: self.owner_id,
            financier_id: self.financier_id,
            pledge_amount: self.principal,
            status: PledgeStatus::Active,
            pledge_tx_ref: receipt.tx_ref.0.clone(),
            release_tx_ref: None,
            pledged_at: now,
            released_at: None,
            created_at: now,
            updated_at: now,
        };
        let financing = FinancingRecord {
            id: Uuid::new_v4(),
            pledge_record_id: pledge.id,
            principal: self.principal,
            rate_bps: self.rate_bps,
            interest: self.interest,
            repayment_amount: self.repayment_amount,
            starts_at: self.starts_at,
            due_at: self.due_at,
            status: FinancingStatus::Active,
            created_at: now,
            updated_at: now,
        };
        (pledge, financing)
    }
}

/// Validate FROZEN -> NORMAL by financier rejection. Purely local, and like
/// cancel it is barred once an anchor submission for the endorsement is in
/// flight: the confirm is no longer interruptible at that point.
pub fn plan_reject(
    receipt: &WarehouseReceipt,
    endorsement: &Endorsement,
    caller: Uuid,
    reason: &str,
    intent_in_flight: bool,
) -> CoreResult<()> {
    if endorsement.status != EndorsementStatus::Pending {
        return Err(CoreError::StateConflict(format!(
            "endorsement {} is {:?}, not PENDING",
            endorsement.id, endorsement.status
        )));
    }
    if receipt.status != ReceiptStatus::Frozen {
        return Err(CoreError::StateConflict(format!(
            "receipt {} is {:?}, not FROZEN",
            receipt.id, receipt.status
        )));
    }
    if caller != endorsement.to_party {
        return Err(CoreError::Validation(format!(
            "caller {} is not the addressed financier",
            caller
        )));
    }
    if intent_in_flight {
        return Err(CoreError::StateConflict(format!(
            "endorsement {} has an anchor submission in flight",
            endorsement.id
        )));
    }
    if reason.trim().is_empty() {
        return Err(CoreError::Validation(
            "rejection reason must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Validate owner withdrawal of a PENDING proposal. Permitted only while no
/// anchor submission is in flight for it.
pub fn plan_cancel(
    endorsement: &Endorsement,
    caller: Uuid,
    intent_in_flight: bool,
) -> CoreResult<()> {
    if endorsement.status != EndorsementStatus::Pending {
        return Err(CoreError::StateConflict(format!(
            "endorsement {} is {:?}, not PENDING",
            endorsement.id, endorsement.status
        )));
    }
    if caller != endorsement.from_party {
        return Err(CoreError::Validation(format!(
            "caller {} is not the proposing owner",
            caller
        )));
    }
    if intent_in_flight {
        return Err(CoreError::StateConflict(format!(
            "endorsement {} has an anchor submission in flight",
            endorsement.id
        )));
    }
    Ok(())
}

/// Validated writes for PLEDGED -> NORMAL, computed before the anchor call.
/// Serializable for the same crash-recovery reason as [`AcceptPlan`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReleasePlan {
    pub receipt_id: Uuid,
    pub pledge_record_id: Uuid,
    pub pledge_endorsement_id: Uuid,
    pub owner_id: Uuid,
    pub financier_id: Uuid,
    /// Custody reverts to the pledge endorsement's originating address.
    pub restored_holder: String,
    pub repay_amount: i64,
    pub anchor_op: AnchorOp,
}

pub fn plan_release(
    receipt: &WarehouseReceipt,
    pledge_endorsement: &Endorsement,
    pledge: &PledgeRecord,
    financing: &FinancingRecord,
    caller: Uuid,
    repay_amount: i64,
) -> CoreResult<ReleasePlan> {
    if receipt.status != ReceiptStatus::Pledged {
        return Err(CoreError::StateConflict(format!(
            "receipt {} is {:?}, not PLEDGED",
            receipt.id, receipt.status
        )));
    }
    if pledge.status != PledgeStatus::Active {
        return Err(CoreError::StateConflict(format!(
            "pledge record {} is {:?}, not ACTIVE",
            pledge.id, pledge.status
        )));
    }
    if financing.status != FinancingStatus::Active {
        return Err(CoreError::StateConflict(format!(
            "financing record {} is {:?}, not ACTIVE",
            financing.id, financing.status
        )));
    }
    if caller != pledge.owner_id {
        return Err(CoreError::Validation(format!(
            "caller {} is not the original owner",
            caller
        )));
    }
    if repay_amount < financing.repayment_amount {
        return Err(CoreError::InsufficientRepayment {
            required: financing.repayment_amount,
            offered: repay_amount,
        });
    }

    Ok(ReleasePlan {
        receipt_id: receipt.id,
        pledge_record_id: pledge.id,
        pledge_endorsement_id: pledge_endorsement.id,
        owner_id: pledge.owner_id,
        financier_id: pledge.financier_id,
        restored_holder: pledge_endorsement.from_address.clone(),
        repay_amount,
        anchor_op: AnchorOp::ReleaseTransfer {
            receipt_id: receipt.id,
            endorsement_id: pledge_endorsement.id,
            from_address: pledge_endorsement.to_address.clone(),
            to_address: pledge_endorsement.from_address.clone(),
            amount: pledge.pledge_amount,
        },
    })
}

impl ReleasePlan {
    /// Build the CONFIRMED release endorsement once the anchor has confirmed.
    pub fn release_endorsement(
        &self,
        receipt: &AnchorReceipt,
        now: DateTime<Utc>,
    ) -> Endorsement {
        Endorsement {
            id: Uuid::new_v4(),
            receipt_id: self.receipt_id,
            kind: EndorsementKind::Release,
            status: EndorsementStatus::Confirmed,
            from_party: self.financier_id,
            to_party: self.owner_id,
            from_address: match &self.anchor_op {
                AnchorOp::ReleaseTransfer { from_address, .. } => from_address.clone(),
                AnchorOp::PledgeTransfer { from_address, .. } => from_address.clone(),
            },
            to_address: self.restored_holder.clone(),
            amount: self.repay_amount,
            due_at: None,
            anchor_tx_ref: Some(receipt.tx_ref.0.clone()),
            anchor_block_ref: Some(receipt.block_ref.clone()),
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Guard for applying a confirmed pledge leg locally: the endorsement row,
/// re-read under lock, must still be PENDING. A loser of this check must not
/// touch the books; StaleState tells the caller a concurrent transition won.
/// Re-running finalization after a successful apply fails here too, which is
/// what makes the apply idempotent.
pub fn confirm_accept_guard(endorsement: &Endorsement) -> CoreResult<()> {
    if endorsement.status != EndorsementStatus::Pending {
        return Err(CoreError::StaleState(format!(
            "endorsement {} is {:?}, no longer pending",
            endorsement.id, endorsement.status
        )));
    }
    Ok(())
}

/// Guard for applying a confirmed release leg locally: the pledge record,
/// re-read under lock, must still be ACTIVE. Same idempotency contract as
/// [`confirm_accept_guard`].
pub fn confirm_release_guard(pledge: &PledgeRecord) -> CoreResult<()> {
    if pledge.status != PledgeStatus::Active {
        return Err(CoreError::StaleState(format!(
            "pledge record {} is {:?}, no longer active",
            pledge.id, pledge.status
        )));
    }
    Ok(())
}
