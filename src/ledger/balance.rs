//! Pure balance kernel for credit limits
//!
//! All balance arithmetic lives here so the invariants can be tested without
//! a database. The service layer snapshots a row under lock, runs this
//! kernel, and persists the result with its journal entry in one
//! transaction.

use crate::error::{CoreError, CoreResult};
use crate::models::{CreditLimit, CreditLimitUsage, UsageKind};

/// A limit's mutable balances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balances {
    pub total: i64,
    pub used: i64,
    pub frozen: i64,
}

impl Balances {
    pub fn available(&self) -> i64 {
        self.total - self.used - self.frozen
    }

    pub fn of(limit: &CreditLimit) -> Self {
        Self {
            total: limit.total_amount,
            used: limit.used_amount,
            frozen: limit.frozen_amount,
        }
    }
}

fn check_invariants(b: &Balances) -> CoreResult<()> {
    if b.used < 0 || b.frozen < 0 {
        return Err(CoreError::InvariantViolation(format!(
            "negative balance: used {}, frozen {}",
            b.used, b.frozen
        )));
    }
    if b.used
        .checked_add(b.frozen)
        .map(|committed| committed > b.total)
        .unwrap_or(true)
    {
        return Err(CoreError::InvariantViolation(format!(
            "committed capacity exceeds total: used {} + frozen {} > total {}",
            b.used, b.frozen, b.total
        )));
    }
    Ok(())
}

/// Apply one usage operation to a balance snapshot.
///
/// USE and FREEZE book capacity out of `available` into `used`/`frozen` and
/// reject with InsufficientAvailable when it does not cover the amount.
/// RELEASE and UNFREEZE return capacity; a result that would go negative is
/// an InvariantViolation, never clamped: the books are wrong, not the
/// request.
pub fn apply(before: Balances, kind: UsageKind, amount: i64) -> CoreResult<Balances> {
    if amount <= 0 {
        return Err(CoreError::Validation(format!(
            "amount must be positive, got {}",
            amount
        )));
    }

    let overflow =
        || CoreError::InvariantViolation("balance arithmetic overflow".to_string());

    let after = match kind {
        UsageKind::Use => {
            if before.available() < amount {
                return Err(CoreError::InsufficientAvailable {
                    available: before.available(),
                    requested: amount,
                });
            }
            Balances {
                used: before.used.checked_add(amount).ok_or_else(overflow)?,
                ..before
            }
        }
        UsageKind::Freeze => {
            if before.available() < amount {
                return Err(CoreError::InsufficientAvailable {
                    available: before.available(),
                    requested: amount,
                });
            }
            Balances {
                frozen: before.frozen.checked_add(amount).ok_or_else(overflow)?,
                ..before
            }
        }
        UsageKind::Release => {
            let used = before.used.checked_sub(amount).ok_or_else(overflow)?;
            if used < 0 {
                return Err(CoreError::InvariantViolation(format!(
                    "release of {} would drive used below zero (used {})",
                    amount, before.used
                )));
            }
            Balances { used, ..before }
        }
        UsageKind::Unfreeze => {
            let frozen = before.frozen.checked_sub(amount).ok_or_else(overflow)?;
            if frozen < 0 {
                return Err(CoreError::InvariantViolation(format!(
                    "unfreeze of {} would drive frozen below zero (frozen {})",
                    amount, before.frozen
                )));
            }
            Balances { frozen, ..before }
        }
    };

    check_invariants(&after)?;
    Ok(after)
}

/// Validate a proposed new total against committed capacity.
///
/// Adjustment touches `total` only; it must still cover everything already
/// used or frozen.
pub fn check_new_total(before: Balances, new_total: i64) -> CoreResult<()> {
    if new_total < 0 {
        return Err(CoreError::Validation(format!(
            "total must be non-negative, got {}",
            new_total
        )));
    }
    let committed = before
        .used
        .checked_add(before.frozen)
        .ok_or_else(|| CoreError::InvariantViolation("balance arithmetic overflow".to_string()))?;
    if new_total < committed {
        return Err(CoreError::Validation(format!(
            "new total {} below committed capacity {} (used {} + frozen {})",
            new_total, committed, before.used, before.frozen
        )));
    }
    Ok(())
}

/// Replay a limit's journal from zero, verifying each entry's recorded
/// before/after snapshots against the running balances.
///
/// Returns the final (used, frozen). A mismatch means the journal and the
/// row have diverged, which is fatal.
pub fn replay(entries: &[CreditLimitUsage]) -> CoreResult<(i64, i64)> {
    let mut used: i64 = 0;
    let mut frozen: i64 = 0;

    for entry in entries {
        if entry.used_before != used || entry.frozen_before != frozen {
            return Err(CoreError::InvariantViolation(format!(
                "journal entry {} expects used {}/frozen {} but replay reached {}/{}",
                entry.id, entry.used_before, entry.frozen_before, used, frozen
            )));
        }

        match entry.kind {
            UsageKind::Use => used += entry.amount,
            UsageKind::Release => used -= entry.amount,
            UsageKind::Freeze => frozen += entry.amount,
            UsageKind::Unfreeze => frozen -= entry.amount,
        }

        if used < 0 || frozen < 0 {
            return Err(CoreError::InvariantViolation(format!(
                "journal entry {} drives a balance negative: used {}, frozen {}",
                entry.id, used, frozen
            )));
        }
        if entry.used_after != used || entry.frozen_after != frozen {
            return Err(CoreError::InvariantViolation(format!(
                "journal entry {} records used {}/frozen {} but replay computed {}/{}",
                entry.id, entry.used_after, entry.frozen_after, used, frozen
            )));
        }
    }

    Ok((used, frozen))
}
