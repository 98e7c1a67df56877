//! Derived state of a transaction group.
//!
//! Nothing here is cached: caps are recomputed from the persisted children each
//! time a store admits a new capture, void or refund.

use super::money::Currency;
use super::transaction::{GroupId, OperationKind, Transaction, TransactionStatus};
use crate::error::PaymentError;
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    /// The root has not reached a terminal status yet.
    Pending,
    /// The root was declined or errored; nothing can attach to it.
    Closed,
    Authorized,
    PartiallyCaptured,
    Captured,
    Voided,
    PartiallyRefunded,
    FullyRefunded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    pub group_id: GroupId,
    pub currency: Currency,
    pub authorized: Decimal,
    pub captured: Decimal,
    pub refunded: Decimal,
    pub voided: bool,
    pub state: GroupState,
}

impl GroupSummary {
    /// Summarizes a group from its persisted transactions. Only approved
    /// children contribute to the totals.
    pub fn from_transactions(transactions: &[Transaction]) -> Option<Self> {
        let root = transactions
            .iter()
            .find(|tx| tx.kind.is_root() && tx.parent_id.is_none())?;

        let authorized = if root.status == TransactionStatus::Approved {
            root.amount
        } else {
            Decimal::ZERO
        };
        let captured = refundable_base(transactions);
        let refunded = sum_where(transactions, |tx| {
            tx.kind == OperationKind::Refund && tx.status == TransactionStatus::Approved
        });
        let voided = transactions
            .iter()
            .any(|tx| tx.kind == OperationKind::Void && tx.status == TransactionStatus::Approved);

        let state = match root.status {
            TransactionStatus::Created | TransactionStatus::Submitted => GroupState::Pending,
            TransactionStatus::Declined | TransactionStatus::Error => GroupState::Closed,
            TransactionStatus::Approved if voided => GroupState::Voided,
            TransactionStatus::Approved if refunded > Decimal::ZERO && refunded >= captured => {
                GroupState::FullyRefunded
            }
            TransactionStatus::Approved if refunded > Decimal::ZERO => {
                GroupState::PartiallyRefunded
            }
            TransactionStatus::Approved if root.kind == OperationKind::Sale => GroupState::Captured,
            TransactionStatus::Approved if captured >= authorized && captured > Decimal::ZERO => {
                GroupState::Captured
            }
            TransactionStatus::Approved if captured > Decimal::ZERO => {
                GroupState::PartiallyCaptured
            }
            TransactionStatus::Approved => GroupState::Authorized,
        };

        Some(Self {
            group_id: root.group_id,
            currency: root.currency.clone(),
            authorized,
            captured,
            refunded,
            voided,
            state,
        })
    }
}

fn sum_where(transactions: &[Transaction], predicate: impl Fn(&Transaction) -> bool) -> Decimal {
    transactions
        .iter()
        .filter(|tx| predicate(tx))
        .map(|tx| tx.amount)
        .sum()
}

/// In flight, approved, or the latest attempt of its key with an unknown outcome.
///
/// A timed-out attempt may have moved money at the gateway, so its amount stays
/// held until a later attempt of the same key replaces it.
fn holds_capacity(tx: &Transaction, group: &[Transaction]) -> bool {
    if tx.status.reserves_capacity() {
        return true;
    }
    tx.outcome_unknown()
        && !group
            .iter()
            .any(|other| other.idempotency_key == tx.idempotency_key && other.attempt > tx.attempt)
}

fn reserved(transactions: &[Transaction], kind: OperationKind) -> Decimal {
    sum_where(transactions, |tx| {
        tx.kind == kind && holds_capacity(tx, transactions)
    })
}

/// Approved captures plus an approved sale root.
fn refundable_base(transactions: &[Transaction]) -> Decimal {
    sum_where(transactions, |tx| {
        tx.status == TransactionStatus::Approved
            && matches!(tx.kind, OperationKind::Capture | OperationKind::Sale)
    })
}

fn illegal(message: String) -> PaymentError {
    PaymentError::IllegalTransition(message)
}

/// Remaining amount that can still be captured on an authorization.
pub fn capturable(parent: &Transaction, group: &[Transaction]) -> Decimal {
    (parent.amount - reserved(group, OperationKind::Capture)).max(Decimal::ZERO)
}

/// Remaining amount that can still be refunded against `parent`.
pub fn refundable(parent: &Transaction, group: &[Transaction]) -> Decimal {
    let group_remaining = refundable_base(group) - reserved(group, OperationKind::Refund);
    let remaining = if parent.kind == OperationKind::Capture {
        let against_parent = sum_where(group, |tx| {
            tx.kind == OperationKind::Refund
                && tx.parent_id == Some(parent.id)
                && holds_capacity(tx, group)
        });
        group_remaining.min(parent.amount - against_parent)
    } else {
        group_remaining
    };
    remaining.max(Decimal::ZERO)
}

/// Validates that `candidate` may join its group given the persisted state.
///
/// `group` holds every persisted transaction of the group (never the candidate).
/// Children still in flight reserve their amount, so two concurrent partial
/// captures cannot both pass against the same remainder.
pub fn check_admission(
    candidate: &Transaction,
    parent: Option<&Transaction>,
    group: &[Transaction],
) -> Result<(), PaymentError> {
    if candidate.kind.is_root() {
        return Ok(());
    }
    let parent = parent.ok_or_else(|| {
        PaymentError::NotFound(format!(
            "parent of {} transaction {}",
            candidate.kind, candidate.id
        ))
    })?;
    if parent.group_id != candidate.group_id {
        return Err(illegal(format!(
            "transaction {} does not belong to group {}",
            parent.id, candidate.group_id
        )));
    }
    let void_active = group
        .iter()
        .any(|tx| tx.kind == OperationKind::Void && holds_capacity(tx, group));

    match candidate.kind {
        OperationKind::Capture => {
            require_approved(parent, &[OperationKind::Authorize], candidate.kind)?;
            if void_active {
                return Err(illegal(format!("group {} is voided", parent.group_id)));
            }
            let remaining = capturable(parent, group);
            if remaining.is_zero() {
                return Err(illegal(format!(
                    "authorization {} is fully captured",
                    parent.id
                )));
            }
            if candidate.amount > remaining {
                return Err(PaymentError::AmountExceedsRemaining {
                    requested: candidate.amount,
                    remaining,
                });
            }
        }
        OperationKind::Void => {
            require_approved(parent, &[OperationKind::Authorize], candidate.kind)?;
            if void_active {
                return Err(illegal(format!("group {} is already voided", parent.group_id)));
            }
            if !reserved(group, OperationKind::Capture).is_zero() {
                return Err(illegal(format!(
                    "authorization {} has captures and cannot be voided",
                    parent.id
                )));
            }
        }
        OperationKind::Refund => {
            require_approved(
                parent,
                &[
                    OperationKind::Sale,
                    OperationKind::Capture,
                    OperationKind::Authorize,
                ],
                candidate.kind,
            )?;
            if parent.kind == OperationKind::Authorize && refundable_base(group).is_zero() {
                return Err(illegal(format!(
                    "authorization {} has nothing captured to refund",
                    parent.id
                )));
            }
            let remaining = refundable(parent, group);
            if candidate.amount > remaining {
                return Err(PaymentError::AmountExceedsRemaining {
                    requested: candidate.amount,
                    remaining,
                });
            }
        }
        OperationKind::Authorize | OperationKind::Sale | OperationKind::Verify => {}
    }
    Ok(())
}

fn require_approved(
    parent: &Transaction,
    kinds: &[OperationKind],
    operation: OperationKind,
) -> Result<(), PaymentError> {
    if !kinds.contains(&parent.kind) {
        return Err(illegal(format!(
            "cannot {} a {} transaction",
            operation, parent.kind
        )));
    }
    if parent.status != TransactionStatus::Approved {
        return Err(illegal(format!(
            "cannot {} transaction {} in status {}",
            operation, parent.id, parent.status
        )));
    }
    Ok(())
}
