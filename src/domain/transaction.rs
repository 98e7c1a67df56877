use super::idempotency::IdempotencyKey;
use super::money::Currency;
use super::payment_method::PaymentMethodId;
use super::taxonomy::{ResponseCategory, TIMEOUT_CODE};
use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TransactionId {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| PaymentError::ValidationError(format!("bad transaction id: {}", e)))
    }
}

/// Identifies every transaction descending from one authorize or sale.
///
/// The group id equals the id of the root transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub Uuid);

impl From<TransactionId> for GroupId {
    fn from(id: TransactionId) -> Self {
        Self(id.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Authorize,
    Sale,
    Capture,
    Void,
    Refund,
    Verify,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Authorize => "authorize",
            OperationKind::Sale => "sale",
            OperationKind::Capture => "capture",
            OperationKind::Void => "void",
            OperationKind::Refund => "refund",
            OperationKind::Verify => "verify",
        }
    }

    /// Root operations open a new group; the others attach to a parent.
    pub fn is_root(&self) -> bool {
        matches!(
            self,
            OperationKind::Authorize | OperationKind::Sale | OperationKind::Verify
        )
    }

    /// Operations that move money out of the customer's account.
    pub fn is_debit(&self) -> bool {
        matches!(self, OperationKind::Authorize | OperationKind::Sale)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single gateway-facing transaction.
///
/// `Created` is written before the gateway is contacted; `Submitted` marks the
/// call as in flight. `Approved`, `Declined` and `Error` are terminal and the
/// record is immutable afterwards.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Created,
    Submitted,
    Approved,
    Declined,
    Error,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Created => "created",
            TransactionStatus::Submitted => "submitted",
            TransactionStatus::Approved => "approved",
            TransactionStatus::Declined => "declined",
            TransactionStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Approved | TransactionStatus::Declined | TransactionStatus::Error
        )
    }

    /// Whether the transaction holds (or may still hold) its share of a group cap.
    pub fn reserves_capacity(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Created | TransactionStatus::Submitted | TransactionStatus::Approved
        )
    }

    pub fn can_transition_to(&self, next: &TransactionStatus) -> bool {
        matches!(
            (self, next),
            (TransactionStatus::Created, TransactionStatus::Submitted)
                | (TransactionStatus::Submitted, TransactionStatus::Approved)
                | (TransactionStatus::Submitted, TransactionStatus::Declined)
                | (TransactionStatus::Submitted, TransactionStatus::Error)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ResponseCategory> for TransactionStatus {
    fn from(category: ResponseCategory) -> Self {
        match category {
            ResponseCategory::Approved => TransactionStatus::Approved,
            ResponseCategory::PermanentDecline | ResponseCategory::FraudHold => {
                TransactionStatus::Declined
            }
            ResponseCategory::RetryableError => TransactionStatus::Error,
        }
    }
}

/// One gateway-facing operation.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub group_id: GroupId,
    pub kind: OperationKind,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: TransactionStatus,
    pub idempotency_key: IdempotencyKey,
    /// Card token or bank account reference sent to the gateway.
    pub account_reference: String,
    pub payment_method_id: Option<PaymentMethodId>,
    pub parent_id: Option<TransactionId>,
    pub category: Option<ResponseCategory>,
    pub reference_token: Option<String>,
    pub response_code: Option<String>,
    pub decline_reason: Option<String>,
    /// 1 for the first attempt, incremented on re-admission after a retryable error.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Creates a provisional root transaction (authorize, sale or verify).
    pub fn root(
        kind: OperationKind,
        amount: Decimal,
        currency: Currency,
        idempotency_key: IdempotencyKey,
        account_reference: String,
        payment_method_id: Option<PaymentMethodId>,
        now: DateTime<Utc>,
    ) -> Self {
        let id = TransactionId::new();
        Self {
            id,
            group_id: id.into(),
            kind,
            amount,
            currency,
            status: TransactionStatus::Created,
            idempotency_key,
            account_reference,
            payment_method_id,
            parent_id: None,
            category: None,
            reference_token: None,
            response_code: None,
            decline_reason: None,
            attempt: 1,
            created_at: now,
            completed_at: None,
        }
    }

    /// Creates a provisional child (capture, void or refund) of `parent`.
    ///
    /// The parent is only read; its group, currency and account carry over.
    pub fn child(
        kind: OperationKind,
        amount: Decimal,
        parent: &Transaction,
        idempotency_key: IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            group_id: parent.group_id,
            kind,
            amount,
            currency: parent.currency.clone(),
            status: TransactionStatus::Created,
            idempotency_key,
            account_reference: parent.account_reference.clone(),
            payment_method_id: parent.payment_method_id,
            parent_id: Some(parent.id),
            category: None,
            reference_token: None,
            response_code: None,
            decline_reason: None,
            attempt: 1,
            created_at: now,
            completed_at: None,
        }
    }

    /// A fresh provisional attempt of the same request, used after a retryable error.
    pub fn next_attempt(&self, now: DateTime<Utc>) -> Self {
        let id = TransactionId::new();
        let group_id = if self.kind.is_root() {
            id.into()
        } else {
            self.group_id
        };
        Self {
            id,
            group_id,
            status: TransactionStatus::Created,
            category: None,
            reference_token: None,
            response_code: None,
            decline_reason: None,
            attempt: self.attempt + 1,
            created_at: now,
            completed_at: None,
            ..self.clone()
        }
    }

    /// Applies a status change, rejecting anything outside the transition table.
    pub fn transition(
        &mut self,
        next: TransactionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), PaymentError> {
        if !self.status.can_transition_to(&next) {
            return Err(PaymentError::IllegalTransition(format!(
                "{} transaction {} cannot move from {} to {}",
                self.kind, self.id, self.status, next
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Records a classified gateway outcome and moves to the matching terminal status.
    pub fn settle(
        &mut self,
        category: ResponseCategory,
        response_code: String,
        reference_token: Option<String>,
        decline_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), PaymentError> {
        self.transition(category.into(), now)?;
        self.category = Some(category);
        self.response_code = Some(response_code);
        self.reference_token = reference_token;
        if self.status != TransactionStatus::Approved {
            self.decline_reason = decline_reason;
        }
        Ok(())
    }

    /// Closes an attempt whose executor stopped before recording an outcome.
    ///
    /// The gateway may or may not have acted on it, so it is settled like a
    /// transport timeout and the next attempt goes through reconciliation.
    pub fn abandon(&mut self, now: DateTime<Utc>) -> Result<(), PaymentError> {
        if self.status == TransactionStatus::Created {
            self.transition(TransactionStatus::Submitted, now)?;
        }
        self.settle(
            ResponseCategory::RetryableError,
            TIMEOUT_CODE.to_string(),
            None,
            Some("abandoned before an outcome was recorded".to_string()),
            now,
        )
    }

    /// Errored with a transport timeout: the gateway may have moved the money.
    pub fn outcome_unknown(&self) -> bool {
        self.status == TransactionStatus::Error
            && self.response_code.as_deref() == Some(TIMEOUT_CODE)
    }

    /// Whether `request` asks for the same operation as this transaction.
    ///
    /// Used to detect an idempotency key replayed with different parameters.
    pub fn same_request(&self, request: &Transaction) -> bool {
        self.kind == request.kind
            && self.amount == request.amount
            && self.currency == request.currency
            && self.parent_id == request.parent_id
            && self.account_reference == request.account_reference
            && self.payment_method_id == request.payment_method_id
    }
}
