use super::transaction::{OperationKind, Transaction, TransactionId};
use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_KEY_LEN: usize = 255;

/// Caller-supplied token scoping exactly-once semantics for one logical operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Result<Self, PaymentError> {
        let key = key.into();
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Err(PaymentError::ValidationError(
                "Idempotency key must not be empty".to_string(),
            ));
        }
        if trimmed.len() > MAX_KEY_LEN {
            return Err(PaymentError::ValidationError(format!(
                "Idempotency key longer than {} bytes",
                MAX_KEY_LEN
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps an idempotency key to the transaction executing it.
///
/// Written together with its first transaction in one atomic unit. The
/// transaction reference only moves to a new attempt while the record is
/// uncompleted (the previous attempt ended in a retryable error); once
/// `completed_at` is set the record is read-only.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub kind: OperationKind,
    pub transaction_id: TransactionId,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl IdempotencyRecord {
    pub fn for_transaction(tx: &Transaction) -> Self {
        Self {
            key: tx.idempotency_key.clone(),
            kind: tx.kind,
            transaction_id: tx.id,
            created_at: tx.created_at,
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Outcome of an atomic insert-if-absent on the idempotency record.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The record and the provisional transaction were written; the caller executes.
    Admitted(Transaction),
    /// The key is already taken; the current record and its transaction are returned.
    Existing {
        record: IdempotencyRecord,
        transaction: Transaction,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert_eq!(IdempotencyKey::new(" K1 ").unwrap().as_str(), "K1");
        assert!(IdempotencyKey::new("   ").is_err());
        assert!(IdempotencyKey::new("x".repeat(MAX_KEY_LEN + 1)).is_err());
        assert!(IdempotencyKey::new("x".repeat(MAX_KEY_LEN)).is_ok());
    }
}
