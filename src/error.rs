use crate::domain::transaction::{TransactionId, TransactionStatus};
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Illegal transition: {0}")]
    IllegalTransition(String),
    #[error("Requested amount {requested} exceeds remaining {remaining}")]
    AmountExceedsRemaining {
        requested: Decimal,
        remaining: Decimal,
    },
    #[error("Idempotency key '{key}' was reused with different parameters")]
    KeyReuseMismatch { key: String },
    #[error("Idempotency key '{key}' is still being processed by transaction {transaction_id}")]
    InProgress {
        key: String,
        transaction_id: TransactionId,
    },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Payment method {id} cannot be used: {reason}")]
    PaymentMethodUnusable { id: String, reason: String },
    #[error("Gateway error on transaction {transaction_id} ({status}, code {response_code}); retry with the same key")]
    GatewayRetryable {
        transaction_id: TransactionId,
        status: TransactionStatus,
        response_code: String,
    },
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PaymentError {
    /// Whether the caller may retry the same request (same idempotency key).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PaymentError::InProgress { .. }
                | PaymentError::GatewayRetryable { .. }
                | PaymentError::StorageError(_)
                | PaymentError::InternalError(_)
        )
    }
}

impl From<serde_json::Error> for PaymentError {
    fn from(e: serde_json::Error) -> Self {
        PaymentError::InternalError(Box::new(e))
    }
}

impl From<tokio::task::JoinError> for PaymentError {
    fn from(e: tokio::task::JoinError) -> Self {
        PaymentError::InternalError(Box::new(e))
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for PaymentError {
    fn from(e: rocksdb::Error) -> Self {
        PaymentError::StorageError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;
