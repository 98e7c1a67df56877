use super::idempotency::{Admission, IdempotencyKey, IdempotencyRecord};
use super::money::Currency;
use super::payment_method::{PaymentMethod, PaymentMethodId};
use super::transaction::{GroupId, OperationKind, Transaction, TransactionId};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;

/// Persistence for transactions and their idempotency records.
///
/// Every method that writes more than one entity does so in a single atomic unit.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert-if-absent on the idempotency key.
    ///
    /// When the key is free, validates the group rules for `tx` against the
    /// persisted group and writes the record and `tx` together. When the key is
    /// taken, returns the existing record and its current transaction untouched.
    async fn admit(&self, tx: Transaction) -> Result<Admission>;

    /// Moves an uncompleted record from a failed attempt to `tx`.
    ///
    /// Only succeeds while the record still points at `failed`; otherwise the
    /// current record is returned as `Admission::Existing`.
    async fn readmit(&self, failed: TransactionId, tx: Transaction) -> Result<Admission>;

    /// Persists a non-terminal status change (e.g. `Submitted`).
    async fn update(&self, tx: Transaction) -> Result<()>;

    /// Persists a terminal transaction, marks its record completed unless the
    /// outcome is retryable, and writes `method` (if any) in the same unit.
    async fn complete(&self, tx: Transaction, method: Option<PaymentMethod>) -> Result<()>;

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>>;

    async fn group(&self, group_id: GroupId) -> Result<Vec<Transaction>>;

    async fn record(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>>;
}

/// Persistence for payment methods with conditional updates.
#[async_trait]
pub trait PaymentMethodStore: Send + Sync {
    async fn get(&self, id: PaymentMethodId) -> Result<Option<PaymentMethod>>;

    async fn by_verification_transaction(
        &self,
        tx_id: TransactionId,
    ) -> Result<Option<PaymentMethod>>;

    /// Pending methods whose grace deadline is at or before `now` and that
    /// have no adverse return recorded.
    async fn due_for_promotion(&self, now: DateTime<Utc>) -> Result<Vec<PaymentMethod>>;

    /// Writes `method` only if the stored copy still has `expected_revision`.
    ///
    /// Returns `false` (and writes nothing) when another writer got there first.
    async fn update_if_revision(
        &self,
        method: PaymentMethod,
        expected_revision: u64,
    ) -> Result<bool>;
}

pub type TransactionStoreRef = Arc<dyn TransactionStore>;
pub type PaymentMethodStoreRef = Arc<dyn PaymentMethodStore>;

/// Context forwarded with every gateway call so gateways with native
/// idempotency can deduplicate retries.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationContext {
    pub idempotency_key: IdempotencyKey,
    pub transaction_id: TransactionId,
    pub attempt: u32,
    /// Gateway reference of the parent for capture/void/refund.
    pub parent_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRequest {
    pub kind: OperationKind,
    pub amount: Decimal,
    pub currency: Currency,
    pub account_reference: String,
    pub context: OperationContext,
}

/// Raw gateway answer; the response code is classified by the core.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
    pub response_code: String,
    pub reference_token: Option<String>,
    pub message: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("gateway call timed out")]
    Timeout,
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn execute(
        &self,
        request: GatewayRequest,
    ) -> std::result::Result<GatewayResponse, GatewayError>;

    /// Looks up the outcome of an earlier attempt, if the gateway supports it.
    async fn lookup(
        &self,
        _context: &OperationContext,
    ) -> std::result::Result<Option<GatewayResponse>, GatewayError> {
        Ok(None)
    }
}

pub type GatewayClientRef = Arc<dyn GatewayClient>;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub type ClockRef = Arc<dyn Clock>;
