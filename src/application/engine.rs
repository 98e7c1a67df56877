use super::idempotency::{Decision, IdempotencyEngine};
use super::scheduler::{SignalReport, VerificationScheduler};
use crate::config::{Config, UnknownOutcomePolicy};
use crate::domain::group::GroupSummary;
use crate::domain::idempotency::IdempotencyKey;
use crate::domain::money::{Amount, Currency};
use crate::domain::payment_method::{MethodKind, PaymentMethod, PaymentMethodId};
use crate::domain::ports::{
    ClockRef, GatewayClientRef, GatewayError, GatewayRequest, GatewayResponse, OperationContext,
    PaymentMethodStoreRef, TransactionStoreRef,
};
use crate::domain::taxonomy::{CodeTable, TIMEOUT_CODE, UNAVAILABLE_CODE};
use crate::domain::transaction::{
    GroupId, OperationKind, Transaction, TransactionId, TransactionStatus,
};
use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

const PERSIST_TRIES: u32 = 3;
const PERSIST_BACKOFF: Duration = Duration::from_millis(20);

/// Where an authorize or sale takes its money from.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentSource {
    /// A one-off card token.
    Token(String),
    /// A stored payment method.
    Method(PaymentMethodId),
}

#[derive(Debug, Clone)]
pub struct DebitRequest {
    pub idempotency_key: IdempotencyKey,
    pub amount: Decimal,
    pub currency: Currency,
    pub source: PaymentSource,
}

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub idempotency_key: IdempotencyKey,
    pub parent: TransactionId,
    pub amount: Decimal,
}

#[derive(Debug, Clone)]
pub struct VoidRequest {
    pub idempotency_key: IdempotencyKey,
    pub parent: TransactionId,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub idempotency_key: IdempotencyKey,
    pub parent: TransactionId,
    pub amount: Decimal,
}

#[derive(Debug, Clone)]
pub struct LinkAccountRequest {
    pub idempotency_key: IdempotencyKey,
    pub owner: String,
    pub kind: MethodKind,
    pub account_reference: String,
    pub currency: Currency,
}

/// Result of `link_and_verify_account`. The payment method exists only when
/// the verification was approved.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedAccount {
    pub transaction: Transaction,
    pub payment_method: Option<PaymentMethod>,
}

/// A whole group: the root, every capture/void/refund, and the derived totals.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupView {
    pub summary: GroupSummary,
    pub transactions: Vec<Transaction>,
}

/// Data needed to create a payment method once a verification is approved.
#[derive(Debug, Clone)]
struct LinkIntent {
    owner: String,
    kind: MethodKind,
    grace_period: chrono::Duration,
}

/// Executes one admitted transaction against the gateway and persists the outcome.
///
/// Owns everything it needs so it can run on a detached task: a caller that
/// goes away mid-call does not abort the gateway call or the write.
struct Settlement {
    store: TransactionStoreRef,
    gateway: GatewayClientRef,
    clock: ClockRef,
    codes: Arc<CodeTable>,
    timeout: Duration,
    policy: UnknownOutcomePolicy,
    parent_reference: Option<String>,
    link: Option<LinkIntent>,
}

impl Settlement {
    async fn execute(
        self,
        mut tx: Transaction,
        previous: Option<Transaction>,
    ) -> Result<(Transaction, Option<PaymentMethod>)> {
        tx.transition(TransactionStatus::Submitted, self.clock.now())?;
        self.store.update(tx.clone()).await?;

        let context = OperationContext {
            idempotency_key: tx.idempotency_key.clone(),
            transaction_id: tx.id,
            attempt: tx.attempt,
            parent_reference: self.parent_reference.clone(),
        };

        let reconciled = match &previous {
            Some(prev) if self.should_reconcile(prev) => self.reconcile(prev, &context).await,
            _ => None,
        };
        let outcome = match reconciled {
            Some(response) => Ok(response),
            None => self.call_gateway(&tx, context).await,
        };

        let (code, reference_token, message) = match outcome {
            Ok(response) => (
                response.response_code,
                response.reference_token,
                response.message,
            ),
            Err(GatewayError::Timeout) => (TIMEOUT_CODE.to_string(), None, None),
            Err(GatewayError::Unavailable(message)) => {
                (UNAVAILABLE_CODE.to_string(), None, Some(message))
            }
        };
        let category = self.codes.classify(&code);
        let reason = message.unwrap_or_else(|| self.codes.reason(&code));
        let now = self.clock.now();
        tx.settle(category, code, reference_token, Some(reason), now)?;

        let method = match &self.link {
            Some(link) if tx.status == TransactionStatus::Approved => Some(PaymentMethod::linked(
                link.owner.clone(),
                link.kind,
                tx.account_reference.clone(),
                tx.id,
                link.grace_period,
                now,
            )),
            _ => None,
        };

        self.persist(&tx, &method).await?;
        info!(
            transaction_id = %tx.id,
            kind = %tx.kind,
            status = %tx.status,
            category = %category,
            attempt = tx.attempt,
            "transaction settled"
        );
        Ok((tx, method))
    }

    /// Writes the outcome, retrying transient storage failures.
    ///
    /// If every try fails the attempt stays in flight until `abandon_after`
    /// lets a retry of the key replace and reconcile it.
    async fn persist(&self, tx: &Transaction, method: &Option<PaymentMethod>) -> Result<()> {
        let mut tries = 1;
        loop {
            match self.store.complete(tx.clone(), method.clone()).await {
                Err(e) if e.is_retryable() && tries < PERSIST_TRIES => {
                    warn!(transaction_id = %tx.id, error = %e, tries, "failed to persist outcome; retrying");
                    tokio::time::sleep(PERSIST_BACKOFF * tries).await;
                    tries += 1;
                }
                result => return result,
            }
        }
    }

    fn should_reconcile(&self, previous: &Transaction) -> bool {
        self.policy == UnknownOutcomePolicy::Reconcile
            && previous.response_code.as_deref() == Some(TIMEOUT_CODE)
    }

    /// Asks the gateway what happened to a timed-out attempt.
    async fn reconcile(
        &self,
        previous: &Transaction,
        context: &OperationContext,
    ) -> Option<GatewayResponse> {
        let lookup_context = OperationContext {
            transaction_id: previous.id,
            attempt: previous.attempt,
            ..context.clone()
        };
        match tokio::time::timeout(self.timeout, self.gateway.lookup(&lookup_context)).await {
            Ok(Ok(Some(response))) => {
                info!(previous = %previous.id, code = %response.response_code, "reconciled outcome of timed-out attempt");
                Some(response)
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!(previous = %previous.id, error = %e, "outcome lookup failed; re-executing");
                None
            }
            Err(_) => {
                warn!(previous = %previous.id, "outcome lookup timed out; re-executing");
                None
            }
        }
    }

    async fn call_gateway(
        &self,
        tx: &Transaction,
        context: OperationContext,
    ) -> std::result::Result<GatewayResponse, GatewayError> {
        let request = GatewayRequest {
            kind: tx.kind,
            amount: tx.amount,
            currency: tx.currency.clone(),
            account_reference: tx.account_reference.clone(),
            context,
        };
        match tokio::time::timeout(self.timeout, self.gateway.execute(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(transaction_id = %tx.id, timeout_ms = self.timeout.as_millis() as u64, "gateway call timed out");
                Err(GatewayError::Timeout)
            }
        }
    }
}

/// Entry point for every caller-facing financial operation.
///
/// Each operation validates its request, goes through idempotency admission,
/// and, when admitted, executes the gateway call and persists the result.
/// Declines come back as `Ok` with status `declined`; retryable gateway
/// outcomes come back as `PaymentError::GatewayRetryable`.
pub struct PaymentEngine {
    transactions: TransactionStoreRef,
    methods: PaymentMethodStoreRef,
    gateway: GatewayClientRef,
    clock: ClockRef,
    config: Arc<Config>,
    codes: Arc<CodeTable>,
    idempotency: IdempotencyEngine,
    verification: VerificationScheduler,
}

impl PaymentEngine {
    pub fn new(
        transactions: TransactionStoreRef,
        methods: PaymentMethodStoreRef,
        gateway: GatewayClientRef,
        clock: ClockRef,
        config: Config,
    ) -> Self {
        let idempotency = IdempotencyEngine::new(
            transactions.clone(),
            clock.clone(),
            config.resolved_idempotency(),
        );
        let verification = VerificationScheduler::new(
            methods.clone(),
            clock.clone(),
            config.return_code_table(),
            config.verification.clone(),
        );
        Self {
            transactions,
            methods,
            gateway,
            clock,
            codes: Arc::new(config.code_table()),
            config: Arc::new(config),
            idempotency,
            verification,
        }
    }

    /// The verification scheduler sharing this engine's stores.
    pub fn verification(&self) -> &VerificationScheduler {
        &self.verification
    }

    #[instrument(skip(self, request), fields(key = %request.idempotency_key))]
    pub async fn authorize(&self, request: DebitRequest) -> Result<Transaction> {
        self.debit(OperationKind::Authorize, request).await
    }

    #[instrument(skip(self, request), fields(key = %request.idempotency_key))]
    pub async fn sale(&self, request: DebitRequest) -> Result<Transaction> {
        self.debit(OperationKind::Sale, request).await
    }

    #[instrument(skip(self, request), fields(key = %request.idempotency_key, parent = %request.parent))]
    pub async fn capture(&self, request: CaptureRequest) -> Result<Transaction> {
        let amount = Amount::new(request.amount)?;
        self.child(
            OperationKind::Capture,
            request.idempotency_key,
            request.parent,
            Some(amount),
        )
        .await
    }

    #[instrument(skip(self, request), fields(key = %request.idempotency_key, parent = %request.parent))]
    pub async fn void(&self, request: VoidRequest) -> Result<Transaction> {
        self.child(
            OperationKind::Void,
            request.idempotency_key,
            request.parent,
            None,
        )
        .await
    }

    #[instrument(skip(self, request), fields(key = %request.idempotency_key, parent = %request.parent))]
    pub async fn refund(&self, request: RefundRequest) -> Result<Transaction> {
        let amount = Amount::new(request.amount)?;
        self.child(
            OperationKind::Refund,
            request.idempotency_key,
            request.parent,
            Some(amount),
        )
        .await
    }

    /// Sends a zero-amount verification for the account and, when approved,
    /// creates the payment method in the same atomic write.
    #[instrument(skip(self, request), fields(key = %request.idempotency_key, owner = %request.owner))]
    pub async fn link_and_verify_account(
        &self,
        request: LinkAccountRequest,
    ) -> Result<LinkedAccount> {
        self.ensure_supported(&request.currency)?;
        if request.owner.trim().is_empty() {
            return Err(PaymentError::ValidationError(
                "Owner must not be empty".to_string(),
            ));
        }
        let account_reference = non_empty_reference(request.account_reference)?;
        let candidate = Transaction::root(
            OperationKind::Verify,
            Decimal::ZERO,
            request.currency,
            request.idempotency_key,
            account_reference,
            None,
            self.clock.now(),
        );
        let link = LinkIntent {
            owner: request.owner,
            kind: request.kind,
            grace_period: self.config.verification.grace_period(),
        };

        let (transaction, payment_method) = match self.idempotency.admit(candidate).await? {
            Decision::Replay(tx) => {
                let method = self.methods.by_verification_transaction(tx.id).await?;
                (tx, method)
            }
            Decision::Execute {
                transaction,
                previous,
            } => self.settle(transaction, previous, None, Some(link)).await?,
        };
        Ok(LinkedAccount {
            transaction: retryable_as_error(transaction)?,
            payment_method,
        })
    }

    /// Feeds an out-of-band return signal to the verification scheduler.
    pub async fn report_return_signal(
        &self,
        payment_method: PaymentMethodId,
        code: &str,
    ) -> Result<SignalReport> {
        self.verification.ingest_return_signal(payment_method, code).await
    }

    pub async fn transaction(&self, id: TransactionId) -> Result<Transaction> {
        self.transactions
            .get(id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("transaction {}", id)))
    }

    /// Every transaction of a group plus its derived totals.
    pub async fn group(&self, group_id: GroupId) -> Result<GroupView> {
        let transactions = self.transactions.group(group_id).await?;
        let summary = GroupSummary::from_transactions(&transactions)
            .ok_or_else(|| PaymentError::NotFound(format!("group {}", group_id)))?;
        Ok(GroupView {
            summary,
            transactions,
        })
    }

    pub async fn payment_method(&self, id: PaymentMethodId) -> Result<PaymentMethod> {
        self.methods
            .get(id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("payment method {}", id)))
    }

    /// The transaction currently bound to an idempotency key.
    pub async fn transaction_by_key(&self, key: &IdempotencyKey) -> Result<Transaction> {
        let record = self
            .transactions
            .record(key)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("idempotency key '{}'", key)))?;
        self.transaction(record.transaction_id).await
    }

    /// The payment method created by the verification admitted under `key`.
    pub async fn payment_method_by_link_key(&self, key: &IdempotencyKey) -> Result<PaymentMethod> {
        let verification = self.transaction_by_key(key).await?;
        self.methods
            .by_verification_transaction(verification.id)
            .await?
            .ok_or_else(|| {
                PaymentError::NotFound(format!("payment method linked under key '{}'", key))
            })
    }

    async fn debit(&self, kind: OperationKind, request: DebitRequest) -> Result<Transaction> {
        let amount = Amount::new(request.amount)?;
        self.ensure_supported(&request.currency)?;

        let (account_reference, payment_method_id) = match request.source {
            PaymentSource::Token(token) => (non_empty_reference(token)?, None),
            PaymentSource::Method(id) => {
                let method = self.payment_method(id).await?;
                // A key that was already admitted resolves through replay even
                // if the method has been deactivated since.
                if self
                    .transactions
                    .record(&request.idempotency_key)
                    .await?
                    .is_none()
                {
                    method.ensure_usable()?;
                }
                (method.account_reference, Some(id))
            }
        };

        let candidate = Transaction::root(
            kind,
            amount.value(),
            request.currency,
            request.idempotency_key,
            account_reference,
            payment_method_id,
            self.clock.now(),
        );
        self.execute(candidate, None).await
    }

    async fn child(
        &self,
        kind: OperationKind,
        key: IdempotencyKey,
        parent_id: TransactionId,
        amount: Option<Amount>,
    ) -> Result<Transaction> {
        let parent = self.transaction(parent_id).await?;
        let amount = amount.map(|a| a.value()).unwrap_or(parent.amount);
        let candidate = Transaction::child(kind, amount, &parent, key, self.clock.now());
        self.execute(candidate, parent.reference_token).await
    }

    async fn execute(
        &self,
        candidate: Transaction,
        parent_reference: Option<String>,
    ) -> Result<Transaction> {
        let transaction = match self.idempotency.admit(candidate).await? {
            Decision::Replay(tx) => tx,
            Decision::Execute {
                transaction,
                previous,
            } => {
                self.settle(transaction, previous, parent_reference, None)
                    .await?
                    .0
            }
        };
        retryable_as_error(transaction)
    }

    /// Runs the settlement on a detached task and waits for it.
    async fn settle(
        &self,
        transaction: Transaction,
        previous: Option<Transaction>,
        parent_reference: Option<String>,
        link: Option<LinkIntent>,
    ) -> Result<(Transaction, Option<PaymentMethod>)> {
        let settlement = Settlement {
            store: self.transactions.clone(),
            gateway: self.gateway.clone(),
            clock: self.clock.clone(),
            codes: self.codes.clone(),
            timeout: self.config.gateway.timeout(),
            policy: self.config.gateway.unknown_outcome,
            parent_reference,
            link,
        };
        tokio::spawn(settlement.execute(transaction, previous)).await?
    }

    fn ensure_supported(&self, currency: &Currency) -> Result<()> {
        if self.config.supports(currency) {
            Ok(())
        } else {
            Err(PaymentError::ValidationError(format!(
                "Currency {} is not supported",
                currency
            )))
        }
    }
}

fn non_empty_reference(reference: String) -> Result<String> {
    let trimmed = reference.trim();
    if trimmed.is_empty() {
        return Err(PaymentError::ValidationError(
            "Account reference must not be empty".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

fn retryable_as_error(tx: Transaction) -> Result<Transaction> {
    if tx.status == TransactionStatus::Error {
        return Err(PaymentError::GatewayRetryable {
            transaction_id: tx.id,
            status: tx.status,
            response_code: tx.response_code.unwrap_or_default(),
        });
    }
    Ok(tx)
}
