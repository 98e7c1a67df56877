use crate::config::IdempotencyConfig;
use crate::domain::idempotency::Admission;
use crate::domain::ports::{ClockRef, TransactionStoreRef};
use crate::domain::transaction::{Transaction, TransactionStatus};
use crate::error::{PaymentError, Result};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What the caller should do with a request after idempotency admission.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The caller is the canonical executor of `transaction`.
    ///
    /// `previous` is the failed attempt this one replaces, if any.
    Execute {
        transaction: Transaction,
        previous: Option<Transaction>,
    },
    /// The key already completed; return this transaction verbatim.
    Replay(Transaction),
}

/// At-most-one effective execution per idempotency key.
///
/// The store's insert-if-absent is the only arbiter; nothing here holds a lock,
/// so several engine instances may race on the same key safely.
pub struct IdempotencyEngine {
    store: TransactionStoreRef,
    clock: ClockRef,
    config: IdempotencyConfig,
}

impl IdempotencyEngine {
    pub fn new(store: TransactionStoreRef, clock: ClockRef, config: IdempotencyConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Admits `candidate` (a provisional transaction) or resolves it against
    /// the existing execution of the same key.
    ///
    /// - free key: the candidate is persisted and returned for execution;
    /// - completed key (approved/declined): the stored result is replayed;
    /// - key whose last attempt ended in a retryable error: a new attempt is
    ///   admitted in place of the failed one;
    /// - key in flight for longer than `abandon_after`: its executor is presumed
    ///   gone, and a new attempt replaces it with an unknown-outcome predecessor;
    /// - key still in flight: polls until it resolves or `in_progress_wait`
    ///   elapses, then fails with the retryable `InProgress`.
    pub async fn admit(&self, candidate: Transaction) -> Result<Decision> {
        let deadline = Instant::now() + self.config.in_progress_wait();
        let mut admission = self.store.admit(candidate.clone()).await?;

        loop {
            let (record, existing) = match admission {
                Admission::Admitted(transaction) => {
                    debug!(key = %transaction.idempotency_key, transaction_id = %transaction.id, "idempotency key admitted");
                    return Ok(Decision::Execute {
                        transaction,
                        previous: None,
                    });
                }
                Admission::Existing {
                    record,
                    transaction,
                } => (record, transaction),
            };

            if record.kind != candidate.kind || !existing.same_request(&candidate) {
                return Err(PaymentError::KeyReuseMismatch {
                    key: candidate.idempotency_key.to_string(),
                });
            }

            match existing.status {
                TransactionStatus::Approved | TransactionStatus::Declined => {
                    info!(key = %record.key, transaction_id = %existing.id, status = %existing.status, "replaying completed idempotency key");
                    return Ok(Decision::Replay(existing));
                }
                TransactionStatus::Error => match self.replace(&existing).await? {
                    Admission::Admitted(transaction) => {
                        info!(key = %record.key, transaction_id = %transaction.id, attempt = transaction.attempt, "re-attempting after retryable error");
                        return Ok(Decision::Execute {
                            transaction,
                            previous: Some(existing),
                        });
                    }
                    // Another caller re-admitted first; resolve against its attempt.
                    other => admission = other,
                },
                TransactionStatus::Created | TransactionStatus::Submitted
                    if self.clock.now() - existing.created_at >= self.config.abandon_after() =>
                {
                    let mut stranded = existing;
                    stranded.abandon(self.clock.now())?;
                    match self.replace(&stranded).await? {
                        Admission::Admitted(transaction) => {
                            warn!(key = %record.key, stranded_id = %stranded.id, transaction_id = %transaction.id, "replacing attempt that never recorded an outcome");
                            return Ok(Decision::Execute {
                                transaction,
                                previous: Some(stranded),
                            });
                        }
                        other => admission = other,
                    }
                }
                TransactionStatus::Created | TransactionStatus::Submitted => {
                    if Instant::now() >= deadline {
                        return Err(PaymentError::InProgress {
                            key: record.key.to_string(),
                            transaction_id: existing.id,
                        });
                    }
                    tokio::time::sleep(self.config.poll_interval()).await;
                    admission = self.store.admit(candidate.clone()).await?;
                }
            }
        }
    }

    async fn replace(&self, failed: &Transaction) -> Result<Admission> {
        let retry = failed.next_attempt(self.clock.now());
        self.store.readmit(failed.id, retry).await
    }
}
