use crate::domain::group::check_admission;
use crate::domain::idempotency::{Admission, IdempotencyKey, IdempotencyRecord};
use crate::domain::payment_method::{PaymentMethod, PaymentMethodId};
use crate::domain::ports::{PaymentMethodStore, TransactionStore};
use crate::domain::transaction::{GroupId, Transaction, TransactionId, TransactionStatus};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    transactions: HashMap<TransactionId, Transaction>,
    groups: HashMap<GroupId, Vec<TransactionId>>,
    records: HashMap<IdempotencyKey, IdempotencyRecord>,
    methods: HashMap<PaymentMethodId, PaymentMethod>,
}

impl State {
    fn group(&self, group_id: GroupId) -> Vec<Transaction> {
        self.groups
            .get(&group_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.transactions.get(id))
            .cloned()
            .collect()
    }

    fn existing(&self, record: &IdempotencyRecord) -> Result<Admission> {
        let transaction = self
            .transactions
            .get(&record.transaction_id)
            .cloned()
            .ok_or_else(|| {
                PaymentError::StorageError(format!(
                    "idempotency record '{}' points at missing transaction {}",
                    record.key, record.transaction_id
                ))
            })?;
        Ok(Admission::Existing {
            record: record.clone(),
            transaction,
        })
    }

    /// Runs the group caps for `tx`, ignoring the attempt it replaces.
    fn check_group(&self, tx: &Transaction, replacing: Option<TransactionId>) -> Result<()> {
        let parent = tx.parent_id.and_then(|id| self.transactions.get(&id));
        let mut group = self.group(tx.group_id);
        group.retain(|member| Some(member.id) != replacing);
        check_admission(tx, parent, &group)
    }

    /// Closes a replaced attempt that never recorded its outcome.
    fn abandon(&mut self, id: TransactionId, now: DateTime<Utc>) -> Result<()> {
        if let Some(current) = self.transactions.get_mut(&id)
            && !current.status.is_terminal()
        {
            current.abandon(now)?;
        }
        Ok(())
    }

    fn insert(&mut self, tx: Transaction) {
        self.groups.entry(tx.group_id).or_default().push(tx.id);
        self.transactions.insert(tx.id, tx);
    }

    fn replace(&mut self, tx: Transaction) -> Result<()> {
        let current = self
            .transactions
            .get_mut(&tx.id)
            .ok_or_else(|| PaymentError::NotFound(format!("transaction {}", tx.id)))?;
        if current.status.is_terminal() {
            return Err(PaymentError::IllegalTransition(format!(
                "transaction {} is {} and immutable",
                current.id, current.status
            )));
        }
        *current = tx;
        Ok(())
    }
}

/// A thread-safe in-memory store for transactions, idempotency records and
/// payment methods.
///
/// All maps live behind one `RwLock` so that each trait method is a single
/// atomic unit, mirroring a relational transaction.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryStore {
    async fn admit(&self, tx: Transaction) -> Result<Admission> {
        let mut state = self.state.write().await;
        if let Some(record) = state.records.get(&tx.idempotency_key) {
            return state.existing(record);
        }
        state.check_group(&tx, None)?;
        state
            .records
            .insert(tx.idempotency_key.clone(), IdempotencyRecord::for_transaction(&tx));
        state.insert(tx.clone());
        Ok(Admission::Admitted(tx))
    }

    async fn readmit(&self, failed: TransactionId, tx: Transaction) -> Result<Admission> {
        let mut state = self.state.write().await;
        let record = state
            .records
            .get(&tx.idempotency_key)
            .cloned()
            .ok_or_else(|| {
                PaymentError::NotFound(format!("idempotency record '{}'", tx.idempotency_key))
            })?;
        if record.transaction_id != failed || record.is_completed() {
            return state.existing(&record);
        }
        state.check_group(&tx, Some(failed))?;
        state.abandon(failed, tx.created_at)?;
        if let Some(record) = state.records.get_mut(&tx.idempotency_key) {
            record.transaction_id = tx.id;
        }
        state.insert(tx.clone());
        Ok(Admission::Admitted(tx))
    }

    async fn update(&self, tx: Transaction) -> Result<()> {
        let mut state = self.state.write().await;
        state.replace(tx)
    }

    async fn complete(&self, tx: Transaction, method: Option<PaymentMethod>) -> Result<()> {
        let mut state = self.state.write().await;
        let completed_at = (tx.status != TransactionStatus::Error)
            .then_some(tx.completed_at)
            .flatten();
        let key = tx.idempotency_key.clone();
        let id = tx.id;
        state.replace(tx)?;
        if let Some(record) = state.records.get_mut(&key)
            && record.transaction_id == id
        {
            record.completed_at = completed_at;
        }
        if let Some(method) = method {
            state.methods.insert(method.id, method);
        }
        Ok(())
    }

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>> {
        let state = self.state.read().await;
        Ok(state.transactions.get(&id).cloned())
    }

    async fn group(&self, group_id: GroupId) -> Result<Vec<Transaction>> {
        let state = self.state.read().await;
        Ok(state.group(group_id))
    }

    async fn record(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        let state = self.state.read().await;
        Ok(state.records.get(key).cloned())
    }
}

#[async_trait]
impl PaymentMethodStore for InMemoryStore {
    async fn get(&self, id: PaymentMethodId) -> Result<Option<PaymentMethod>> {
        let state = self.state.read().await;
        Ok(state.methods.get(&id).cloned())
    }

    async fn by_verification_transaction(
        &self,
        tx_id: TransactionId,
    ) -> Result<Option<PaymentMethod>> {
        let state = self.state.read().await;
        Ok(state
            .methods
            .values()
            .find(|method| method.verification_transaction_id == tx_id)
            .cloned())
    }

    async fn due_for_promotion(&self, now: DateTime<Utc>) -> Result<Vec<PaymentMethod>> {
        let state = self.state.read().await;
        Ok(state
            .methods
            .values()
            .filter(|method| method.is_due_for_promotion(now))
            .cloned()
            .collect())
    }

    async fn update_if_revision(
        &self,
        method: PaymentMethod,
        expected_revision: u64,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.methods.get_mut(&method.id) {
            Some(current) if current.revision == expected_revision => {
                *current = method;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PaymentError::NotFound(format!("payment method {}", method.id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payment_method::MethodKind;
    use crate::domain::taxonomy::ResponseCategory;
    use crate::domain::transaction::OperationKind;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn authorize(key: &str) -> Transaction {
        Transaction::root(
            OperationKind::Authorize,
            dec!(50),
            "USD".parse().unwrap(),
            IdempotencyKey::new(key).unwrap(),
            "tok_visa".to_string(),
            None,
            Utc::now(),
        )
    }

    fn finish(mut tx: Transaction, category: ResponseCategory) -> Transaction {
        let now = Utc::now();
        tx.transition(TransactionStatus::Submitted, now).unwrap();
        tx.settle(category, "00".into(), Some("ref".into()), None, now)
            .unwrap();
        tx
    }

    #[tokio::test]
    async fn test_admit_is_insert_if_absent() {
        let store = InMemoryStore::new();
        let first = authorize("K1");
        let admitted = store.admit(first.clone()).await.unwrap();
        assert_eq!(admitted, Admission::Admitted(first.clone()));

        let second = authorize("K1");
        match store.admit(second.clone()).await.unwrap() {
            Admission::Existing {
                record,
                transaction,
            } => {
                assert_eq!(record.transaction_id, first.id);
                assert_eq!(transaction, first);
            }
            other => panic!("expected existing admission, got {:?}", other),
        }
        assert!(TransactionStore::get(&store, second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_marks_record_and_freezes_transaction() {
        let store = InMemoryStore::new();
        let tx = authorize("K1");
        store.admit(tx.clone()).await.unwrap();
        let done = finish(tx, ResponseCategory::Approved);
        store.complete(done.clone(), None).await.unwrap();

        let record = store.record(&done.idempotency_key).await.unwrap().unwrap();
        assert!(record.is_completed());
        assert!(matches!(
            store.update(done).await,
            Err(PaymentError::IllegalTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_readmit_only_after_retryable_error() {
        let store = InMemoryStore::new();
        let tx = authorize("K1");
        store.admit(tx.clone()).await.unwrap();
        let failed = finish(tx, ResponseCategory::RetryableError);
        store.complete(failed.clone(), None).await.unwrap();
        let record = store.record(&failed.idempotency_key).await.unwrap().unwrap();
        assert!(!record.is_completed());

        let retry = failed.next_attempt(Utc::now());
        let admitted = store.readmit(failed.id, retry.clone()).await.unwrap();
        assert_eq!(admitted, Admission::Admitted(retry.clone()));

        // A second racer holding the stale failed id sees the new attempt.
        let late = failed.next_attempt(Utc::now());
        match store.readmit(failed.id, late).await.unwrap() {
            Admission::Existing { transaction, .. } => assert_eq!(transaction.id, retry.id),
            other => panic!("expected existing admission, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_readmit_abandons_stranded_attempt() {
        let store = InMemoryStore::new();
        let tx = authorize("K1");
        store.admit(tx.clone()).await.unwrap();
        let mut submitted = tx.clone();
        submitted
            .transition(TransactionStatus::Submitted, Utc::now())
            .unwrap();
        store.update(submitted.clone()).await.unwrap();

        let retry = submitted.next_attempt(Utc::now());
        let admitted = store.readmit(submitted.id, retry.clone()).await.unwrap();
        assert_eq!(admitted, Admission::Admitted(retry));

        let stranded = TransactionStore::get(&store, tx.id).await.unwrap().unwrap();
        assert!(stranded.outcome_unknown());
        // The stalled executor can no longer overwrite it.
        assert!(matches!(
            store.update(submitted).await,
            Err(PaymentError::IllegalTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_admit_checks_group_caps() {
        let store = InMemoryStore::new();
        let auth = authorize("A1");
        store.admit(auth.clone()).await.unwrap();
        let auth = finish(auth, ResponseCategory::Approved);
        store.complete(auth.clone(), None).await.unwrap();

        let capture = Transaction::child(
            OperationKind::Capture,
            dec!(60),
            &auth,
            IdempotencyKey::new("C1").unwrap(),
            Utc::now(),
        );
        assert!(matches!(
            store.admit(capture.clone()).await,
            Err(PaymentError::AmountExceedsRemaining { .. })
        ));
        // Rejection leaves no record behind.
        assert!(store.record(&capture.idempotency_key).await.unwrap().is_none());
        assert_eq!(store.group(auth.group_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_payment_method_conditional_update() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let tx = Transaction::root(
            OperationKind::Verify,
            dec!(0),
            "USD".parse().unwrap(),
            IdempotencyKey::new("L1").unwrap(),
            "021000021:1".to_string(),
            None,
            now,
        );
        store.admit(tx.clone()).await.unwrap();
        let method = PaymentMethod::linked(
            "cust".into(),
            MethodKind::BankAccount,
            "021000021:1".into(),
            tx.id,
            Duration::days(3),
            now,
        );
        let tx = finish(tx, ResponseCategory::Approved);
        store.complete(tx.clone(), Some(method.clone())).await.unwrap();

        assert_eq!(
            store.by_verification_transaction(tx.id).await.unwrap(),
            Some(method.clone())
        );
        assert!(store.due_for_promotion(now).await.unwrap().is_empty());
        let due = store
            .due_for_promotion(now + Duration::days(3))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);

        let mut promoted = method.clone();
        promoted.promote(now).unwrap();
        assert!(store.update_if_revision(promoted.clone(), 0).await.unwrap());
        // The second writer still expects revision 0 and loses.
        assert!(!store.update_if_revision(promoted, 0).await.unwrap());
    }
}
