use crate::domain::group::check_admission;
use crate::domain::idempotency::{Admission, IdempotencyKey, IdempotencyRecord};
use crate::domain::payment_method::{PaymentMethod, PaymentMethodId};
use crate::domain::ports::{PaymentMethodStore, TransactionStore};
use crate::domain::transaction::{GroupId, Transaction, TransactionId, TransactionStatus};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for transaction records, keyed by transaction id.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Column Family for idempotency records, keyed by idempotency key.
pub const CF_IDEMPOTENCY: &str = "idempotency";
/// Column Family indexing group membership: `group id ++ transaction id`.
pub const CF_GROUPS: &str = "groups";
/// Column Family for payment methods, keyed by payment method id.
pub const CF_PAYMENT_METHODS: &str = "payment_methods";

/// A persistent store implementation using RocksDB.
///
/// Multi-entity writes go through one `WriteBatch`, so a record never lands
/// without its transaction. Read-check-write sections (admission, conditional
/// updates) are serialized by `write_lock`.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path, creating
    /// any missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [CF_TRANSACTIONS, CF_IDEMPOTENCY, CF_GROUPS, CF_PAYMENT_METHODS]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PaymentError::StorageError(format!("column family '{}' not found", name)))
    }

    fn read<T: DeserializeOwned>(&self, name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(name)?;
        match self.db.get_pinned_cf(cf, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn stage<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        name: &str,
        key: &[u8],
        value: &T,
    ) -> Result<()> {
        let cf = self.cf(name)?;
        batch.put_cf(cf, key, serde_json::to_vec(value)?);
        Ok(())
    }

    fn stage_new_transaction(&self, batch: &mut WriteBatch, tx: &Transaction) -> Result<()> {
        self.stage(batch, CF_TRANSACTIONS, tx.id.0.as_bytes(), tx)?;
        let cf = self.cf(CF_GROUPS)?;
        batch.put_cf(cf, group_key(tx.group_id, tx.id), b"");
        Ok(())
    }

    fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        self.read(CF_TRANSACTIONS, id.0.as_bytes())
    }

    fn idempotency_record(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        self.read(CF_IDEMPOTENCY, key.as_str().as_bytes())
    }

    fn group_members(&self, group_id: GroupId) -> Result<Vec<Transaction>> {
        let cf = self.cf(CF_GROUPS)?;
        let prefix = group_id.0.as_bytes().to_vec();
        let mut members = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let tx_id = uuid::Uuid::from_slice(&key[prefix.len()..])
                .map_err(|e| PaymentError::StorageError(format!("corrupt group index: {}", e)))?;
            if let Some(tx) = self.transaction(TransactionId(tx_id))? {
                members.push(tx);
            }
        }
        members.sort_by_key(|tx| tx.created_at);
        Ok(members)
    }

    fn existing(&self, record: IdempotencyRecord) -> Result<Admission> {
        let transaction = self.transaction(record.transaction_id)?.ok_or_else(|| {
            PaymentError::StorageError(format!(
                "idempotency record '{}' points at missing transaction {}",
                record.key, record.transaction_id
            ))
        })?;
        Ok(Admission::Existing {
            record,
            transaction,
        })
    }

    /// Runs the group caps for `tx`, ignoring the attempt it replaces.
    fn check_group(&self, tx: &Transaction, replacing: Option<TransactionId>) -> Result<()> {
        let parent = match tx.parent_id {
            Some(id) => self.transaction(id)?,
            None => None,
        };
        let mut group = self.group_members(tx.group_id)?;
        group.retain(|member| Some(member.id) != replacing);
        check_admission(tx, parent.as_ref(), &group)
    }

    fn mutable_transaction(&self, id: TransactionId) -> Result<Transaction> {
        let current = self
            .transaction(id)?
            .ok_or_else(|| PaymentError::NotFound(format!("transaction {}", id)))?;
        if current.status.is_terminal() {
            return Err(PaymentError::IllegalTransition(format!(
                "transaction {} is {} and immutable",
                current.id, current.status
            )));
        }
        Ok(current)
    }
}

fn group_key(group_id: GroupId, tx_id: TransactionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(group_id.0.as_bytes());
    key.extend_from_slice(tx_id.0.as_bytes());
    key
}

#[async_trait]
impl TransactionStore for RocksDBStore {
    async fn admit(&self, tx: Transaction) -> Result<Admission> {
        let _guard = self.write_lock.lock().await;
        if let Some(record) = self.idempotency_record(&tx.idempotency_key)? {
            return self.existing(record);
        }
        self.check_group(&tx, None)?;

        let record = IdempotencyRecord::for_transaction(&tx);
        let mut batch = WriteBatch::default();
        self.stage(&mut batch, CF_IDEMPOTENCY, record.key.as_str().as_bytes(), &record)?;
        self.stage_new_transaction(&mut batch, &tx)?;
        self.db.write(batch)?;
        Ok(Admission::Admitted(tx))
    }

    async fn readmit(&self, failed: TransactionId, tx: Transaction) -> Result<Admission> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.idempotency_record(&tx.idempotency_key)?.ok_or_else(|| {
            PaymentError::NotFound(format!("idempotency record '{}'", tx.idempotency_key))
        })?;
        if record.transaction_id != failed || record.is_completed() {
            return self.existing(record);
        }
        self.check_group(&tx, Some(failed))?;

        record.transaction_id = tx.id;
        let mut batch = WriteBatch::default();
        if let Some(mut stranded) = self.transaction(failed)?
            && !stranded.status.is_terminal()
        {
            stranded.abandon(tx.created_at)?;
            self.stage(&mut batch, CF_TRANSACTIONS, stranded.id.0.as_bytes(), &stranded)?;
        }
        self.stage(&mut batch, CF_IDEMPOTENCY, record.key.as_str().as_bytes(), &record)?;
        self.stage_new_transaction(&mut batch, &tx)?;
        self.db.write(batch)?;
        Ok(Admission::Admitted(tx))
    }

    async fn update(&self, tx: Transaction) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.mutable_transaction(tx.id)?;
        let mut batch = WriteBatch::default();
        self.stage(&mut batch, CF_TRANSACTIONS, tx.id.0.as_bytes(), &tx)?;
        self.db.write(batch)?;
        Ok(())
    }

    async fn complete(&self, tx: Transaction, method: Option<PaymentMethod>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.mutable_transaction(tx.id)?;

        let mut batch = WriteBatch::default();
        self.stage(&mut batch, CF_TRANSACTIONS, tx.id.0.as_bytes(), &tx)?;
        if let Some(mut record) = self.idempotency_record(&tx.idempotency_key)?
            && record.transaction_id == tx.id
            && tx.status != TransactionStatus::Error
        {
            record.completed_at = tx.completed_at;
            self.stage(&mut batch, CF_IDEMPOTENCY, record.key.as_str().as_bytes(), &record)?;
        }
        if let Some(method) = method {
            self.stage(&mut batch, CF_PAYMENT_METHODS, method.id.0.as_bytes(), &method)?;
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>> {
        self.transaction(id)
    }

    async fn group(&self, group_id: GroupId) -> Result<Vec<Transaction>> {
        self.group_members(group_id)
    }

    async fn record(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        self.idempotency_record(key)
    }
}

#[async_trait]
impl PaymentMethodStore for RocksDBStore {
    async fn get(&self, id: PaymentMethodId) -> Result<Option<PaymentMethod>> {
        self.read(CF_PAYMENT_METHODS, id.0.as_bytes())
    }

    async fn by_verification_transaction(
        &self,
        tx_id: TransactionId,
    ) -> Result<Option<PaymentMethod>> {
        let cf = self.cf(CF_PAYMENT_METHODS)?;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            let method: PaymentMethod = serde_json::from_slice(&value)?;
            if method.verification_transaction_id == tx_id {
                return Ok(Some(method));
            }
        }
        Ok(None)
    }

    async fn due_for_promotion(&self, now: DateTime<Utc>) -> Result<Vec<PaymentMethod>> {
        let cf = self.cf(CF_PAYMENT_METHODS)?;
        let mut due = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            let method: PaymentMethod = serde_json::from_slice(&value)?;
            if method.is_due_for_promotion(now) {
                due.push(method);
            }
        }
        Ok(due)
    }

    async fn update_if_revision(
        &self,
        method: PaymentMethod,
        expected_revision: u64,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let current: PaymentMethod = self
            .read(CF_PAYMENT_METHODS, method.id.0.as_bytes())?
            .ok_or_else(|| PaymentError::NotFound(format!("payment method {}", method.id)))?;
        if current.revision != expected_revision {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        self.stage(&mut batch, CF_PAYMENT_METHODS, method.id.0.as_bytes(), &method)?;
        self.db.write(batch)?;
        Ok(true)
    }
}
