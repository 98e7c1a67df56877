#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use paygate::application::engine::{DebitRequest, PaymentEngine, PaymentSource};
use paygate::config::Config;
use paygate::domain::idempotency::{Admission, IdempotencyKey, IdempotencyRecord};
use paygate::domain::payment_method::PaymentMethod;
use paygate::domain::ports::{
    Clock, GatewayClient, GatewayError, GatewayRequest, GatewayResponse, OperationContext,
    TransactionStore,
};
use paygate::domain::transaction::{GroupId, Transaction, TransactionId};
use paygate::error::{PaymentError, Result as StoreResult};
use paygate::infrastructure::in_memory::InMemoryStore;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Gateway that answers from a queue of scripted outcomes and approves once
/// the queue is empty.
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Result<GatewayResponse, GatewayError>>>,
    lookup: Mutex<Option<GatewayResponse>>,
    delay: Mutex<Option<std::time::Duration>>,
    requests: Mutex<Vec<GatewayRequest>>,
    calls: AtomicUsize,
    lookups: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: Result<GatewayResponse, GatewayError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn push_code(&self, code: &str) {
        self.push(Ok(response(code)));
    }

    pub fn set_lookup(&self, response: GatewayResponse) {
        *self.lookup.lock().unwrap() = Some(response);
    }

    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GatewayRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl GatewayClient for ScriptedGateway {
    async fn execute(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(response("00")))
    }

    async fn lookup(
        &self,
        _context: &OperationContext,
    ) -> Result<Option<GatewayResponse>, GatewayError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.lookup.lock().unwrap().clone())
    }
}

/// Transaction store whose next `complete` calls fail with a storage error.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryStore,
    failing_completes: AtomicUsize,
}

impl FlakyStore {
    pub fn fail_completes(&self, times: usize) {
        self.failing_completes.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionStore for FlakyStore {
    async fn admit(&self, tx: Transaction) -> StoreResult<Admission> {
        self.inner.admit(tx).await
    }

    async fn readmit(&self, failed: TransactionId, tx: Transaction) -> StoreResult<Admission> {
        self.inner.readmit(failed, tx).await
    }

    async fn update(&self, tx: Transaction) -> StoreResult<()> {
        self.inner.update(tx).await
    }

    async fn complete(&self, tx: Transaction, method: Option<PaymentMethod>) -> StoreResult<()> {
        let failing = self
            .failing_completes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PaymentError::StorageError("disk unavailable".to_string()));
        }
        self.inner.complete(tx, method).await
    }

    async fn get(&self, id: TransactionId) -> StoreResult<Option<Transaction>> {
        TransactionStore::get(&self.inner, id).await
    }

    async fn group(&self, group_id: GroupId) -> StoreResult<Vec<Transaction>> {
        self.inner.group(group_id).await
    }

    async fn record(&self, key: &IdempotencyKey) -> StoreResult<Option<IdempotencyRecord>> {
        self.inner.record(key).await
    }
}

pub fn response(code: &str) -> GatewayResponse {
    GatewayResponse {
        response_code: code.to_string(),
        reference_token: Some(format!("gw-{}", code)),
        message: None,
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

pub struct Harness {
    pub engine: Arc<PaymentEngine>,
    pub store: InMemoryStore,
    pub gateway: Arc<ScriptedGateway>,
    pub clock: Arc<ManualClock>,
}

pub fn harness() -> Harness {
    harness_with(Config::default())
}

pub fn harness_with(config: Config) -> Harness {
    let store = InMemoryStore::new();
    let gateway = Arc::new(ScriptedGateway::new());
    let clock = Arc::new(ManualClock::new(epoch()));
    let engine = PaymentEngine::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        gateway.clone(),
        clock.clone(),
        config,
    );
    Harness {
        engine: Arc::new(engine),
        store,
        gateway,
        clock,
    }
}

pub struct FlakyHarness {
    pub engine: Arc<PaymentEngine>,
    pub store: Arc<FlakyStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub clock: Arc<ManualClock>,
}

pub fn flaky_harness(config: Config) -> FlakyHarness {
    let store = Arc::new(FlakyStore::default());
    let gateway = Arc::new(ScriptedGateway::new());
    let clock = Arc::new(ManualClock::new(epoch()));
    let engine = PaymentEngine::new(
        store.clone(),
        Arc::new(store.inner.clone()),
        gateway.clone(),
        clock.clone(),
        config,
    );
    FlakyHarness {
        engine: Arc::new(engine),
        store,
        gateway,
        clock,
    }
}

pub fn key(value: &str) -> IdempotencyKey {
    IdempotencyKey::new(value).unwrap()
}

pub fn debit(idempotency_key: &str, amount: Decimal, token: &str) -> DebitRequest {
    DebitRequest {
        idempotency_key: key(idempotency_key),
        amount,
        currency: "USD".parse().unwrap(),
        source: PaymentSource::Token(token.to_string()),
    }
}
