mod common;

use common::{debit, flaky_harness, harness, harness_with, key, response};
use paygate::application::engine::CaptureRequest;
use paygate::config::{Config, UnknownOutcomePolicy};
use paygate::domain::ports::{GatewayError, TransactionStore};
use paygate::domain::transaction::TransactionStatus;
use paygate::error::PaymentError;
use rust_decimal_macros::dec;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_execute_once() {
    let h = harness();
    h.gateway.set_delay(Duration::from_millis(100));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.authorize(debit("K1", dec!(50.00), "tok_visa")).await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }
    assert!(results.iter().all(|tx| tx == &results[0]));
    assert_eq!(results[0].status, TransactionStatus::Approved);
    assert_eq!(h.gateway.calls(), 1);

    let group = h.store.group(results[0].group_id).await.unwrap();
    assert_eq!(group.len(), 1);
}

#[tokio::test]
async fn test_retry_after_success_replays_original() {
    let h = harness();
    let first = h
        .engine
        .authorize(debit("K1", dec!(50.00), "tok_visa"))
        .await
        .unwrap();
    let second = h
        .engine
        .authorize(debit("K1", dec!(50.00), "tok_visa"))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(h.gateway.calls(), 1);
}

#[tokio::test]
async fn test_key_reuse_with_different_request_is_rejected() {
    let h = harness();
    let auth = h
        .engine
        .authorize(debit("K1", dec!(50.00), "tok_visa"))
        .await
        .unwrap();

    let result = h.engine.authorize(debit("K1", dec!(60.00), "tok_visa")).await;
    assert!(matches!(result, Err(PaymentError::KeyReuseMismatch { .. })));

    let result = h.engine.sale(debit("K1", dec!(50.00), "tok_visa")).await;
    assert!(matches!(result, Err(PaymentError::KeyReuseMismatch { .. })));

    let result = h
        .engine
        .capture(CaptureRequest {
            idempotency_key: key("K1"),
            parent: auth.id,
            amount: dec!(10),
        })
        .await;
    assert!(matches!(result, Err(PaymentError::KeyReuseMismatch { .. })));
    assert_eq!(h.gateway.calls(), 1);
}

#[tokio::test]
async fn test_retryable_error_allows_new_attempt() {
    let h = harness();
    h.gateway.push_code("91");

    let failed = match h.engine.sale(debit("S1", dec!(20), "tok_visa")).await {
        Err(PaymentError::GatewayRetryable {
            transaction_id,
            status,
            response_code,
        }) => {
            assert_eq!(status, TransactionStatus::Error);
            assert_eq!(response_code, "91");
            transaction_id
        }
        other => panic!("expected a retryable error, got {:?}", other),
    };

    let retried = h
        .engine
        .sale(debit("S1", dec!(20), "tok_visa"))
        .await
        .unwrap();
    assert_eq!(retried.status, TransactionStatus::Approved);
    assert_ne!(retried.id, failed);
    assert_eq!(retried.attempt, 2);
    assert_eq!(h.gateway.calls(), 2);

    // The failed attempt stays on record, unchanged.
    let old = h.engine.transaction(failed).await.unwrap();
    assert_eq!(old.status, TransactionStatus::Error);

    let replay = h
        .engine
        .sale(debit("S1", dec!(20), "tok_visa"))
        .await
        .unwrap();
    assert_eq!(replay, retried);
    assert_eq!(h.gateway.calls(), 2);
}

#[tokio::test]
async fn test_attempts_forward_key_and_attempt_to_gateway() {
    let h = harness();
    h.gateway.push(Err(GatewayError::Unavailable("503".into())));

    assert!(h.engine.sale(debit("S1", dec!(20), "tok_visa")).await.is_err());
    h.engine
        .sale(debit("S1", dec!(20), "tok_visa"))
        .await
        .unwrap();

    let requests = h.gateway.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.context.idempotency_key == key("S1")));
    assert_eq!(requests[0].context.attempt, 1);
    assert_eq!(requests[1].context.attempt, 2);
}

#[tokio::test]
async fn test_reconcile_resolves_timed_out_attempt() {
    let h = harness();
    h.gateway.push(Err(GatewayError::Timeout));
    h.gateway.set_lookup(response("00"));

    let first = h.engine.authorize(debit("K1", dec!(50), "tok_visa")).await;
    assert!(matches!(
        first,
        Err(PaymentError::GatewayRetryable { ref response_code, .. }) if response_code == "timeout"
    ));

    let retried = h
        .engine
        .authorize(debit("K1", dec!(50), "tok_visa"))
        .await
        .unwrap();
    assert_eq!(retried.status, TransactionStatus::Approved);
    assert_eq!(h.gateway.lookups(), 1);
    assert_eq!(h.gateway.calls(), 1);
}

#[tokio::test]
async fn test_blind_retry_re_executes_timed_out_attempt() {
    let mut config = Config::default();
    config.gateway.unknown_outcome = UnknownOutcomePolicy::BlindRetry;
    let h = harness_with(config);
    h.gateway.push(Err(GatewayError::Timeout));
    h.gateway.set_lookup(response("00"));

    assert!(h.engine.authorize(debit("K1", dec!(50), "tok_visa")).await.is_err());
    let retried = h
        .engine
        .authorize(debit("K1", dec!(50), "tok_visa"))
        .await
        .unwrap();
    assert_eq!(retried.status, TransactionStatus::Approved);
    assert_eq!(h.gateway.lookups(), 0);
    assert_eq!(h.gateway.calls(), 2);
}

#[tokio::test]
async fn test_slow_gateway_is_cut_off_by_timeout() {
    let mut config = Config::default();
    config.gateway.timeout_ms = 20;
    let h = harness_with(config);
    h.gateway.set_delay(Duration::from_millis(500));

    let result = h.engine.authorize(debit("K1", dec!(5), "tok_visa")).await;
    assert!(matches!(
        result,
        Err(PaymentError::GatewayRetryable { ref response_code, .. }) if response_code == "timeout"
    ));
}

#[tokio::test]
async fn test_abandoned_caller_still_completes() {
    let h = harness();
    h.gateway.set_delay(Duration::from_millis(200));

    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        h.engine.authorize(debit("K1", dec!(50), "tok_visa")),
    )
    .await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(400)).await;

    let tx = h
        .engine
        .authorize(debit("K1", dec!(50), "tok_visa"))
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Approved);
    assert!(tx.completed_at.is_some());
    assert_eq!(h.gateway.calls(), 1);
}

#[tokio::test]
async fn test_duplicate_gives_up_while_first_is_in_flight() {
    let mut config = Config::default();
    config.idempotency.in_progress_wait_ms = 50;
    config.idempotency.poll_interval_ms = 10;
    let h = harness_with(config);
    h.gateway.set_delay(Duration::from_millis(500));

    let engine = h.engine.clone();
    let first = tokio::spawn(async move {
        engine.authorize(debit("K1", dec!(50), "tok_visa")).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let duplicate = h.engine.authorize(debit("K1", dec!(50), "tok_visa")).await;
    match duplicate {
        Err(e @ PaymentError::InProgress { .. }) => assert!(e.is_retryable()),
        other => panic!("expected in-progress, got {:?}", other),
    }

    let tx = first.await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Approved);
    assert_eq!(h.gateway.calls(), 1);
}

#[tokio::test]
async fn test_transient_write_failure_is_retried() {
    let h = flaky_harness(Config::default());
    h.store.fail_completes(1);

    let tx = h
        .engine
        .authorize(debit("K1", dec!(50), "tok_visa"))
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Approved);
    assert!(h.store.record(&key("K1")).await.unwrap().unwrap().is_completed());
    assert_eq!(h.gateway.calls(), 1);
}

#[tokio::test]
async fn test_stranded_attempt_is_reconciled_after_abandon_threshold() {
    let mut config = Config::default();
    config.idempotency.in_progress_wait_ms = 20;
    config.idempotency.poll_interval_ms = 5;
    let h = flaky_harness(config);
    h.store.fail_completes(10);

    let first = h.engine.authorize(debit("K1", dec!(50), "tok_visa")).await;
    assert!(matches!(first, Err(PaymentError::StorageError(_))));
    h.store.fail_completes(0);

    // The outcome was never written, so the key still looks in flight.
    let stranded_id = match h.engine.authorize(debit("K1", dec!(50), "tok_visa")).await {
        Err(PaymentError::InProgress { transaction_id, .. }) => transaction_id,
        other => panic!("expected in-progress, got {:?}", other),
    };

    h.clock.advance(chrono::Duration::seconds(61));
    h.gateway.set_lookup(response("00"));
    let recovered = h
        .engine
        .authorize(debit("K1", dec!(50), "tok_visa"))
        .await
        .unwrap();
    assert_eq!(recovered.status, TransactionStatus::Approved);
    assert_eq!(recovered.attempt, 2);
    assert_eq!(h.gateway.calls(), 1);
    assert_eq!(h.gateway.lookups(), 1);

    let stranded = h.store.get(stranded_id).await.unwrap().unwrap();
    assert_eq!(stranded.status, TransactionStatus::Error);
    assert!(stranded.outcome_unknown());
    assert_eq!(
        h.store.record(&key("K1")).await.unwrap().unwrap().transaction_id,
        recovered.id
    );
}
