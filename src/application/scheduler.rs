use crate::config::VerificationConfig;
use crate::domain::payment_method::{PaymentMethod, PaymentMethodId, ReturnOutcome};
use crate::domain::ports::{ClockRef, PaymentMethodStoreRef};
use crate::domain::taxonomy::{ReturnCodeTable, ReturnSeverity};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Conditional-update attempts before a contended return signal gives up.
const MAX_SIGNAL_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub promoted: usize,
    /// Methods another writer changed between selection and update.
    pub lost_races: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalReport {
    pub payment_method: PaymentMethod,
    pub severity: ReturnSeverity,
    pub outcome: ReturnOutcome,
}

/// Promotes bank accounts out of their grace window and applies return signals.
///
/// Every mutation is a conditional update on the method's revision, so sweeps
/// and signal ingestion may run concurrently from several instances; a lost
/// race is a no-op.
#[derive(Clone)]
pub struct VerificationScheduler {
    methods: PaymentMethodStoreRef,
    clock: ClockRef,
    returns: Arc<ReturnCodeTable>,
    config: VerificationConfig,
}

impl VerificationScheduler {
    pub fn new(
        methods: PaymentMethodStoreRef,
        clock: ClockRef,
        returns: ReturnCodeTable,
        config: VerificationConfig,
    ) -> Self {
        Self {
            methods,
            clock,
            returns: Arc::new(returns),
            config,
        }
    }

    /// Promotes every pending method whose grace deadline has passed.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(self.clock.now()).await
    }

    #[instrument(skip(self), name = "verification_sweep")]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let candidates = self.methods.due_for_promotion(now).await?;
        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };

        for method in candidates {
            // The selection may be stale; the conditional write decides.
            if !method.is_due_for_promotion(now) {
                continue;
            }
            let expected = method.revision;
            let mut promoted = method;
            promoted.promote(now)?;
            let id = promoted.id;
            if self.methods.update_if_revision(promoted, expected).await? {
                info!(payment_method = %id, "payment method verified after grace window");
                report.promoted += 1;
            } else {
                debug!(payment_method = %id, "payment method changed concurrently; skipped");
                report.lost_races += 1;
            }
        }
        Ok(report)
    }

    /// Classifies and applies one return signal.
    ///
    /// Severe codes deactivate immediately, whatever the grace window; minor
    /// codes deactivate once `minor_return_threshold` is reached. Signals for
    /// an already-deactivated method change nothing.
    #[instrument(skip(self, id), fields(payment_method = %id))]
    pub async fn ingest_return_signal(&self, id: PaymentMethodId, code: &str) -> Result<SignalReport> {
        if code.trim().is_empty() {
            return Err(PaymentError::ValidationError(
                "Return code must not be empty".to_string(),
            ));
        }
        let severity = self.returns.classify(code);
        let reason = self.returns.reason(code);

        for _ in 0..MAX_SIGNAL_ATTEMPTS {
            let mut method = self
                .methods
                .get(id)
                .await?
                .ok_or_else(|| PaymentError::NotFound(format!("payment method {}", id)))?;
            let expected = method.revision;
            let outcome = method.apply_return(
                code.trim(),
                severity,
                reason.clone(),
                self.config.minor_return_threshold,
                self.clock.now(),
            );
            if outcome == ReturnOutcome::AlreadyDeactivated {
                debug!(code, "return signal for deactivated payment method ignored");
                return Ok(SignalReport {
                    payment_method: method,
                    severity,
                    outcome,
                });
            }
            if self.methods.update_if_revision(method.clone(), expected).await? {
                match outcome {
                    ReturnOutcome::Deactivated => {
                        warn!(code, reason = %reason, "payment method deactivated by return signal")
                    }
                    _ => info!(code, returns = method.return_count, "minor return recorded"),
                }
                return Ok(SignalReport {
                    payment_method: method,
                    severity,
                    outcome,
                });
            }
        }
        Err(PaymentError::StorageError(format!(
            "payment method {} kept changing while applying return {}",
            id, code
        )))
    }

    /// Sweeps on every `sweep_interval` tick until `shutdown` flips to true or
    /// its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.config.sweep_interval_secs, "starting verification scheduler");
        let mut interval = tokio::time::interval(self.config.sweep_interval());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep().await {
                        Ok(report) => debug!(?report, "verification sweep finished"),
                        Err(e) => error!(error = %e, "verification sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("verification scheduler shutdown handle dropped");
                        break;
                    }
                    if *shutdown.borrow() {
                        info!("verification scheduler received shutdown signal");
                        break;
                    }
                }
            }
        }

        info!("verification scheduler stopped");
    }
}
