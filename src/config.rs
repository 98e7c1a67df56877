use crate::domain::money::Currency;
use crate::domain::taxonomy::{CodeEntry, CodeTable, ReturnCodeTable, ReturnSeverity};
use crate::error::{PaymentError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// What to do when retrying a key whose previous gateway call timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnknownOutcomePolicy {
    /// Re-send the operation; relies on the gateway deduplicating by key.
    BlindRetry,
    /// Ask the gateway for the earlier attempt's outcome before re-sending.
    #[default]
    Reconcile,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub timeout_ms: u64,
    pub unknown_outcome: UnknownOutcomePolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            unknown_outcome: UnknownOutcomePolicy::default(),
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// How long a duplicate waits for an in-flight execution before giving up.
    pub in_progress_wait_ms: u64,
    pub poll_interval_ms: u64,
    /// Age after which an attempt that never recorded an outcome is treated
    /// as abandoned and may be replaced. Must exceed the gateway timeout;
    /// unset means twice the gateway timeout.
    pub abandon_after_ms: Option<u64>,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            in_progress_wait_ms: 2_000,
            poll_interval_ms: 50,
            abandon_after_ms: None,
        }
    }
}

impl IdempotencyConfig {
    pub fn in_progress_wait(&self) -> Duration {
        Duration::from_millis(self.in_progress_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn abandon_after(&self) -> chrono::Duration {
        let ms = self
            .abandon_after_ms
            .unwrap_or(2 * GatewayConfig::default().timeout_ms);
        i64::try_from(ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub grace_period_secs: i64,
    pub minor_return_threshold: u32,
    pub sweep_interval_secs: u64,
}

/// Upper bound on the verification grace period: one leap year.
pub const MAX_GRACE_PERIOD_SECS: i64 = 366 * 24 * 60 * 60;

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 3 * 24 * 60 * 60,
            minor_return_threshold: 2,
            sweep_interval_secs: 60 * 60,
        }
    }
}

impl VerificationConfig {
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_period_secs.clamp(0, MAX_GRACE_PERIOD_SECS))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Service configuration, loaded from JSON. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub supported_currencies: Vec<Currency>,
    pub gateway: GatewayConfig,
    pub idempotency: IdempotencyConfig,
    pub verification: VerificationConfig,
    /// Gateway-specific response codes merged over the built-in table.
    pub response_codes: HashMap<String, CodeEntry>,
    /// Return-code severities merged over the built-in table.
    pub return_codes: HashMap<String, ReturnSeverity>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            supported_currencies: ["USD", "EUR", "GBP", "CAD"]
                .iter()
                .filter_map(|code| code.parse().ok())
                .collect(),
            gateway: GatewayConfig::default(),
            idempotency: IdempotencyConfig::default(),
            verification: VerificationConfig::default(),
            response_codes: HashMap::new(),
            return_codes: HashMap::new(),
        }
    }
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(raw).map_err(|e| PaymentError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.supported_currencies.is_empty() {
            return Err(PaymentError::ConfigError(
                "supported_currencies must not be empty".to_string(),
            ));
        }
        if self.verification.minor_return_threshold == 0 {
            return Err(PaymentError::ConfigError(
                "verification.minor_return_threshold must be at least 1".to_string(),
            ));
        }
        if !(0..=MAX_GRACE_PERIOD_SECS).contains(&self.verification.grace_period_secs) {
            return Err(PaymentError::ConfigError(format!(
                "verification.grace_period_secs must be between 0 and {}",
                MAX_GRACE_PERIOD_SECS
            )));
        }
        if let Some(ms) = self.idempotency.abandon_after_ms
            && ms <= self.gateway.timeout_ms
        {
            return Err(PaymentError::ConfigError(
                "idempotency.abandon_after_ms must exceed gateway.timeout_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Idempotency settings with the abandon threshold resolved against the
    /// gateway timeout.
    pub fn resolved_idempotency(&self) -> IdempotencyConfig {
        IdempotencyConfig {
            abandon_after_ms: Some(
                self.idempotency
                    .abandon_after_ms
                    .unwrap_or(self.gateway.timeout_ms.saturating_mul(2)),
            ),
            ..self.idempotency.clone()
        }
    }

    pub fn supports(&self, currency: &Currency) -> bool {
        self.supported_currencies.contains(currency)
    }

    pub fn code_table(&self) -> CodeTable {
        CodeTable::default().with_overrides(self.response_codes.clone())
    }

    pub fn return_code_table(&self) -> ReturnCodeTable {
        ReturnCodeTable::default().with_overrides(self.return_codes.clone())
    }
}
