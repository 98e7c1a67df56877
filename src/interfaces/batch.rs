//! Executes CSV batch commands against a `PaymentEngine`.
//!
//! Rows refer to earlier transactions and payment methods by the idempotency
//! key that created them, so a batch can continue work started by an earlier
//! run against the same database.

use super::csv::command_reader::{Command, CommandKind};
use super::csv::outcome_writer::Outcome;
use crate::application::engine::{
    CaptureRequest, DebitRequest, LinkAccountRequest, PaymentEngine, PaymentSource, RefundRequest,
    VoidRequest,
};
use crate::domain::idempotency::IdempotencyKey;
use crate::domain::payment_method::{MethodKind, PaymentMethod};
use crate::domain::transaction::{Transaction, TransactionId};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};

const METHOD_PREFIX: &str = "method:";

pub struct BatchRunner<'a> {
    engine: &'a PaymentEngine,
}

impl<'a> BatchRunner<'a> {
    pub fn new(engine: &'a PaymentEngine) -> Self {
        Self { engine }
    }

    /// Runs one command. Failures are reported in the outcome's `error` column.
    pub async fn run(&self, command: Command) -> Outcome {
        let mut outcome = Outcome {
            op: command.op.as_str().to_string(),
            key: command.key.clone().unwrap_or_default(),
            ..Outcome::default()
        };
        if let Err(e) = self.dispatch(command, &mut outcome).await {
            if let PaymentError::GatewayRetryable {
                transaction_id,
                status,
                response_code,
            } = &e
            {
                outcome.transaction = transaction_id.to_string();
                outcome.status = status.to_string();
                outcome.response_code = response_code.clone();
            }
            outcome.error = e.to_string();
        }
        outcome
    }

    async fn dispatch(&self, command: Command, outcome: &mut Outcome) -> Result<()> {
        match command.op {
            CommandKind::Authorize | CommandKind::Sale => {
                let request = DebitRequest {
                    idempotency_key: required_key(&command)?,
                    amount: required(command.amount, "amount")?,
                    currency: required(command.currency, "currency")?.parse()?,
                    source: self.source(required(command.target, "target")?).await?,
                };
                let tx = if command.op == CommandKind::Authorize {
                    self.engine.authorize(request).await?
                } else {
                    self.engine.sale(request).await?
                };
                record_transaction(&tx, outcome);
            }
            CommandKind::Capture => {
                let request = CaptureRequest {
                    idempotency_key: required_key(&command)?,
                    parent: self.transaction(command.target).await?,
                    amount: required(command.amount, "amount")?,
                };
                let tx = self.engine.capture(request).await?;
                record_transaction(&tx, outcome);
            }
            CommandKind::Void => {
                let request = VoidRequest {
                    idempotency_key: required_key(&command)?,
                    parent: self.transaction(command.target).await?,
                };
                let tx = self.engine.void(request).await?;
                record_transaction(&tx, outcome);
            }
            CommandKind::Refund => {
                let request = RefundRequest {
                    idempotency_key: required_key(&command)?,
                    parent: self.transaction(command.target).await?,
                    amount: required(command.amount, "amount")?,
                };
                let tx = self.engine.refund(request).await?;
                record_transaction(&tx, outcome);
            }
            CommandKind::Link => {
                let request = LinkAccountRequest {
                    idempotency_key: required_key(&command)?,
                    owner: required(command.owner, "owner")?,
                    kind: method_kind(&required(command.detail, "detail")?)?,
                    account_reference: required(command.target, "target")?,
                    currency: required(command.currency, "currency")?.parse()?,
                };
                let linked = self.engine.link_and_verify_account(request).await?;
                if let Some(method) = &linked.payment_method {
                    describe_method(method, outcome);
                }
                record_transaction(&linked.transaction, outcome);
            }
            CommandKind::Return => {
                let target = required(command.target, "target")?;
                let method = self.method(&target).await?;
                let code = required(command.detail, "detail")?;
                let report = self.engine.report_return_signal(method.id, &code).await?;
                outcome.key = target;
                outcome.response_code = code;
                describe_method(&report.payment_method, outcome);
            }
            CommandKind::Sweep => {
                let scheduler = self.engine.verification();
                let report = match command.detail {
                    Some(at) => scheduler.sweep_at(parse_time(&at)?).await?,
                    None => scheduler.sweep().await?,
                };
                outcome.status = format!("promoted={}", report.promoted);
            }
        }
        Ok(())
    }

    async fn source(&self, target: String) -> Result<PaymentSource> {
        match target.strip_prefix(METHOD_PREFIX) {
            Some(link_key) => Ok(PaymentSource::Method(self.method(link_key).await?.id)),
            None => Ok(PaymentSource::Token(target)),
        }
    }

    async fn transaction(&self, target: Option<String>) -> Result<TransactionId> {
        let key = IdempotencyKey::new(required(target, "target")?)?;
        Ok(self.engine.transaction_by_key(&key).await?.id)
    }

    async fn method(&self, link_key: &str) -> Result<PaymentMethod> {
        let key = IdempotencyKey::new(link_key)?;
        self.engine.payment_method_by_link_key(&key).await
    }
}

fn record_transaction(tx: &Transaction, outcome: &mut Outcome) {
    outcome.transaction = tx.id.to_string();
    outcome.group = tx.group_id.to_string();
    outcome.status = tx.status.to_string();
    outcome.amount = tx.amount.to_string();
    outcome.response_code = tx.response_code.clone().unwrap_or_default();
}

fn describe_method(method: &PaymentMethod, outcome: &mut Outcome) {
    outcome.payment_method = method.id.to_string();
    outcome.method_status = if method.is_deactivated() {
        format!("{} (deactivated)", method.status)
    } else {
        method.status.to_string()
    };
}

fn required<T>(value: Option<T>, column: &str) -> Result<T> {
    value.ok_or_else(|| PaymentError::ValidationError(format!("missing '{}' column", column)))
}

fn required_key(command: &Command) -> Result<IdempotencyKey> {
    IdempotencyKey::new(required(command.key.clone(), "key")?)
}

fn method_kind(value: &str) -> Result<MethodKind> {
    match value {
        "bank_account" | "bank" => Ok(MethodKind::BankAccount),
        "card" => Ok(MethodKind::Card),
        other => Err(PaymentError::ValidationError(format!(
            "unknown payment method kind '{}'",
            other
        ))),
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PaymentError::ValidationError(format!("bad timestamp '{}': {}", value, e)))
}
