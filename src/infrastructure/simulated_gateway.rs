use crate::domain::ports::{
    GatewayClient, GatewayError, GatewayRequest, GatewayResponse, OperationContext,
};
use crate::domain::taxonomy::{TIMEOUT_CODE, UNAVAILABLE_CODE};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Deterministic gateway used by the batch CLI and in demos.
///
/// The outcome is chosen by the prefix of the account reference:
///
/// | prefix         | outcome                    |
/// |----------------|----------------------------|
/// | `decline`      | `05` do not honor          |
/// | `insufficient` | `51` insufficient funds    |
/// | `fraud`        | `59` suspected fraud       |
/// | `issuer-down`  | `91` issuer unavailable    |
/// | `timeout`      | transport timeout          |
/// | `unavailable`  | transport 5xx              |
/// | anything else  | `00` approved              |
///
/// Responses are remembered per idempotency key so `lookup` can report the
/// outcome of an earlier attempt.
#[derive(Default, Clone)]
pub struct SimulatedGateway {
    outcomes: Arc<Mutex<HashMap<String, GatewayResponse>>>,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn respond(request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let reference = request.account_reference.as_str();
        let code = if reference.starts_with("decline") {
            "05"
        } else if reference.starts_with("insufficient") {
            "51"
        } else if reference.starts_with("fraud") {
            "59"
        } else if reference.starts_with("issuer-down") {
            "91"
        } else if reference.starts_with(TIMEOUT_CODE) {
            return Err(GatewayError::Timeout);
        } else if reference.starts_with(UNAVAILABLE_CODE) {
            return Err(GatewayError::Unavailable("simulated 503".to_string()));
        } else {
            "00"
        };
        Ok(GatewayResponse {
            response_code: code.to_string(),
            reference_token: Some(format!(
                "sim-{}-{}",
                request.kind, request.context.transaction_id
            )),
            message: None,
        })
    }
}

#[async_trait]
impl GatewayClient for SimulatedGateway {
    async fn execute(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let key = request.context.idempotency_key.to_string();
        let mut outcomes = self.outcomes.lock().await;
        if let Some(previous) = outcomes.get(&key) {
            return Ok(previous.clone());
        }
        let response = Self::respond(&request)?;
        outcomes.insert(key, response.clone());
        Ok(response)
    }

    async fn lookup(
        &self,
        context: &OperationContext,
    ) -> Result<Option<GatewayResponse>, GatewayError> {
        let outcomes = self.outcomes.lock().await;
        Ok(outcomes.get(context.idempotency_key.as_str()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::idempotency::IdempotencyKey;
    use crate::domain::transaction::{OperationKind, TransactionId};
    use rust_decimal_macros::dec;

    fn request(key: &str, account: &str) -> GatewayRequest {
        GatewayRequest {
            kind: OperationKind::Authorize,
            amount: dec!(10),
            currency: "USD".parse().unwrap(),
            account_reference: account.to_string(),
            context: OperationContext {
                idempotency_key: IdempotencyKey::new(key).unwrap(),
                transaction_id: TransactionId::new(),
                attempt: 1,
                parent_reference: None,
            },
        }
    }

    #[tokio::test]
    async fn test_prefix_outcomes() {
        let gateway = SimulatedGateway::new();
        let ok = gateway.execute(request("a", "tok_visa")).await.unwrap();
        assert_eq!(ok.response_code, "00");
        assert!(ok.reference_token.is_some());

        let declined = gateway.execute(request("b", "decline-1")).await.unwrap();
        assert_eq!(declined.response_code, "05");

        assert_eq!(
            gateway.execute(request("c", "timeout-1")).await,
            Err(GatewayError::Timeout)
        );
    }

    #[tokio::test]
    async fn test_native_idempotency_and_lookup() {
        let gateway = SimulatedGateway::new();
        let first = gateway.execute(request("k", "tok_visa")).await.unwrap();
        let again = gateway.execute(request("k", "tok_visa")).await.unwrap();
        assert_eq!(first, again);

        let found = gateway.lookup(&request("k", "tok_visa").context).await.unwrap();
        assert_eq!(found, Some(first));
        let missing = gateway.lookup(&request("other", "tok_visa").context).await.unwrap();
        assert_eq!(missing, None);
    }
}
