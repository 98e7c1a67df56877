use super::taxonomy::ReturnSeverity;
use super::transaction::TransactionId;
use crate::error::PaymentError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentMethodId(pub Uuid);

impl PaymentMethodId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PaymentMethodId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PaymentMethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PaymentMethodId {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| PaymentError::ValidationError(format!("bad payment method id: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    BankAccount,
    Card,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationStatus {
    UnverifiedPending,
    Verified,
    Failed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::UnverifiedPending => "unverified-pending",
            VerificationStatus::Verified => "verified",
            VerificationStatus::Failed => "failed",
        }
    }

    /// Verification only moves forward out of the pending state.
    pub fn can_transition_to(&self, next: &VerificationStatus) -> bool {
        matches!(
            (self, next),
            (VerificationStatus::UnverifiedPending, VerificationStatus::Verified)
                | (VerificationStatus::UnverifiedPending, VerificationStatus::Failed)
        )
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of applying one return signal to a payment method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnOutcome {
    /// The method was deactivated by this signal.
    Deactivated,
    /// A minor return was counted; the method stays usable.
    Counted(u32),
    /// The method was already deactivated; nothing changed.
    AlreadyDeactivated,
}

/// A stored, reusable account reference owned by a customer.
///
/// Never deleted. Deactivation is permanent; re-enrollment creates a new method.
/// `revision` increments on every mutation and backs the stores' conditional updates.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct PaymentMethod {
    pub id: PaymentMethodId,
    pub owner: String,
    pub kind: MethodKind,
    pub account_reference: String,
    pub status: VerificationStatus,
    pub created_at: DateTime<Utc>,
    pub grace_deadline: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verification_transaction_id: TransactionId,
    pub return_count: u32,
    pub last_return_code: Option<String>,
    pub deactivation_reason: Option<String>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub revision: u64,
}

impl PaymentMethod {
    /// Builds the method created by an approved verification.
    ///
    /// Cards are verified by the approval itself; bank accounts enter the grace window.
    pub fn linked(
        owner: String,
        kind: MethodKind,
        account_reference: String,
        verification_transaction_id: TransactionId,
        grace_period: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let (status, verified_at) = match kind {
            MethodKind::Card => (VerificationStatus::Verified, Some(now)),
            MethodKind::BankAccount => (VerificationStatus::UnverifiedPending, None),
        };
        Self {
            id: PaymentMethodId::new(),
            owner,
            kind,
            account_reference,
            status,
            created_at: now,
            grace_deadline: now + grace_period,
            verified_at,
            verification_transaction_id,
            return_count: 0,
            last_return_code: None,
            deactivation_reason: None,
            deactivated_at: None,
            revision: 0,
        }
    }

    pub fn is_deactivated(&self) -> bool {
        self.deactivated_at.is_some()
    }

    /// Rejects debits against failed or deactivated methods.
    pub fn ensure_usable(&self) -> Result<(), PaymentError> {
        if let Some(reason) = &self.deactivation_reason {
            return Err(PaymentError::PaymentMethodUnusable {
                id: self.id.to_string(),
                reason: format!("deactivated ({})", reason),
            });
        }
        if self.status == VerificationStatus::Failed {
            return Err(PaymentError::PaymentMethodUnusable {
                id: self.id.to_string(),
                reason: "verification failed".to_string(),
            });
        }
        Ok(())
    }

    /// Pending, past its grace deadline, active, and without any adverse return.
    pub fn is_due_for_promotion(&self, now: DateTime<Utc>) -> bool {
        self.status == VerificationStatus::UnverifiedPending
            && !self.is_deactivated()
            && self.return_count == 0
            && self.grace_deadline <= now
    }

    pub fn promote(&mut self, now: DateTime<Utc>) -> Result<(), PaymentError> {
        self.set_status(VerificationStatus::Verified)?;
        self.verified_at = Some(now);
        self.revision += 1;
        Ok(())
    }

    /// Deactivates the method, failing it if verification was still pending.
    ///
    /// Returns `false` when the method was already deactivated.
    pub fn deactivate(&mut self, reason: String, now: DateTime<Utc>) -> bool {
        if self.is_deactivated() {
            return false;
        }
        if self.status == VerificationStatus::UnverifiedPending {
            self.status = VerificationStatus::Failed;
        }
        self.deactivation_reason = Some(reason);
        self.deactivated_at = Some(now);
        self.revision += 1;
        true
    }

    /// Applies one classified return signal.
    pub fn apply_return(
        &mut self,
        code: &str,
        severity: ReturnSeverity,
        reason: String,
        minor_threshold: u32,
        now: DateTime<Utc>,
    ) -> ReturnOutcome {
        if self.is_deactivated() {
            return ReturnOutcome::AlreadyDeactivated;
        }
        self.last_return_code = Some(code.to_string());
        self.return_count += 1;
        match severity {
            ReturnSeverity::Severe => {
                self.deactivate(reason, now);
                ReturnOutcome::Deactivated
            }
            ReturnSeverity::Minor if self.return_count >= minor_threshold => {
                let reason = format!("{} (return threshold {} reached)", reason, minor_threshold);
                self.deactivate(reason, now);
                ReturnOutcome::Deactivated
            }
            ReturnSeverity::Minor => {
                self.revision += 1;
                ReturnOutcome::Counted(self.return_count)
            }
        }
    }

    fn set_status(&mut self, next: VerificationStatus) -> Result<(), PaymentError> {
        if !self.status.can_transition_to(&next) {
            return Err(PaymentError::IllegalTransition(format!(
                "payment method {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank_account(now: DateTime<Utc>) -> PaymentMethod {
        PaymentMethod::linked(
            "cust-1".to_string(),
            MethodKind::BankAccount,
            "021000021:123456789".to_string(),
            TransactionId::new(),
            Duration::days(3),
            now,
        )
    }

    #[test]
    fn test_card_is_verified_on_link() {
        let now = Utc::now();
        let card = PaymentMethod::linked(
            "cust-1".to_string(),
            MethodKind::Card,
            "tok_visa".to_string(),
            TransactionId::new(),
            Duration::days(3),
            now,
        );
        assert_eq!(card.status, VerificationStatus::Verified);
        assert_eq!(card.verified_at, Some(now));
    }

    #[test]
    fn test_promotion_respects_deadline() {
        let now = Utc::now();
        let mut method = bank_account(now);
        assert!(!method.is_due_for_promotion(now + Duration::days(3) - Duration::seconds(1)));
        assert!(method.is_due_for_promotion(now + Duration::days(3)));

        method.promote(now + Duration::days(3)).unwrap();
        assert_eq!(method.status, VerificationStatus::Verified);
        assert_eq!(method.revision, 1);
        // Forward-only.
        assert!(method.promote(now + Duration::days(4)).is_err());
    }

    #[test]
    fn test_severe_return_fails_pending_method() {
        let now = Utc::now();
        let mut method = bank_account(now);
        let outcome = method.apply_return(
            "R02",
            ReturnSeverity::Severe,
            "R02: account closed".to_string(),
            2,
            now,
        );
        assert_eq!(outcome, ReturnOutcome::Deactivated);
        assert_eq!(method.status, VerificationStatus::Failed);
        assert!(method.ensure_usable().is_err());
        assert_eq!(
            method.apply_return("R02", ReturnSeverity::Severe, "again".to_string(), 2, now),
            ReturnOutcome::AlreadyDeactivated
        );
    }

    #[test]
    fn test_severe_return_keeps_verified_status_but_deactivates() {
        let now = Utc::now();
        let mut method = bank_account(now);
        method.promote(now).unwrap();
        method.apply_return("R10", ReturnSeverity::Severe, "R10".to_string(), 2, now);
        assert_eq!(method.status, VerificationStatus::Verified);
        assert!(method.is_deactivated());
        assert!(matches!(
            method.ensure_usable(),
            Err(PaymentError::PaymentMethodUnusable { .. })
        ));
    }

    #[test]
    fn test_minor_returns_deactivate_at_threshold() {
        let now = Utc::now();
        let mut method = bank_account(now);
        assert_eq!(
            method.apply_return("R01", ReturnSeverity::Minor, "R01".to_string(), 2, now),
            ReturnOutcome::Counted(1)
        );
        assert!(method.ensure_usable().is_ok());
        assert!(!method.is_due_for_promotion(now + Duration::days(10)));
        assert_eq!(
            method.apply_return("R09", ReturnSeverity::Minor, "R09".to_string(), 2, now),
            ReturnOutcome::Deactivated
        );
        assert_eq!(method.return_count, 2);
        assert!(
            method
                .deactivation_reason
                .as_deref()
                .unwrap()
                .contains("threshold")
        );
    }
}
