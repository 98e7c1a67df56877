//! Response-code and return-code classification.
//!
//! The core owns these categories; a gateway plugs in by supplying a code table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseCategory {
    Approved,
    PermanentDecline,
    RetryableError,
    FraudHold,
}

impl ResponseCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseCategory::Approved => "approved",
            ResponseCategory::PermanentDecline => "permanent_decline",
            ResponseCategory::RetryableError => "retryable_error",
            ResponseCategory::FraudHold => "fraud_hold",
        }
    }
}

impl fmt::Display for ResponseCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeEntry {
    pub category: ResponseCategory,
    pub reason: String,
}

/// Gateway response code to category mapping.
///
/// Codes missing from the table classify as `RetryableError`: the outcome of
/// the money movement is not known, so the key must stay open for a retry.
#[derive(Debug, Clone)]
pub struct CodeTable {
    entries: HashMap<String, CodeEntry>,
}

/// Reserved code recorded when the gateway call exceeds its timeout.
pub const TIMEOUT_CODE: &str = "timeout";
/// Reserved code recorded when the gateway is unreachable or answers 5xx.
pub const UNAVAILABLE_CODE: &str = "unavailable";

const DEFAULT_RESPONSE_CODES: &[(&str, ResponseCategory, &str)] = &[
    ("00", ResponseCategory::Approved, "approved"),
    ("10", ResponseCategory::Approved, "partial approval"),
    ("85", ResponseCategory::Approved, "no reason to decline"),
    ("01", ResponseCategory::PermanentDecline, "refer to card issuer"),
    ("05", ResponseCategory::PermanentDecline, "do not honor"),
    ("12", ResponseCategory::PermanentDecline, "invalid transaction"),
    ("13", ResponseCategory::PermanentDecline, "invalid amount"),
    ("14", ResponseCategory::PermanentDecline, "invalid account number"),
    ("51", ResponseCategory::PermanentDecline, "insufficient funds"),
    ("54", ResponseCategory::PermanentDecline, "expired card"),
    ("57", ResponseCategory::PermanentDecline, "transaction not permitted"),
    ("04", ResponseCategory::FraudHold, "pick up card"),
    ("41", ResponseCategory::FraudHold, "lost card"),
    ("43", ResponseCategory::FraudHold, "stolen card"),
    ("59", ResponseCategory::FraudHold, "suspected fraud"),
    ("19", ResponseCategory::RetryableError, "re-enter transaction"),
    ("91", ResponseCategory::RetryableError, "issuer unavailable"),
    ("96", ResponseCategory::RetryableError, "system malfunction"),
    (TIMEOUT_CODE, ResponseCategory::RetryableError, "gateway timeout"),
    (UNAVAILABLE_CODE, ResponseCategory::RetryableError, "gateway unavailable"),
];

impl CodeTable {
    pub fn new(entries: HashMap<String, CodeEntry>) -> Self {
        Self { entries }
    }

    /// Merges `overrides` on top of the current entries.
    pub fn with_overrides(mut self, overrides: HashMap<String, CodeEntry>) -> Self {
        self.entries.extend(overrides);
        self
    }

    pub fn classify(&self, code: &str) -> ResponseCategory {
        self.entries
            .get(code)
            .map(|entry| entry.category)
            .unwrap_or(ResponseCategory::RetryableError)
    }

    pub fn reason(&self, code: &str) -> String {
        self.entries
            .get(code)
            .map(|entry| entry.reason.clone())
            .unwrap_or_else(|| format!("unrecognized response code {}", code))
    }
}

impl Default for CodeTable {
    fn default() -> Self {
        let entries = DEFAULT_RESPONSE_CODES
            .iter()
            .map(|(code, category, reason)| {
                (
                    code.to_string(),
                    CodeEntry {
                        category: *category,
                        reason: reason.to_string(),
                    },
                )
            })
            .collect();
        Self { entries }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnSeverity {
    /// Deactivates the payment method on first occurrence.
    Severe,
    /// Counts toward the configured threshold.
    Minor,
}

/// Bank return-code severity table (ACH R-codes by default).
#[derive(Debug, Clone)]
pub struct ReturnCodeTable {
    entries: HashMap<String, (ReturnSeverity, String)>,
}

const DEFAULT_RETURN_CODES: &[(&str, ReturnSeverity, &str)] = &[
    ("R01", ReturnSeverity::Minor, "insufficient funds"),
    ("R09", ReturnSeverity::Minor, "uncollected funds"),
    ("R06", ReturnSeverity::Minor, "returned per ODFI request"),
    ("R02", ReturnSeverity::Severe, "account closed"),
    ("R03", ReturnSeverity::Severe, "no account or unable to locate account"),
    ("R04", ReturnSeverity::Severe, "invalid account number"),
    ("R05", ReturnSeverity::Severe, "unauthorized debit to consumer account"),
    ("R07", ReturnSeverity::Severe, "authorization revoked by customer"),
    ("R08", ReturnSeverity::Severe, "payment stopped"),
    ("R10", ReturnSeverity::Severe, "customer advises not authorized"),
    ("R16", ReturnSeverity::Severe, "account frozen"),
    ("R20", ReturnSeverity::Severe, "non-transaction account"),
    ("R29", ReturnSeverity::Severe, "corporate customer advises not authorized"),
];

impl ReturnCodeTable {
    pub fn with_overrides(mut self, overrides: HashMap<String, ReturnSeverity>) -> Self {
        for (code, severity) in overrides {
            let reason = self
                .entries
                .get(&code)
                .map(|(_, reason)| reason.clone())
                .unwrap_or_else(|| format!("return code {}", code));
            self.entries.insert(code, (severity, reason));
        }
        self
    }

    /// Unlisted codes count as minor.
    pub fn classify(&self, code: &str) -> ReturnSeverity {
        self.entries
            .get(&normalize(code))
            .map(|(severity, _)| *severity)
            .unwrap_or(ReturnSeverity::Minor)
    }

    pub fn reason(&self, code: &str) -> String {
        let code = normalize(code);
        match self.entries.get(&code) {
            Some((_, reason)) => format!("{}: {}", code, reason),
            None => format!("{}: unclassified return", code),
        }
    }
}

fn normalize(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

impl Default for ReturnCodeTable {
    fn default() -> Self {
        let entries = DEFAULT_RETURN_CODES
            .iter()
            .map(|(code, severity, reason)| (code.to_string(), (*severity, reason.to_string())))
            .collect();
        Self { entries }
    }
}
