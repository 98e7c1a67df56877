//! Application layer containing the core business logic orchestration.
//!
//! `PaymentEngine` is the entry point for caller-facing operations. It admits
//! requests through the `IdempotencyEngine`, validates lifecycle transitions
//! against persisted group state, and runs gateway calls on detached tasks.
//! `VerificationScheduler` runs independently of request flow.

pub mod engine;
pub mod idempotency;
pub mod scheduler;
