//! Domain types, lifecycle rules and the ports adapters implement.

pub mod group;
pub mod idempotency;
pub mod money;
pub mod payment_method;
pub mod ports;
pub mod taxonomy;
pub mod transaction;
