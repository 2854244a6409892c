//! IO modules - external system interfaces
//!
//! - `mqtt` - Access-control protocol client (motion, access, status, frames)
//! - `audit` - Access decision log (JSONL)
//! - `roster` - Identity roster loading and refresh
//! - `hardware` - Lock servo, buzzer and PIR drivers
//! - `prometheus` - Metrics and control HTTP endpoint

pub mod audit;
pub mod hardware;
pub mod mqtt;
pub mod prometheus;
pub mod roster;

// Re-export commonly used types
pub use audit::{create_audit_log, AuditSink, AuditWriter, JsonlAuditLog};
pub use mqtt::{AccessClient, AccessClientBuilder, ConnectionState, PublishError};
