//! Audit Trail Module
//!
//! Immutable event log:
//! - `models`: event types, filters, statistics
//! - `buffer`: write-behind batching to durable storage
//! - `anomaly`: fixed-threshold detectors
//! - `trail`: the public component

pub mod anomaly;
pub mod buffer;
pub mod models;
pub mod trail;

pub use models::{
    AuditEvent, AuditEventType, AuditFilter, AuditOutcome, AuditSeverity, EventDetails,
    EventMetadata, RecordEventInput,
};
pub use trail::AuditTrail;
