//! Policy Engine Module
//!
//! Versioned organizational policies evaluated against proposed actions:
//! - `models`: policies, rules, exceptions, violations, decisions
//! - `condition`: the typed rule-condition language
//! - `engine`: lifecycle operations and evaluation

pub mod condition;
pub mod engine;
pub mod models;

pub use engine::PolicyEngine;
pub use models::{EvaluationRequest, Policy, PolicyDecision, PolicyStatus, PolicyViolation};
