//! Governance Core
//!
//! Four cooperating services for AI and data platforms:
//! - `policy`: declarative access, usage and compliance policies
//! - `filter`: content rules, PII detection, moderation and redaction
//! - `audit`: buffered, queryable audit trail with anomaly detection
//! - `lineage`: acyclic data lineage graph with impact analysis
//!
//! Persistence goes through the narrow contracts in `storage`; counters and
//! real-time channels go through `cache`.

pub mod audit;
pub mod cache;
pub mod config;
pub mod error;
pub mod filter;
pub mod lineage;
pub mod models;
pub mod policy;
pub mod routes;
pub mod state;
pub mod storage;

pub use error::{GovernanceError, Result};
