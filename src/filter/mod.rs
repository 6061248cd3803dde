//! Content Filter Module
//!
//! - `models`: rules, actions and the severity order, results
//! - `detectors`: built-in PII detectors
//! - `moderation`: external moderation API client
//! - `redaction`: span replacement
//! - `engine`: rule management and `filter_content`

pub mod detectors;
pub mod engine;
pub mod models;
pub mod moderation;
pub mod redaction;

pub use engine::ContentFilter;
pub use models::{FilterAction, FilterRequest, FilterResult};
pub use moderation::{HttpModerationClient, ModerationClient};
