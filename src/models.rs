//! Shared vocabulary and DTOs
//!
//! Actor and resource identifiers are shared by all four components and
//! are what audit queries correlate on.

use crate::error::{validation_error, Result};
use serde::{Deserialize, Serialize};

/// Who performed an action. Identity is resolved before reaching the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    #[serde(rename = "type", default = "default_actor_type")]
    pub actor_type: String,
}

fn default_actor_type() -> String {
    "user".to_string()
}

impl Actor {
    pub fn new(id: impl Into<String>, actor_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            actor_type: actor_type.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(id, "user")
    }

    pub fn system() -> Self {
        Self::new("governance-core", "system")
    }
}

/// What an action targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub id: Option<String>,
}

impl ResourceRef {
    pub fn new(resource_type: impl Into<String>, id: Option<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id,
        }
    }
}

/// Offset pagination request
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// Largest page any list operation returns
pub const MAX_PAGE_SIZE: usize = 500;

impl Pagination {
    /// Reject a limit outside `1..=MAX_PAGE_SIZE` or an offset that does not
    /// fit a signed 64-bit SQL parameter
    pub fn checked(self) -> Result<Self> {
        if self.limit == 0 || self.limit > MAX_PAGE_SIZE {
            return Err(validation_error(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        if i64::try_from(self.offset).is_err() {
            return Err(validation_error("offset is out of range"));
        }
        Ok(self)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: default_limit(),
        }
    }
}

/// A page of results; `has_more` is computed by fetching one extra row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
}

impl<T> Page<T> {
    /// Build a page from `limit + 1` fetched rows
    pub fn from_overfetch(mut rows: Vec<T>, pagination: Pagination) -> Self {
        let has_more = rows.len() > pagination.limit;
        rows.truncate(pagination.limit);
        Self {
            items: rows,
            offset: pagination.offset,
            limit: pagination.limit,
            has_more,
        }
    }
}

/// Generic success response
#[derive(Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn with_data(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Message-only response (no data)
#[derive(Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}
