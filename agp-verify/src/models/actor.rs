//! Acting user threaded through every mutating call
//!
//! Authentication happens upstream; this service only receives who is acting
//! and in which role.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::WorkflowError;

/// Reserved verifier id written by automatic triage decisions
pub const SYSTEM_VERIFIER_ID: &str = "system";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", content = "id", rename_all = "lowercase")]
pub enum Actor {
    Farmer(String),
    Admin(String),
}

impl Actor {
    pub fn farmer(id: impl Into<String>) -> Result<Self, WorkflowError> {
        Ok(Actor::Farmer(validate_id(id.into())?))
    }

    pub fn admin(id: impl Into<String>) -> Result<Self, WorkflowError> {
        Ok(Actor::Admin(validate_id(id.into())?))
    }

    /// Parse from a role name (`farmer` / `admin`) and an id
    pub fn from_role(role: &str, id: impl Into<String>) -> Result<Self, WorkflowError> {
        match role.trim().to_ascii_lowercase().as_str() {
            "farmer" => Actor::farmer(id),
            "admin" => Actor::admin(id),
            other => Err(WorkflowError::Validation(format!("Unknown actor role: {}", other))),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Actor::Farmer(id) | Actor::Admin(id) => id,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Actor::Farmer(_) => "farmer",
            Actor::Admin(_) => "admin",
        }
    }

    /// Admin id, or `Forbidden` for farmers
    pub fn require_admin(&self) -> Result<&str, WorkflowError> {
        match self {
            Actor::Admin(id) => Ok(id),
            Actor::Farmer(id) => Err(WorkflowError::Forbidden(format!(
                "Farmer {} cannot perform an admin action",
                id
            ))),
        }
    }

    /// Farmer id, or `Forbidden` for admins
    pub fn require_farmer(&self) -> Result<&str, WorkflowError> {
        match self {
            Actor::Farmer(id) => Ok(id),
            Actor::Admin(id) => Err(WorkflowError::Forbidden(format!(
                "Admin {} cannot act on behalf of a farmer",
                id
            ))),
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role(), self.id())
    }
}

fn validate_id(id: String) -> Result<String, WorkflowError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(WorkflowError::Validation("Actor id must not be empty".to_string()));
    }
    if trimmed == SYSTEM_VERIFIER_ID {
        return Err(WorkflowError::Validation(format!(
            "Actor id '{}' is reserved",
            SYSTEM_VERIFIER_ID
        )));
    }
    Ok(trimmed.to_string())
}
