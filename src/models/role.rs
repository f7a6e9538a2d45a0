//! Typed role references and role membership.
//!
//! Upstream systems historically tagged roles as a colon-joined
//! `"system:role"` string parsed ad hoc at every call site. Here the pair is
//! parsed and validated exactly once at the boundary; everything downstream
//! works with the typed [`RoleRef`].

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A validated (system, role) pair identifying one role in one system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleRef {
    pub system: String,
    pub role: String,
}

impl RoleRef {
    pub fn new(system: impl Into<String>, role: impl Into<String>) -> Result<Self> {
        let system = system.into();
        let role = role.into();
        if system.trim().is_empty() || role.trim().is_empty() {
            return Err(EngineError::InvalidRole {
                tag: format!("{system}:{role}"),
                reason: "system and role must both be non-empty".to_string(),
            });
        }
        Ok(Self { system, role })
    }

    /// Parse the legacy `"system:role"` tag form. This is the only place the
    /// colon convention is interpreted.
    pub fn parse(tag: &str) -> Result<Self> {
        match tag.split_once(':') {
            Some((system, role)) => Self::new(system, role),
            None => Err(EngineError::InvalidRole {
                tag: tag.to_string(),
                reason: "expected 'system:role'".to_string(),
            }),
        }
    }

    /// The qualified tag form, used as a stable key for pointers and maps.
    pub fn qualified(&self) -> String {
        format!("{}:{}", self.system, self.role)
    }
}

impl fmt::Display for RoleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.system, self.role)
    }
}

/// One human member of a role. Ordering for round-robin selection is by
/// member id, so directory listings must be deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleMember {
    pub id: Uuid,
    pub username: String,
    pub role: RoleRef,
    pub active: bool,
}
