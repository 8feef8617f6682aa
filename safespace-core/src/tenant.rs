//! Tenant (Discord server) types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable server identifier (a Discord snowflake, kept as text).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// What the identity may do on a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionTier {
    Owner,
    #[default]
    Admin,
    Member,
}

impl PermissionTier {
    /// Owners and admins may submit feedback and change settings.
    pub fn can_moderate(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

/// One server the identity can manage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    #[serde(default, alias = "permission_tier")]
    pub permission: PermissionTier,
    /// Denormalized health score (0-1 fraction) captured when the list was loaded.
    #[serde(default, alias = "health_score")]
    pub health_snapshot: Option<f64>,
}

impl Tenant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: TenantId::new(id),
            name: name.into(),
            permission: PermissionTier::default(),
            health_snapshot: None,
        }
    }

    pub fn with_permission(mut self, permission: PermissionTier) -> Self {
        self.permission = permission;
        self
    }

    pub fn with_health(mut self, health: f64) -> Self {
        self.health_snapshot = Some(health.clamp(0.0, 1.0));
        self
    }
}
