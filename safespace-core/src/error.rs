//! Error types for the session and sync layer

use crate::dataset::DatasetKind;
use crate::tenant::TenantId;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a remote data source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Credential rejected by remote")]
    Unauthorized,

    #[error("Remote unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Remote call timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Remote rejected request: {reason}")]
    Rejected { reason: String },

    #[error("Failed to decode remote response: {reason}")]
    Decode { reason: String },

    #[error("Remote returned status {code}: {body}")]
    Status { code: u16, body: String },
}

impl RemoteError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }

    /// Network-level failures where trying again later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable { .. } | Self::Timeout { .. } => true,
            Self::Status { code, .. } => *code >= 500,
            Self::Unauthorized | Self::Rejected { .. } | Self::Decode { .. } => false,
        }
    }
}

/// Failure of `login`. Stored session state is untouched when one is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoginError {
    #[error("Authentication proof was rejected")]
    InvalidProof,

    #[error("Authentication service unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Login failed: {0}")]
    Unknown(String),
}

impl From<RemoteError> for LoginError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unauthorized | RemoteError::Rejected { .. } => Self::InvalidProof,
            RemoteError::Unavailable { reason } => Self::RemoteUnavailable(reason),
            RemoteError::Timeout { after } => {
                Self::RemoteUnavailable(format!("timed out after {:?}", after))
            }
            RemoteError::Status { code, .. } if code >= 500 => {
                Self::RemoteUnavailable(format!("status {}", code))
            }
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Error taxonomy of the sync layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Credential is invalid or expired")]
    AuthInvalid,

    #[error("Authentication service unreachable: {reason}")]
    AuthUnavailable { reason: String },

    #[error("Could not load tenants: {reason}")]
    TenantsUnavailable { reason: String },

    #[error("Tenant not found: {tenant_id}")]
    TenantNotFound { tenant_id: TenantId },

    #[error("Tenant {submitted} is no longer active (active: {active:?})")]
    StaleContext {
        submitted: TenantId,
        active: Option<TenantId>,
    },

    #[error("Fetching {dataset} failed: {reason}")]
    FetchFailed { dataset: DatasetKind, reason: String },

    #[error("Remote rejected feedback: {reason}")]
    RemoteRejected { reason: String },

    /// Feedback never reached a verdict (network failure or timeout).
    #[error("Feedback submission failed: {reason}")]
    SubmitFailed { reason: String },
}

impl SyncError {
    pub fn fetch_failed(dataset: DatasetKind, err: &RemoteError) -> Self {
        Self::FetchFailed {
            dataset,
            reason: err.to_string(),
        }
    }
}

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_error_from_remote() {
        assert_eq!(
            LoginError::from(RemoteError::Unauthorized),
            LoginError::InvalidProof
        );
        assert!(matches!(
            LoginError::from(RemoteError::unavailable("dns")),
            LoginError::RemoteUnavailable(_)
        ));
        assert!(matches!(
            LoginError::from(RemoteError::Timeout {
                after: Duration::from_secs(10)
            }),
            LoginError::RemoteUnavailable(_)
        ));
        assert!(matches!(
            LoginError::from(RemoteError::Decode {
                reason: "eof".to_string()
            }),
            LoginError::Unknown(_)
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::unavailable("x").is_transient());
        assert!(RemoteError::Status {
            code: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!RemoteError::Status {
            code: 404,
            body: String::new()
        }
        .is_transient());
        assert!(!RemoteError::Unauthorized.is_transient());
    }

    #[test]
    fn test_stale_context_display() {
        let err = SyncError::StaleContext {
            submitted: TenantId::from("A"),
            active: Some(TenantId::from("B")),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("A"));
        assert!(msg.contains("no longer active"));
    }
}
