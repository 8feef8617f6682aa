//! Operator feedback on flagged violations

use crate::tenant::TenantId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend violation row id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViolationId(i64);

impl ViolationId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ViolationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operator correction for one violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackLabel {
    /// The flag was wrong; the message did not breach policy.
    FalsePositive,
    /// The flag was right.
    Confirmed,
}

impl FeedbackLabel {
    pub fn is_false_positive(&self) -> bool {
        matches!(self, Self::FalsePositive)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FalsePositive => "false_positive",
            Self::Confirmed => "confirmed",
        }
    }
}

impl fmt::Display for FeedbackLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One submit-then-invalidate transaction. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackRecord {
    pub tenant_id: TenantId,
    pub violation_id: ViolationId,
    pub label: FeedbackLabel,
}

/// Backend verdict on a feedback submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackOutcome {
    pub accepted: bool,
    #[serde(default, alias = "detail", alias = "message")]
    pub reason: Option<String>,
}

impl FeedbackOutcome {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}
