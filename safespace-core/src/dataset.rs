//! Per-tenant dataset kinds, query parameters and payloads.
//!
//! All percentage-like fields are 0-1 fractions. Turning them into
//! percentage strings is left to whatever renders them.

use crate::feedback::ViolationId;
use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Default analytics window in days.
pub const DEFAULT_ANALYTICS_DAYS: u32 = 7;

/// Default number of violations fetched per page.
pub const DEFAULT_VIOLATION_LIMIT: u32 = 50;

/// Every dataset the dashboard caches per tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Dashboard,
    Stats,
    Analytics,
    Violations,
    LearningInsights,
    HealthScore,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 6] = [
        DatasetKind::Dashboard,
        DatasetKind::Stats,
        DatasetKind::Analytics,
        DatasetKind::Violations,
        DatasetKind::LearningInsights,
        DatasetKind::HealthScore,
    ];

    /// Datasets whose server-side aggregates are a function of feedback history.
    pub const FEEDBACK_DEPENDENT: [DatasetKind; 3] = [
        DatasetKind::Violations,
        DatasetKind::LearningInsights,
        DatasetKind::HealthScore,
    ];

    /// Summary payloads that embed feedback-dependent aggregates (the
    /// dashboard carries a health score and recent violations).
    pub const FEEDBACK_SUMMARIES: [DatasetKind; 1] = [DatasetKind::Dashboard];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dashboard => "dashboard",
            Self::Stats => "stats",
            Self::Analytics => "analytics",
            Self::Violations => "violations",
            Self::LearningInsights => "learning_insights",
            Self::HealthScore => "health_score",
        }
    }

    /// Path segment under `/servers/{id}/` on the backend.
    pub fn path_segment(&self) -> &'static str {
        match self {
            Self::Dashboard => "dashboard",
            Self::Stats => "stats",
            Self::Analytics => "analytics",
            Self::Violations => "violations",
            Self::LearningInsights => "insights",
            Self::HealthScore => "health",
        }
    }

    pub fn is_feedback_dependent(&self) -> bool {
        Self::FEEDBACK_DEPENDENT.contains(self)
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dashboard" => Ok(Self::Dashboard),
            "stats" => Ok(Self::Stats),
            "analytics" => Ok(Self::Analytics),
            "violations" => Ok(Self::Violations),
            "learning_insights" | "insights" => Ok(Self::LearningInsights),
            "health_score" | "health" => Ok(Self::HealthScore),
            other => Err(format!("unknown dataset kind: {}", other)),
        }
    }
}

/// Query parameters that are part of a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct QueryParams {
    /// Analytics window in days.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days: Option<u32>,
    /// Violation page size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl QueryParams {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn days(days: u32) -> Self {
        Self {
            days: Some(days),
            limit: None,
        }
    }

    pub fn limit(limit: u32) -> Self {
        Self {
            days: None,
            limit: Some(limit),
        }
    }

    /// Drop parameters the dataset ignores and fill in backend defaults,
    /// so equivalent requests share one cache entry.
    pub fn normalized_for(self, kind: DatasetKind) -> Self {
        match kind {
            DatasetKind::Analytics => Self {
                days: Some(self.days.unwrap_or(DEFAULT_ANALYTICS_DAYS)),
                limit: None,
            },
            DatasetKind::Violations => Self {
                days: None,
                limit: Some(self.limit.unwrap_or(DEFAULT_VIOLATION_LIMIT)),
            },
            _ => Self::none(),
        }
    }
}

/// Server-wide moderation counters (`/stats`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServerStats {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub total_messages: u64,
    #[serde(default)]
    pub total_violations: u64,
    #[serde(default)]
    pub false_positives: u64,
    #[serde(default)]
    pub health_score: f64,
    #[serde(default)]
    pub toxicity_threshold: f64,
    #[serde(default)]
    pub nsfw_threshold: f64,
    #[serde(default)]
    pub spam_threshold: f64,
    #[serde(default)]
    pub harassment_threshold: f64,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub auto_timeout: bool,
}

impl ServerStats {
    /// Violations per processed message; zero when nothing was processed.
    pub fn violation_rate(&self) -> f64 {
        if self.total_messages == 0 {
            return 0.0;
        }
        self.total_violations as f64 / self.total_messages as f64
    }

    /// Share of flagged violations that were not reported as false positives.
    pub fn accuracy(&self) -> f64 {
        if self.false_positives == 0 || self.total_violations == 0 {
            return 1.0;
        }
        (1.0 - self.false_positives as f64 / self.total_violations as f64).max(0.0)
    }

    pub fn is_healthy(&self) -> bool {
        self.health_score > 0.7
    }
}

/// One day of analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AnalyticsPoint {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub messages_processed: u64,
    #[serde(default)]
    pub violations_detected: u64,
    #[serde(default)]
    pub false_positives: u64,
    #[serde(default)]
    pub community_health_score: f64,
    #[serde(default)]
    pub toxicity_trend: f64,
    #[serde(default)]
    pub engagement_score: f64,
}

/// Analytics time series (`/analytics?days=`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AnalyticsSeries {
    #[serde(default)]
    pub days: u32,
    #[serde(default, alias = "analytics")]
    pub points: Vec<AnalyticsPoint>,
}

/// A message the moderation model flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub id: ViolationId,
    pub violation_type: String,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub action_taken: String,
    /// `None` until an operator has reviewed the violation.
    #[serde(default)]
    pub false_positive: Option<bool>,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    #[serde(default)]
    pub message_content: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub channel_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl Violation {
    pub fn is_reviewed(&self) -> bool {
        self.false_positive.is_some()
    }
}

/// Violation list (`/violations?limit=`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ViolationPage {
    #[serde(default)]
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub total_count: Option<u64>,
}

impl ViolationPage {
    /// Remove duplicate rows and order newest first.
    ///
    /// Two rows are duplicates when id, creation time, author and type all match.
    pub fn normalized(mut self) -> Self {
        let mut seen = HashSet::new();
        self.violations.retain(|v| {
            seen.insert((
                v.id,
                v.created_at,
                v.user_id.clone(),
                v.violation_type.clone(),
            ))
        });
        self.violations
            .sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self
    }

    pub fn unreviewed(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| !v.is_reviewed())
    }
}

/// Community health (`/health`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HealthReport {
    #[serde(default)]
    pub health_score: f64,
    #[serde(default)]
    pub trend: f64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// What the adaptive model has learned from feedback (`/insights`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LearningInsights {
    #[serde(default)]
    pub health_score: f64,
    #[serde(default)]
    pub toxicity_trend: f64,
    #[serde(default)]
    pub total_violations: u64,
    #[serde(default)]
    pub violation_types: BTreeMap<String, u64>,
    #[serde(default)]
    pub average_confidence: f64,
    #[serde(default)]
    pub false_positive_rate: f64,
    #[serde(default)]
    pub current_thresholds: BTreeMap<String, f64>,
    #[serde(default)]
    pub recommendations: Vec<serde_json::Value>,
}

/// Everything the overview page shows at once (`/dashboard`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DashboardData {
    #[serde(default)]
    pub server_stats: ServerStats,
    #[serde(default)]
    pub recent_analytics: Vec<AnalyticsPoint>,
    #[serde(default)]
    pub recent_violations: Vec<Violation>,
    #[serde(default)]
    pub health_score: f64,
    #[serde(default)]
    pub violation_trends: BTreeMap<String, u64>,
}

/// A fetched dataset, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum DatasetPayload {
    Dashboard(DashboardData),
    Stats(ServerStats),
    Analytics(AnalyticsSeries),
    Violations(ViolationPage),
    LearningInsights(LearningInsights),
    HealthScore(HealthReport),
}

impl DatasetPayload {
    pub fn kind(&self) -> DatasetKind {
        match self {
            Self::Dashboard(_) => DatasetKind::Dashboard,
            Self::Stats(_) => DatasetKind::Stats,
            Self::Analytics(_) => DatasetKind::Analytics,
            Self::Violations(_) => DatasetKind::Violations,
            Self::LearningInsights(_) => DatasetKind::LearningInsights,
            Self::HealthScore(_) => DatasetKind::HealthScore,
        }
    }

    /// Decode a backend response body for `kind`.
    pub fn decode(kind: DatasetKind, body: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            DatasetKind::Dashboard => Self::Dashboard(serde_json::from_value(body)?),
            DatasetKind::Stats => Self::Stats(serde_json::from_value(body)?),
            DatasetKind::Analytics => Self::Analytics(serde_json::from_value(body)?),
            DatasetKind::Violations => {
                let page: ViolationPage = serde_json::from_value(body)?;
                Self::Violations(page.normalized())
            }
            DatasetKind::LearningInsights => {
                Self::LearningInsights(serde_json::from_value(body)?)
            }
            DatasetKind::HealthScore => Self::HealthScore(serde_json::from_value(body)?),
        })
    }

    /// Health score carried by this payload, when it has one.
    pub fn health_score(&self) -> Option<f64> {
        match self {
            Self::Dashboard(d) => Some(d.health_score),
            Self::Stats(s) => Some(s.health_score),
            Self::LearningInsights(i) => Some(i.health_score),
            Self::HealthScore(h) => Some(h.health_score),
            Self::Analytics(_) | Self::Violations(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn violation(id: i64, minute: u32, user: &str) -> Violation {
        Violation {
            id: ViolationId::new(id),
            violation_type: "toxicity".to_string(),
            confidence_score: 0.8,
            action_taken: "warn".to_string(),
            false_positive: None,
            created_at: Some(Utc.with_ymd_and_hms(2025, 8, 1, 12, minute, 0).unwrap()),
            message_content: None,
            username: None,
            channel_name: None,
            user_id: Some(user.to_string()),
        }
    }

    #[test]
    fn test_params_normalize_to_backend_defaults() {
        assert_eq!(
            QueryParams::none().normalized_for(DatasetKind::Analytics),
            QueryParams::days(7)
        );
        assert_eq!(
            QueryParams::none().normalized_for(DatasetKind::Violations),
            QueryParams::limit(50)
        );
        assert_eq!(
            QueryParams::days(30).normalized_for(DatasetKind::HealthScore),
            QueryParams::none()
        );
    }

    #[test]
    fn test_kind_from_str_accepts_path_names() {
        assert_eq!("insights".parse::<DatasetKind>(), Ok(DatasetKind::LearningInsights));
        assert_eq!("health_score".parse::<DatasetKind>(), Ok(DatasetKind::HealthScore));
        assert!("settings".parse::<DatasetKind>().is_err());
        for kind in DatasetKind::ALL {
            assert_eq!(kind.as_str().parse::<DatasetKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_feedback_dependent_kinds() {
        assert!(DatasetKind::Violations.is_feedback_dependent());
        assert!(DatasetKind::LearningInsights.is_feedback_dependent());
        assert!(DatasetKind::HealthScore.is_feedback_dependent());
        assert!(!DatasetKind::Analytics.is_feedback_dependent());
        assert!(!DatasetKind::Dashboard.is_feedback_dependent());
        assert!(DatasetKind::FEEDBACK_SUMMARIES.contains(&DatasetKind::Dashboard));
    }

    #[test]
    fn test_stats_derived_values() {
        let stats = ServerStats {
            total_messages: 200,
            total_violations: 10,
            false_positives: 2,
            health_score: 0.75,
            ..Default::default()
        };
        assert!((stats.violation_rate() - 0.05).abs() < f64::EPSILON);
        assert!((stats.accuracy() - 0.8).abs() < 1e-9);
        assert!(stats.is_healthy());

        let empty = ServerStats::default();
        assert_eq!(empty.violation_rate(), 0.0);
        assert_eq!(empty.accuracy(), 1.0);
        assert!(!empty.is_healthy());
    }

    #[test]
    fn test_violation_page_normalized_dedups_and_sorts() {
        let page = ViolationPage {
            violations: vec![
                violation(1, 0, "u1"),
                violation(2, 5, "u2"),
                violation(1, 0, "u1"),
                violation(3, 3, "u3"),
            ],
            total_count: None,
        }
        .normalized();

        let ids: Vec<i64> = page.violations.iter().map(|v| v.id.get()).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_decode_dispatches_on_kind() {
        let body = serde_json::json!({"health_score": 0.66, "trend": -0.1, "status": "fair", "recommendations": []});
        let payload = DatasetPayload::decode(DatasetKind::HealthScore, body).unwrap();
        assert_eq!(payload.kind(), DatasetKind::HealthScore);
        assert_eq!(payload.health_score(), Some(0.66));
    }

    mod props {
        use super::super::*;
        use proptest::prelude::*;

        fn arb_kind() -> impl Strategy<Value = DatasetKind> {
            prop::sample::select(DatasetKind::ALL.to_vec())
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(100))]

            /// Normalizing twice addresses the same cache entry as normalizing once.
            #[test]
            fn prop_params_normalization_is_idempotent(
                kind in arb_kind(),
                days in prop::option::of(1u32..365),
                limit in prop::option::of(1u32..500),
            ) {
                let once = QueryParams { days, limit }.normalized_for(kind);
                prop_assert_eq!(once.normalized_for(kind), once);
            }

            #[test]
            fn prop_kind_names_parse_back(kind in arb_kind()) {
                prop_assert_eq!(kind.as_str().parse::<DatasetKind>(), Ok(kind));
                prop_assert_eq!(kind.path_segment().parse::<DatasetKind>(), Ok(kind));
            }

            #[test]
            fn prop_violation_rate_is_fraction(messages in 0u64..1_000_000, violations in 0u64..1_000_000) {
                let stats = ServerStats {
                    total_messages: messages,
                    total_violations: violations.min(messages),
                    ..Default::default()
                };
                let rate = stats.violation_rate();
                prop_assert!((0.0..=1.0).contains(&rate));
            }
        }
    }
}
