//! Tenant-scoped cache keys.
//!
//! A `CacheKey` can only be built with a tenant id, so no entry exists
//! outside a tenant's partition.

use safespace_core::{DatasetKind, QueryParams, TenantId};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    inner: KeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct KeyInner {
    tenant_id: TenantId,
    kind: DatasetKind,
    params: QueryParams,
}

impl CacheKey {
    /// Parameters are normalized for `kind`, so `days: None` and the
    /// backend default address the same entry.
    pub fn new(tenant_id: TenantId, kind: DatasetKind, params: QueryParams) -> Self {
        Self {
            inner: KeyInner {
                tenant_id,
                kind,
                params: params.normalized_for(kind),
            },
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.inner.tenant_id
    }

    pub fn kind(&self) -> DatasetKind {
        self.inner.kind
    }

    pub fn params(&self) -> QueryParams {
        self.inner.params
    }

    pub fn belongs_to(&self, tenant_id: &TenantId) -> bool {
        &self.inner.tenant_id == tenant_id
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.inner.tenant_id, self.inner.kind)?;
        match (self.inner.params.days, self.inner.params.limit) {
            (Some(days), _) => write!(f, "?days={}", days),
            (None, Some(limit)) => write!(f, "?limit={}", limit),
            (None, None) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_share_a_key() {
        let a = CacheKey::new(TenantId::from("A"), DatasetKind::Analytics, QueryParams::none());
        let b = CacheKey::new(TenantId::from("A"), DatasetKind::Analytics, QueryParams::days(7));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "A/analytics?days=7");
    }

    #[test]
    fn test_tenants_never_share_keys() {
        let a = CacheKey::new(TenantId::from("A"), DatasetKind::Violations, QueryParams::none());
        let b = CacheKey::new(TenantId::from("B"), DatasetKind::Violations, QueryParams::none());
        assert_ne!(a, b);
        assert!(a.belongs_to(&TenantId::from("A")));
        assert!(!a.belongs_to(&TenantId::from("B")));
    }

    #[test]
    fn test_irrelevant_params_are_dropped() {
        let key = CacheKey::new(TenantId::from("A"), DatasetKind::HealthScore, QueryParams::limit(5));
        assert_eq!(key.params(), QueryParams::none());
        assert_eq!(key.to_string(), "A/health_score");
    }
}
