//! Tenant registry.
//!
//! Tenants are read-mostly configuration maintained by an external admin
//! interface; this module only defines the shape the connection manager
//! consumes and a static in-process registry for single-tenant deployments
//! and tests.

use async_trait::async_trait;
use dashmap::DashMap;

use objectstack_core::{StorageError, StorageResult, TenantId};

/// Per-tenant configuration consumed by the gateway.
#[derive(Debug, Clone)]
pub struct TenantConfig {
    /// The tenant id.
    pub id: TenantId,
    /// Connection string of the tenant's metadata database.
    pub db_url: String,
    /// Secret used to verify and mint this tenant's tokens.
    pub jwt_secret: String,
    /// Global upload size ceiling for this tenant, bytes.
    pub file_size_limit: u64,
    /// Cap on buckets this tenant may create, when enforced.
    pub max_buckets: Option<i64>,
    /// Feature switches (e.g. image transformation) as opaque flags.
    pub features: serde_json::Value,
}

/// Source of tenant configuration.
///
/// Multi-tenant deployments back this with the shared admin database (an
/// external collaborator); single-tenant deployments use
/// [`StaticTenantRegistry`].
#[async_trait]
pub trait TenantRegistry: Send + Sync + std::fmt::Debug + 'static {
    /// Resolve a tenant's configuration.
    async fn get(&self, id: &TenantId) -> StorageResult<TenantConfig>;
}

/// In-process registry with a fixed tenant set.
#[derive(Debug, Default)]
pub struct StaticTenantRegistry {
    tenants: DashMap<String, TenantConfig>,
}

impl StaticTenantRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding exactly one tenant.
    #[must_use]
    pub fn single(tenant: TenantConfig) -> Self {
        let registry = Self::new();
        registry.insert(tenant);
        registry
    }

    /// Add or replace a tenant.
    pub fn insert(&self, tenant: TenantConfig) {
        self.tenants.insert(tenant.id.as_str().to_owned(), tenant);
    }
}

#[async_trait]
impl TenantRegistry for StaticTenantRegistry {
    async fn get(&self, id: &TenantId) -> StorageResult<TenantConfig> {
        self.tenants
            .get(id.as_str())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::InvalidParameter {
                message: format!("unknown tenant: {id}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(id: &str) -> TenantConfig {
        TenantConfig {
            id: TenantId::new(id),
            db_url: "postgresql://localhost/t".to_owned(),
            jwt_secret: "secret".to_owned(),
            file_size_limit: 1024,
            max_buckets: None,
            features: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_should_resolve_registered_tenant() {
        let registry = StaticTenantRegistry::single(tenant("t1"));
        let resolved = registry.get(&TenantId::new("t1")).await.unwrap();
        assert_eq!(resolved.file_size_limit, 1024);
    }

    #[tokio::test]
    async fn test_should_reject_unknown_tenant() {
        let registry = StaticTenantRegistry::new();
        let result = registry.get(&TenantId::new("ghost")).await;
        assert!(matches!(
            result,
            Err(StorageError::InvalidParameter { .. })
        ));
    }
}
