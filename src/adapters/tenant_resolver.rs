//! Tenant Resolver Adapter
//!
//! Implements the `TenantResolver` port from a fixed, reloadable tenant list.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::ports::{TenantId, TenantResolver};
use crate::error::Result;

/// Tenant resolver backed by a configured list of tenants.
#[derive(Debug, Default)]
pub struct StaticTenantResolver {
    tenants: RwLock<Vec<TenantId>>,
}

impl StaticTenantResolver {
    pub fn new<I, T>(tenants: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TenantId>,
    {
        let resolver = Self::default();
        resolver.replace(tenants);
        resolver
    }

    /// Replace the tenant list, dropping duplicates.
    pub fn replace<I, T>(&self, tenants: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<TenantId>,
    {
        let mut list: Vec<TenantId> = tenants.into_iter().map(Into::into).collect();
        list.sort();
        list.dedup();
        *self.tenants.write() = list;
    }

    /// Register a tenant that just became ready.
    pub fn add(&self, tenant: TenantId) {
        let mut tenants = self.tenants.write();
        if let Err(pos) = tenants.binary_search(&tenant) {
            tenants.insert(pos, tenant);
        }
    }
}

#[async_trait]
impl TenantResolver for StaticTenantResolver {
    async fn active_tenants(&self) -> Result<Vec<TenantId>> {
        Ok(self.tenants.read().clone())
    }
}
