//! Tenant identity and record visibility.

/// Tenant owning records that every tenant may read.
pub const DEFAULT_TENANT: &str = "0";

/// Tenant that may read records of every other tenant.
pub const SUPER_TENANT: &str = "superadmin";

pub fn is_default_tenant(tenant: &str) -> bool {
    tenant.is_empty() || tenant == DEFAULT_TENANT
}

pub fn is_super_tenant(tenant: &str) -> bool {
    tenant == SUPER_TENANT
}

/// Identity a lookup is performed on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    tenant: String,
    system: bool,
}

impl Scope {
    pub fn tenant(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            system: false,
        }
    }

    /// Internal callers that bypass tenant checks entirely.
    pub fn system() -> Self {
        Self {
            tenant: SUPER_TENANT.to_string(),
            system: true,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant
    }

    pub fn is_system(&self) -> bool {
        self.system
    }

    pub fn can_see(&self, record_tenant: &str) -> bool {
        self.system
            || is_super_tenant(&self.tenant)
            || is_default_tenant(record_tenant)
            || record_tenant == self.tenant
    }
}
