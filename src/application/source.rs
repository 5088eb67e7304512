//! Capabilities a resource type provides to query the primary document store.
//!
//! One [`ResourceSource`] is registered per resource type; the cache never
//! interprets the primary store's query language beyond what is carried in a
//! [`ListRequest`].

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::application::pagination::PageRequest;
use crate::domain::filter::Expression;
use crate::domain::resource::BasicInfo;
use crate::domain::tenant::{is_default_tenant, is_super_tenant};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("primary store query failed: {message}")]
    Query { message: String },
    #[error("record could not be parsed: {message}")]
    Parse { message: String },
}

impl SourceError {
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }
}

/// Which owners' records a listing covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TenantFilter {
    #[default]
    Any,
    /// Records owned by exactly this tenant.
    Owner(String),
    /// Records owned by this tenant or by the default tenant.
    VisibleTo(String),
}

impl TenantFilter {
    /// Filter used when materializing a full-sync condition of `tenant`.
    pub fn for_condition(tenant: &str) -> Self {
        if is_super_tenant(tenant) {
            Self::Any
        } else {
            Self::VisibleTo(tenant.to_string())
        }
    }

    pub fn admits(&self, record_tenant: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Owner(owner) => owner == record_tenant,
            Self::VisibleTo(tenant) => is_default_tenant(record_tenant) || tenant == record_tenant,
        }
    }
}

/// Listing query against the primary store.
///
/// Records come back ascending by id (numeric resources) or oid (opaque
/// resources); `page.cursor` is exclusive.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub sub_res: Option<String>,
    pub tenant: TenantFilter,
    pub condition: Option<Expression>,
    pub page: PageRequest,
    /// Only identity fields are needed.
    pub only_ids: bool,
    /// Also return the total number of matching records.
    pub with_count: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub count: Option<u64>,
    pub records: Vec<Value>,
}

#[async_trait]
pub trait ResourceSource: Send + Sync {
    /// Extract identity from a raw record.
    fn parse(&self, record: &Value) -> Result<BasicInfo, SourceError>;

    /// Fetch records by id key. Missing ids are simply absent from the result.
    async fn get_by_keys(
        &self,
        sub_res: Option<&str>,
        id_keys: &[String],
    ) -> Result<Vec<Value>, SourceError>;

    async fn list(&self, request: &ListRequest) -> Result<ListPage, SourceError>;
}

/// A business-unique key of a resource type (e.g. a host's inner IP and cloud).
#[async_trait]
pub trait UniqueKeyResolver: Send + Sync {
    fn key_type(&self) -> &str;

    /// Unique keys of this type carried by `record`.
    fn derive_keys(&self, record: &Value, info: &BasicInfo) -> Result<Vec<String>, SourceError>;

    async fn get_by_unique_keys(&self, keys: &[String]) -> Result<Vec<Value>, SourceError>;
}
