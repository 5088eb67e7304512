//! Persistence of full-sync conditions.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::full_sync_cond::{FullSyncCond, NewFullSyncCond};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CondStoreError {
    #[error("condition store error: {0}")]
    Persistence(String),
    #[error("full sync cond {id} not found")]
    NotFound { id: i64 },
}

impl CondStoreError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Selection over stored conditions. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CondQuery {
    pub resource: Option<String>,
    pub sub_resource: Option<String>,
    pub tenant: Option<String>,
    pub is_all: Option<bool>,
    pub ids: Vec<i64>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl CondQuery {
    pub fn admits(&self, cond: &FullSyncCond) -> bool {
        self.resource
            .as_deref()
            .is_none_or(|resource| resource == cond.resource)
            && self
                .sub_resource
                .as_deref()
                .is_none_or(|sub| cond.sub_resource.as_deref() == Some(sub))
            && self
                .tenant
                .as_deref()
                .is_none_or(|tenant| tenant == cond.tenant)
            && self.is_all.is_none_or(|is_all| is_all == cond.is_all)
            && (self.ids.is_empty() || self.ids.contains(&cond.id))
    }
}

#[async_trait]
pub trait FullSyncCondStore: Send + Sync {
    /// Persist a new condition and assign its id.
    async fn insert(&self, cond: NewFullSyncCond) -> Result<FullSyncCond, CondStoreError>;

    async fn update_interval(&self, id: i64, interval: u32)
    -> Result<FullSyncCond, CondStoreError>;

    async fn delete(&self, id: i64) -> Result<FullSyncCond, CondStoreError>;

    /// Matching conditions ordered by id, honoring `offset` and `limit`.
    async fn find(&self, query: &CondQuery) -> Result<Vec<FullSyncCond>, CondStoreError>;

    async fn count(&self, query: &CondQuery) -> Result<u64, CondStoreError>;
}
