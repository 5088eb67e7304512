//! Management of persisted full-sync conditions.
//!
//! Writes go to the condition store only; the registry learns about them
//! through the store's change feed.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::application::cond_store::{CondQuery, FullSyncCondStore};
use crate::domain::filter::ExprLimits;
use crate::domain::full_sync_cond::{FullSyncCond, NewFullSyncCond, check_interval};
use crate::domain::resource::ResourceType;

use super::config::CacheConfig;
use super::error::CacheError;

/// Selection of stored conditions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListFullSyncCond {
    pub resource: Option<String>,
    pub sub_resource: Option<String>,
    pub tenant: Option<String>,
    pub ids: Vec<i64>,
    pub offset: usize,
    pub limit: usize,
    pub with_count: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FullSyncCondPage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    pub conds: Vec<FullSyncCond>,
}

pub struct FullSyncCondService {
    store: Arc<dyn FullSyncCondStore>,
    resources: HashMap<String, Arc<ResourceType>>,
    config: Arc<CacheConfig>,
    limits: ExprLimits,
}

impl FullSyncCondService {
    pub fn new(
        store: Arc<dyn FullSyncCondStore>,
        resources: HashMap<String, Arc<ResourceType>>,
        config: Arc<CacheConfig>,
    ) -> Self {
        Self {
            store,
            resources,
            config,
            limits: ExprLimits::default(),
        }
    }

    pub async fn create(&self, cond: NewFullSyncCond) -> Result<FullSyncCond, CacheError> {
        cond.validate(&self.limits)?;
        let resource = self.resources.get(&cond.resource).ok_or_else(|| {
            CacheError::validation(format!("resource `{}` is not cached", cond.resource))
        })?;
        resource.check_sub_resource(cond.sub_resource.as_deref())?;

        if cond.is_all {
            let existing = self
                .store
                .count(&CondQuery {
                    resource: Some(cond.resource.clone()),
                    sub_resource: cond.sub_resource.clone(),
                    tenant: Some(cond.tenant.clone()),
                    is_all: Some(true),
                    ..CondQuery::default()
                })
                .await?;
            if existing > 0 {
                return Err(CacheError::validation(format!(
                    "an is_all condition already exists for {} / {} / {}",
                    cond.resource,
                    cond.sub_resource.as_deref().unwrap_or("-"),
                    cond.tenant
                )));
            }
        } else {
            let existing = self
                .store
                .count(&CondQuery {
                    is_all: Some(false),
                    ..CondQuery::default()
                })
                .await?;
            if existing >= self.config.max_non_all_conditions as u64 {
                return Err(CacheError::validation(format!(
                    "at most {} filtered conditions may exist",
                    self.config.max_non_all_conditions
                )));
            }
        }

        let created = self.store.insert(cond).await?;
        info!(
            cond_id = created.id,
            resource = %created.resource,
            tenant = %created.tenant,
            is_all = created.is_all,
            "Full sync cond created"
        );
        Ok(created)
    }

    /// Change a condition's refresh interval. The filter itself is immutable.
    pub async fn update(&self, id: i64, interval: u32) -> Result<FullSyncCond, CacheError> {
        check_interval(interval)?;
        let updated = self.store.update_interval(id, interval).await?;
        info!(cond_id = id, interval, "Full sync cond interval updated");
        Ok(updated)
    }

    pub async fn delete(&self, id: i64) -> Result<FullSyncCond, CacheError> {
        let deleted = self.store.delete(id).await?;
        info!(cond_id = id, resource = %deleted.resource, "Full sync cond deleted");
        Ok(deleted)
    }

    pub async fn get(&self, id: i64) -> Result<FullSyncCond, CacheError> {
        self.store
            .find(&CondQuery {
                ids: vec![id],
                ..CondQuery::default()
            })
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CacheError::not_found("full sync cond", id.to_string()))
    }

    pub async fn list(&self, opts: &ListFullSyncCond) -> Result<FullSyncCondPage, CacheError> {
        if opts.limit == 0 || opts.limit > self.config.max_page_limit {
            return Err(CacheError::validation(format!(
                "limit must be within 1..={}, got {}",
                self.config.max_page_limit, opts.limit
            )));
        }

        let query = CondQuery {
            resource: opts.resource.clone(),
            sub_resource: opts.sub_resource.clone(),
            tenant: opts.tenant.clone(),
            is_all: None,
            ids: opts.ids.clone(),
            offset: opts.offset,
            limit: Some(opts.limit),
        };
        let count = if opts.with_count {
            Some(self.store.count(&query).await?)
        } else {
            None
        };
        let conds = self.store.find(&query).await?;
        Ok(FullSyncCondPage { count, conds })
    }
}
