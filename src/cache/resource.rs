//! Per-resource-type cache facade.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::application::pagination::PageRequest;
use crate::application::source::ListRequest;
use crate::domain::resource::ResourceType;
use crate::domain::tenant::Scope;

use super::context::CacheContext;
use super::detail::{DetailCache, ListDetailByIds, RefreshDetailByIds};
use super::error::CacheError;
use super::events::{ChangeEvent, Envelope};
use super::id_list::{IdListCache, IdListSpec, ListState, RefreshOutcome};
use super::ingest::ChangeIngestor;
use super::registry::FullSyncCondRegistry;
use super::unique_key::{ListDetailByUniqueKey, UniqueKeyIndex};

/// Page through the records one tenant owns.
#[derive(Debug, Clone)]
pub struct ListDetail {
    pub sub_res: Option<String>,
    /// Owner tenant whose system id-list is read.
    pub owner: String,
    pub page: PageRequest,
    pub fields: Vec<String>,
    pub scope: Scope,
    pub with_count: bool,
}

impl ListDetail {
    pub fn new(owner: impl Into<String>, page: PageRequest, scope: Scope) -> Self {
        Self {
            sub_res: None,
            owner: owner.into(),
            page,
            fields: Vec::new(),
            scope,
            with_count: false,
        }
    }

    pub fn with_sub_res(mut self, sub_res: impl Into<String>) -> Self {
        self.sub_res = Some(sub_res.into());
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_count(mut self) -> Self {
        self.with_count = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListDetailPage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    pub details: Vec<String>,
}

pub struct ResourceCache {
    ctx: CacheContext,
    detail: Arc<DetailCache>,
    unique: UniqueKeyIndex,
    id_lists: Arc<IdListCache>,
    ingestor: Arc<ChangeIngestor>,
}

impl ResourceCache {
    pub(crate) fn new(ctx: CacheContext, registry: Arc<FullSyncCondRegistry>) -> Self {
        let detail = Arc::new(DetailCache::new(ctx.clone()));
        let id_lists = Arc::new(IdListCache::new(ctx.clone()));
        Self {
            unique: UniqueKeyIndex::new(ctx.clone(), Arc::clone(&detail)),
            ingestor: Arc::new(ChangeIngestor::new(
                ctx.clone(),
                Arc::clone(&id_lists),
                registry,
            )),
            ctx,
            detail,
            id_lists,
        }
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn resource(&self) -> &ResourceType {
        &self.ctx.resource
    }

    pub async fn list_detail_by_ids(&self, opts: &ListDetailByIds) -> Result<Vec<String>, CacheError> {
        self.detail.list_by_ids(opts).await
    }

    pub async fn list_detail_by_unique_key(
        &self,
        opts: &ListDetailByUniqueKey,
    ) -> Result<Vec<String>, CacheError> {
        self.unique.list_detail(opts).await
    }

    /// List from the owner's system id-list, or straight from the primary
    /// store when that list is not materialized.
    pub async fn list_detail(&self, opts: &ListDetail) -> Result<ListDetailPage, CacheError> {
        let spec = self.system_list(opts.sub_res.as_deref(), &opts.owner)?;
        if !self.ctx.resource.cache_all() {
            opts.page.validate(self.ctx.config.max_page_limit)?;
            return self
                .bypass(&spec, &opts.page, &opts.fields, &opts.scope, opts.with_count)
                .await;
        }
        self.serve(&spec, &opts.page, &opts.fields, &opts.scope, opts.with_count)
            .await
    }

    /// Number of records the owner holds.
    pub async fn count(&self, sub_res: Option<&str>, owner: &str) -> Result<u64, CacheError> {
        let spec = self.system_list(sub_res, owner)?;
        if self.ctx.resource.cache_all() && self.id_lists.ensure(&spec).await?.is_servable() {
            return self.id_lists.count(&spec.key).await;
        }

        let request = ListRequest {
            sub_res: spec.sub_res.clone(),
            tenant: spec.tenant.clone(),
            condition: None,
            page: PageRequest::first(1),
            only_ids: true,
            with_count: true,
        };
        let listed = self.ctx.source.list(&request).await?;
        Ok(listed.count.unwrap_or(listed.records.len() as u64))
    }

    /// Rebuild an owner's system id-list in the background.
    pub async fn refresh_id_list(
        &self,
        sub_res: Option<&str>,
        owner: &str,
    ) -> Result<RefreshOutcome, CacheError> {
        self.require_cache_all()?;
        let spec = self.system_list(sub_res, owner)?;
        self.id_lists.try_refresh(spec).await
    }

    pub async fn refresh_detail_by_ids(&self, opts: &RefreshDetailByIds) -> Result<usize, CacheError> {
        self.detail.refresh_by_ids(opts).await
    }

    /// Apply change-feed records directly, bypassing the event queue.
    pub async fn apply_changes(&self, changes: Vec<ChangeEvent>) -> Result<usize, CacheError> {
        let events = changes
            .into_iter()
            .enumerate()
            .map(|(epoch, change)| Envelope::new(epoch as u64, change))
            .collect();
        self.ingestor.apply(events).await
    }

    pub async fn id_list_state(&self, sub_res: Option<&str>, owner: &str) -> Result<ListState, CacheError> {
        self.require_cache_all()?;
        let spec = self.system_list(sub_res, owner)?;
        self.id_lists.state(&spec.key, spec.ttl).await
    }

    pub(crate) fn ingestor(&self) -> Arc<ChangeIngestor> {
        Arc::clone(&self.ingestor)
    }

    pub(crate) fn id_lists(&self) -> &Arc<IdListCache> {
        &self.id_lists
    }

    pub(crate) async fn serve(
        &self,
        spec: &IdListSpec,
        page: &PageRequest,
        fields: &[String],
        scope: &Scope,
        with_count: bool,
    ) -> Result<ListDetailPage, CacheError> {
        page.validate(self.ctx.config.max_page_limit)?;

        let state = self.id_lists.ensure(spec).await?;
        if !state.is_servable() {
            return self.bypass(spec, page, fields, scope, with_count).await;
        }

        let ids = self.id_lists.list_ids(&spec.key, page).await?;
        let count = if with_count {
            Some(self.id_lists.count(&spec.key).await?)
        } else {
            None
        };
        let details = if ids.is_empty() {
            Vec::new()
        } else {
            self.detail
                .list_by_ids(&ListDetailByIds {
                    sub_res: spec.sub_res.clone(),
                    ids,
                    fields: fields.to_vec(),
                    scope: scope.clone(),
                })
                .await?
        };
        Ok(ListDetailPage { count, details })
    }

    async fn bypass(
        &self,
        spec: &IdListSpec,
        page: &PageRequest,
        fields: &[String],
        scope: &Scope,
        with_count: bool,
    ) -> Result<ListDetailPage, CacheError> {
        debug!(resource = self.name(), id_list_key = %spec.key, "Id-list not materialized, reading primary store");
        let request = ListRequest {
            sub_res: spec.sub_res.clone(),
            tenant: spec.tenant.clone(),
            condition: spec.condition.clone(),
            page: page.clone(),
            only_ids: false,
            with_count,
        };
        let listed = self.ctx.source.list(&request).await?;

        let mut details = Vec::with_capacity(listed.records.len());
        for record in &listed.records {
            match self.detail.render_record(record, scope, fields) {
                Ok(Some(rendered)) => details.push(rendered),
                Ok(None) => {}
                Err(err) => warn!(resource = self.name(), error = %err, "Skipping malformed listed record"),
            }
        }
        Ok(ListDetailPage {
            count: listed.count,
            details,
        })
    }

    fn require_cache_all(&self) -> Result<(), CacheError> {
        if self.ctx.resource.cache_all() {
            return Ok(());
        }
        Err(CacheError::validation(format!(
            "{} does not keep system id-lists",
            self.name()
        )))
    }

    fn system_list(&self, sub_res: Option<&str>, owner: &str) -> Result<IdListSpec, CacheError> {
        self.ctx.resource.check_sub_resource(sub_res)?;
        if owner.is_empty() {
            return Err(CacheError::validation("owner tenant is required"));
        }
        Ok(self.ctx.system_list(sub_res, owner))
    }
}
