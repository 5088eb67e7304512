//! Secondary index from business-unique keys to id keys.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tracing::debug;

use crate::application::source::UniqueKeyResolver;
use crate::domain::tenant::Scope;
use crate::infra::kv::Pipeline;

use super::context::CacheContext;
use super::detail::{DetailCache, ListDetailByIds, NEGATIVE_ENTRY, WriteMode};
use super::error::CacheError;
use super::lock::Acquire;

#[derive(Debug, Clone)]
pub struct ListDetailByUniqueKey {
    pub key_type: String,
    pub keys: Vec<String>,
    pub sub_res: Option<String>,
    pub fields: Vec<String>,
    pub scope: Scope,
}

impl ListDetailByUniqueKey {
    pub fn new<I, S>(key_type: impl Into<String>, keys: I, scope: Scope) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key_type: key_type.into(),
            keys: keys.into_iter().map(Into::into).collect(),
            sub_res: None,
            fields: Vec::new(),
            scope,
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
}

pub(crate) struct UniqueKeyIndex {
    ctx: CacheContext,
    detail: Arc<DetailCache>,
}

impl UniqueKeyIndex {
    pub fn new(ctx: CacheContext, detail: Arc<DetailCache>) -> Self {
        Self { ctx, detail }
    }

    pub async fn list_detail(&self, opts: &ListDetailByUniqueKey) -> Result<Vec<String>, CacheError> {
        // Checked before any lookup can stage writes under the wrong shape.
        self.ctx.resource.check_sub_resource(opts.sub_res.as_deref())?;
        let resolver = self.ctx.resolver(&opts.key_type).cloned().ok_or_else(|| {
            CacheError::validation(format!(
                "{} has no unique key type `{}`",
                self.ctx.name(),
                opts.key_type
            ))
        })?;
        let keys = self.check_keys(&opts.keys)?;

        let store_keys: Vec<String> = keys
            .iter()
            .map(|key| self.ctx.keys.unique_key(&opts.key_type, key))
            .collect();
        let cached = self.ctx.kv.mget(&store_keys).await?;

        let mut resolved: HashMap<String, String> = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();
        for (key, value) in keys.iter().zip(cached) {
            match value {
                Some(value) if value == NEGATIVE_ENTRY => {}
                Some(id_key) => {
                    resolved.insert(key.clone(), id_key);
                }
                None => missing.push(key.clone()),
            }
        }

        if !missing.is_empty() {
            let fetched = self
                .fetch_missing(&resolver, opts.sub_res.as_deref(), &missing)
                .await?;
            resolved.extend(fetched);
        }

        let mut seen = HashSet::new();
        let ids: Vec<String> = keys
            .iter()
            .filter_map(|key| resolved.get(key))
            .filter(|id_key| seen.insert(id_key.as_str()))
            .cloned()
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        self.detail
            .list_by_ids(&ListDetailByIds {
                sub_res: opts.sub_res.clone(),
                ids,
                fields: opts.fields.clone(),
                scope: opts.scope.clone(),
            })
            .await
    }

    async fn fetch_missing(
        &self,
        resolver: &Arc<dyn UniqueKeyResolver>,
        sub_res: Option<&str>,
        missing: &[String],
    ) -> Result<HashMap<String, String>, CacheError> {
        let key_type = resolver.key_type();
        let mut guards = Vec::new();
        let mut leading = Vec::new();
        let mut waiters = Vec::new();
        let mut following = Vec::new();
        for key in missing {
            match self.ctx.lock.acquire(&self.ctx.keys.unique_key(key_type, key)) {
                Acquire::Leader(guard) => {
                    guards.push(guard);
                    leading.push(key.clone());
                }
                Acquire::Follower(waiter) => {
                    waiters.push(waiter);
                    following.push(key.clone());
                }
            }
        }

        let mut resolved = HashMap::new();
        if !leading.is_empty() {
            let records = resolver.get_by_unique_keys(&leading).await?;
            let mut pipeline = Pipeline::new();
            let staged = self
                .detail
                .stage_records(&mut pipeline, sub_res, &records, WriteMode::IfAbsent);

            let wanted: HashSet<&str> = leading.iter().map(String::as_str).collect();
            for record in &staged {
                for (typ, key) in &record.unique {
                    if typ == key_type && wanted.contains(key.as_str()) {
                        resolved.insert(key.clone(), record.id_key.clone());
                    }
                }
            }

            let mut absent = 0usize;
            for key in leading.iter().filter(|key| !resolved.contains_key(key.as_str())) {
                pipeline.set_nx(
                    self.ctx.keys.unique_key(key_type, key),
                    NEGATIVE_ENTRY,
                    self.ctx.entry_ttl(),
                );
                absent += 1;
            }
            self.ctx.kv.exec(pipeline).await?;

            debug!(
                resource = self.ctx.name(),
                key_type,
                fetched = staged.len(),
                absent,
                "Resolved unique keys from primary store"
            );
        }
        drop(guards);

        if !waiters.is_empty() {
            let wait = self.ctx.config.follower_wait();
            join_all(waiters.into_iter().map(|waiter| waiter.wait(wait))).await;

            let store_keys: Vec<String> = following
                .iter()
                .map(|key| self.ctx.keys.unique_key(key_type, key))
                .collect();
            let values = self.ctx.kv.mget(&store_keys).await?;
            for (key, value) in following.into_iter().zip(values) {
                if let Some(id_key) = value.filter(|id_key| id_key != NEGATIVE_ENTRY) {
                    resolved.insert(key, id_key);
                }
            }
        }

        Ok(resolved)
    }

    fn check_keys(&self, keys: &[String]) -> Result<Vec<String>, CacheError> {
        if keys.is_empty() {
            return Err(CacheError::validation("unique keys are required"));
        }
        if keys.len() > self.ctx.config.max_request_ids {
            return Err(CacheError::validation(format!(
                "at most {} unique keys may be requested, got {}",
                self.ctx.config.max_request_ids,
                keys.len()
            )));
        }
        let mut seen = HashSet::with_capacity(keys.len());
        let mut unique = Vec::with_capacity(keys.len());
        for key in keys {
            if key.is_empty() {
                return Err(CacheError::validation("unique key must not be empty"));
            }
            if seen.insert(key.as_str()) {
                unique.push(key.clone());
            }
        }
        Ok(unique)
    }
}
